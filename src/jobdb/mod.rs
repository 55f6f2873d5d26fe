//! Transactional in-memory store of job snapshots.
//!
//! The committed state is a single `Arc<Store>` swapped atomically on commit.
//! Read transactions pin the snapshot that was current when they started and
//! never block. Write transactions clone the store maps (jobs themselves are
//! cheap to clone, their interiors are `Arc`-shared), mutate the copy, and
//! install it on commit. A single writer at a time is enforced by an async
//! mutex held for the lifetime of the write transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::OwnedMutexGuard;

use crate::error::{Result, SchedulerError};
use crate::proto::JobSchedulingInfo;

pub mod job;
pub mod reconciliation;

pub use job::{node_id_from_executor_and_node_name, Job, JobId, JobRun, RunId};
pub use reconciliation::{JobStateTransitions, RunStateTransitions};

#[derive(Clone, Default)]
struct Store {
    jobs: HashMap<JobId, Job>,
    jobs_by_run_id: HashMap<RunId, JobId>,
    queued_by_queue: BTreeMap<(Arc<str>, JobId), ()>,
}

struct Interner {
    cache: HashSet<Arc<str>>,
    capacity: usize,
}

impl Interner {
    fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(interned) = self.cache.get(s) {
            return Arc::clone(interned);
        }
        let interned: Arc<str> = Arc::from(s);
        if self.cache.len() < self.capacity {
            self.cache.insert(Arc::clone(&interned));
        }
        interned
    }
}

struct JobDbInner {
    state: RwLock<Arc<Store>>,
    write_gate: Arc<tokio::sync::Mutex<()>>,
    priority_classes: HashMap<String, i32>,
    default_priority_class: String,
    interner: Mutex<Interner>,
}

/// Factory and owner of all job snapshots. Jobs are constructed only through
/// [`JobDb::new_job`] / [`JobDb::create_run`] so the priority-class table and
/// the interned-string cache are applied consistently.
#[derive(Clone)]
pub struct JobDb {
    inner: Arc<JobDbInner>,
}

impl JobDb {
    pub fn new(
        priority_classes: HashMap<String, i32>,
        default_priority_class: String,
        interned_strings_cache_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(JobDbInner {
                state: RwLock::new(Arc::new(Store::default())),
                write_gate: Arc::new(tokio::sync::Mutex::new(())),
                priority_classes,
                default_priority_class,
                interner: Mutex::new(Interner {
                    cache: HashSet::new(),
                    capacity: interned_strings_cache_size,
                }),
            }),
        }
    }

    pub fn priority_classes(&self) -> &HashMap<String, i32> {
        &self.inner.priority_classes
    }

    /// The priority a run is scheduled at: the job's requested priority if it
    /// matches a configured priority class, otherwise the default class.
    pub fn scheduled_at_priority_for(&self, job: &Job) -> i32 {
        let requested = job.scheduling_info().priority;
        if self
            .inner
            .priority_classes
            .values()
            .any(|&p| p == requested)
        {
            requested
        } else {
            *self
                .inner
                .priority_classes
                .get(&self.inner.default_priority_class)
                .unwrap_or(&0)
        }
    }

    fn intern(&self, s: &str) -> Arc<str> {
        self.inner.interner.lock().unwrap().intern(s)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_job(
        &self,
        id: JobId,
        jobset: &str,
        queue: &str,
        priority: u32,
        scheduling_info: JobSchedulingInfo,
        queued: bool,
        queued_version: i32,
        cancel_requested: bool,
        cancel_by_jobset_requested: bool,
        cancelled: bool,
        submitted: i64,
    ) -> Job {
        Job::new(
            id,
            self.intern(jobset),
            self.intern(queue),
            priority,
            Arc::new(scheduling_info),
            queued,
            queued_version,
            cancel_requested,
            cancel_by_jobset_requested,
            cancelled,
            submitted,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_run(
        &self,
        id: RunId,
        job_id: JobId,
        created: i64,
        executor: &str,
        node_name: &str,
        scheduled_at_priority: Option<i32>,
        pending: bool,
        running: bool,
        succeeded: bool,
        failed: bool,
        cancelled: bool,
        preempted: bool,
        returned: bool,
        run_attempted: bool,
    ) -> JobRun {
        let node_id = node_id_from_executor_and_node_name(executor, node_name);
        let run = JobRun::new(
            id,
            job_id,
            created,
            executor.to_string(),
            node_id,
            node_name.to_string(),
            scheduled_at_priority,
        );
        let run = run.with_pending(pending).with_running(running);
        let run = run.with_succeeded(succeeded).with_failed(failed);
        let run = run.with_cancelled(cancelled).with_preempted(preempted);
        run.with_returned(returned).with_attempted(run_attempted)
    }

    /// A consistent snapshot of the committed state.
    pub fn read_txn(&self) -> ReadTxn {
        ReadTxn {
            store: Arc::clone(&self.inner.state.read().unwrap()),
        }
    }

    /// The exclusive write transaction. Waits for any in-flight writer.
    /// Dropping the transaction without calling [`WriteTxn::commit`] discards
    /// every change staged in it.
    pub async fn write_txn(&self) -> WriteTxn {
        let gate = Arc::clone(&self.inner.write_gate).lock_owned().await;
        let store = (**self.inner.state.read().unwrap()).clone();
        WriteTxn {
            db: self.clone(),
            store,
            _gate: gate,
        }
    }
}

pub struct ReadTxn {
    store: Arc<Store>,
}

impl ReadTxn {
    pub fn get_by_id(&self, id: JobId) -> Option<&Job> {
        self.store.jobs.get(&id)
    }

    pub fn get_all(&self) -> Vec<Job> {
        self.store.jobs.values().cloned().collect()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.store.jobs.values()
    }

    pub fn job_id_by_run_id(&self, run_id: RunId) -> Option<JobId> {
        self.store.jobs_by_run_id.get(&run_id).copied()
    }

    pub fn job_by_run_id(&self, run_id: RunId) -> Option<&Job> {
        self.job_id_by_run_id(run_id)
            .and_then(|id| self.store.jobs.get(&id))
    }

    /// Queued jobs in one queue, in job-id (i.e. submission-ulid) order.
    pub fn queued_jobs<'a>(&'a self, queue: &str) -> impl Iterator<Item = &'a Job> + 'a {
        queued_in(&self.store, queue)
    }

    /// All queued jobs, grouped by queue and in id order within each queue.
    pub fn queued_jobs_ordered(&self) -> impl Iterator<Item = &Job> {
        queued_ordered(&self.store)
    }
}

fn queued_ordered(store: &Store) -> impl Iterator<Item = &Job> {
    store
        .queued_by_queue
        .keys()
        .filter_map(|(_, id)| store.jobs.get(id))
}

fn queued_in<'a>(store: &'a Store, queue: &str) -> impl Iterator<Item = &'a Job> + 'a {
    let queue: Arc<str> = Arc::from(queue);
    let lo = (Arc::clone(&queue), JobId::nil());
    store
        .queued_by_queue
        .range(lo..)
        .take_while(move |((q, _), _)| **q == *queue)
        .filter_map(|((_, id), _)| store.jobs.get(id))
}

pub struct WriteTxn {
    db: JobDb,
    store: Store,
    _gate: OwnedMutexGuard<()>,
}

impl WriteTxn {
    pub fn get_by_id(&self, id: JobId) -> Option<&Job> {
        self.store.jobs.get(&id)
    }

    pub fn get_all(&self) -> Vec<Job> {
        self.store.jobs.values().cloned().collect()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.store.jobs.values()
    }

    pub fn job_id_by_run_id(&self, run_id: RunId) -> Option<JobId> {
        self.store.jobs_by_run_id.get(&run_id).copied()
    }

    pub fn queued_jobs<'a>(&'a self, queue: &str) -> impl Iterator<Item = &'a Job> + 'a {
        queued_in(&self.store, queue)
    }

    /// All queued jobs, grouped by queue and in id order within each queue.
    pub fn queued_jobs_ordered(&self) -> impl Iterator<Item = &Job> {
        queued_ordered(&self.store)
    }

    /// Stage new snapshots. Each job is validated against the invariants
    /// (monotone terminal flags, queued-version monotonicity, run-id
    /// ownership); an offending snapshot is skipped while the rest of the
    /// batch is applied, and the error names the rejects. The transaction
    /// stays usable either way.
    pub fn upsert(&mut self, jobs: Vec<Job>) -> Result<()> {
        let mut rejects = Vec::new();
        for job in jobs {
            if let Err(reason) = self.validate(&job) {
                rejects.push(format!("job {}: {reason}", job.id()));
                continue;
            }
            self.apply(job);
        }
        if rejects.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::InvariantViolation(rejects.join("; ")))
        }
    }

    fn validate(&self, job: &Job) -> std::result::Result<(), String> {
        if let Some(existing) = self.store.jobs.get(&job.id()) {
            let monotone = [
                ("succeeded", existing.succeeded(), job.succeeded()),
                ("failed", existing.failed(), job.failed()),
                ("cancelled", existing.cancelled(), job.cancelled()),
                (
                    "cancel_requested",
                    existing.cancel_requested(),
                    job.cancel_requested(),
                ),
                (
                    "cancel_by_jobset_requested",
                    existing.cancel_by_jobset_requested(),
                    job.cancel_by_jobset_requested(),
                ),
            ];
            for (name, was, now) in monotone {
                if was && !now {
                    return Err(format!("monotone flag {name} would be cleared"));
                }
            }
            if job.queued_version() < existing.queued_version() {
                return Err(format!(
                    "queued version would regress from {} to {}",
                    existing.queued_version(),
                    job.queued_version()
                ));
            }
            if job.scheduling_info().version < existing.scheduling_info().version {
                return Err(format!(
                    "scheduling info version would regress from {} to {}",
                    existing.scheduling_info().version,
                    job.scheduling_info().version
                ));
            }
            for run in job.all_runs() {
                if let Some(old) = existing.run_by_id(run.id()) {
                    let run_monotone = [
                        ("succeeded", old.succeeded(), run.succeeded()),
                        ("failed", old.failed(), run.failed()),
                        ("cancelled", old.cancelled(), run.cancelled()),
                        ("run_attempted", old.run_attempted(), run.run_attempted()),
                    ];
                    for (name, was, now) in run_monotone {
                        if was && !now {
                            return Err(format!(
                                "run {} monotone flag {name} would be cleared",
                                run.id()
                            ));
                        }
                    }
                }
            }
        }
        for run in job.all_runs() {
            if let Some(owner) = self.store.jobs_by_run_id.get(&run.id()) {
                if *owner != job.id() {
                    return Err(format!(
                        "run {} already belongs to job {owner}",
                        run.id()
                    ));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, job: Job) {
        let id = job.id();
        if let Some(old) = self.store.jobs.get(&id) {
            if old.queued() {
                self.store.queued_by_queue.remove(&(old.queue_arc(), id));
            }
        }
        if job.queued() {
            self.store.queued_by_queue.insert((job.queue_arc(), id), ());
        }
        for run in job.all_runs() {
            self.store.jobs_by_run_id.insert(run.id(), id);
        }
        self.store.jobs.insert(id, job);
    }

    pub fn delete(&mut self, ids: &[JobId]) {
        for id in ids {
            if let Some(job) = self.store.jobs.remove(id) {
                if job.queued() {
                    self.store.queued_by_queue.remove(&(job.queue_arc(), *id));
                }
                for run in job.all_runs() {
                    self.store.jobs_by_run_id.remove(&run.id());
                }
            }
        }
    }

    /// Atomically install this transaction's state as the committed
    /// snapshot. Read transactions started before this keep their view.
    pub fn commit(self) {
        *self.db.inner.state.write().unwrap() = Arc::new(self.store);
    }
}
