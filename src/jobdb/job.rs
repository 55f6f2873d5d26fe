use std::sync::Arc;

use chrono::{DateTime, Utc};
use ulid::Ulid;
use uuid::Uuid;

use crate::proto::JobSchedulingInfo;

pub type JobId = Ulid;
pub type RunId = Uuid;

/// Node ids are the executor id concatenated with the node name, so that node
/// names only need to be unique within one executor.
pub fn node_id_from_executor_and_node_name(executor: &str, node_name: &str) -> String {
    format!("{executor}-{node_name}")
}

/// One attempted execution of a job on one executor.
///
/// Runs are immutable snapshots; the `with_*` methods derive a new snapshot
/// with one field changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    id: RunId,
    job_id: JobId,
    created: i64,
    executor: String,
    node_id: String,
    node_name: String,
    scheduled_at_priority: Option<i32>,
    pending: bool,
    running: bool,
    succeeded: bool,
    failed: bool,
    cancelled: bool,
    preempted: bool,
    returned: bool,
    run_attempted: bool,
}

impl JobRun {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: RunId,
        job_id: JobId,
        created: i64,
        executor: String,
        node_id: String,
        node_name: String,
        scheduled_at_priority: Option<i32>,
    ) -> Self {
        Self {
            id,
            job_id,
            created,
            executor,
            node_id,
            node_name,
            scheduled_at_priority,
            pending: false,
            running: false,
            succeeded: false,
            failed: false,
            cancelled: false,
            preempted: false,
            returned: false,
            run_attempted: false,
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn executor(&self) -> &str {
        &self.executor
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn scheduled_at_priority(&self) -> Option<i32> {
        self.scheduled_at_priority
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn preempted(&self) -> bool {
        self.preempted
    }

    pub fn returned(&self) -> bool {
        self.returned
    }

    pub fn run_attempted(&self) -> bool {
        self.run_attempted
    }

    pub fn in_terminal_state(&self) -> bool {
        self.succeeded || self.failed || self.cancelled || self.preempted
    }

    pub fn with_pending(&self, pending: bool) -> Self {
        let mut run = self.clone();
        run.pending = pending;
        run
    }

    pub fn with_running(&self, running: bool) -> Self {
        let mut run = self.clone();
        run.running = running;
        run
    }

    pub fn with_succeeded(&self, succeeded: bool) -> Self {
        let mut run = self.clone();
        run.succeeded = succeeded;
        run
    }

    pub fn with_failed(&self, failed: bool) -> Self {
        let mut run = self.clone();
        run.failed = failed;
        run
    }

    pub fn with_cancelled(&self, cancelled: bool) -> Self {
        let mut run = self.clone();
        run.cancelled = cancelled;
        run
    }

    pub fn with_preempted(&self, preempted: bool) -> Self {
        let mut run = self.clone();
        run.preempted = preempted;
        run
    }

    pub fn with_returned(&self, returned: bool) -> Self {
        let mut run = self.clone();
        run.returned = returned;
        run
    }

    pub fn with_attempted(&self, run_attempted: bool) -> Self {
        let mut run = self.clone();
        run.run_attempted = run_attempted;
        run
    }
}

/// A job snapshot.
///
/// Jobs are immutable; mutation is expressed by deriving a new snapshot with
/// one field updated while everything else stays structurally shared (queue,
/// jobset, and scheduling info sit behind `Arc`s, runs are `Arc`'d). This is
/// what keeps write transactions cheap: cloning a job copies a handful of
/// pointers, flags, and counters.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    id: JobId,
    queue: Arc<str>,
    jobset: Arc<str>,
    priority: u32,
    requested_priority: u32,
    submitted: i64,
    queued: bool,
    queued_version: i32,
    cancel_requested: bool,
    cancel_by_jobset_requested: bool,
    cancelled: bool,
    succeeded: bool,
    failed: bool,
    scheduling_info: Arc<JobSchedulingInfo>,
    runs: Vec<Arc<JobRun>>,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: JobId,
        jobset: Arc<str>,
        queue: Arc<str>,
        priority: u32,
        scheduling_info: Arc<JobSchedulingInfo>,
        queued: bool,
        queued_version: i32,
        cancel_requested: bool,
        cancel_by_jobset_requested: bool,
        cancelled: bool,
        submitted: i64,
    ) -> Self {
        Self {
            id,
            queue,
            jobset,
            priority,
            requested_priority: priority,
            submitted,
            queued,
            queued_version,
            cancel_requested,
            cancel_by_jobset_requested,
            cancelled,
            succeeded: false,
            failed: false,
            scheduling_info,
            runs: Vec::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn queue_arc(&self) -> Arc<str> {
        Arc::clone(&self.queue)
    }

    pub fn jobset(&self) -> &str {
        &self.jobset
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn requested_priority(&self) -> u32 {
        self.requested_priority
    }

    pub fn submitted(&self) -> i64 {
        self.submitted
    }

    pub fn queued(&self) -> bool {
        self.queued
    }

    pub fn queued_version(&self) -> i32 {
        self.queued_version
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn cancel_by_jobset_requested(&self) -> bool {
        self.cancel_by_jobset_requested
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn scheduling_info(&self) -> &JobSchedulingInfo {
        &self.scheduling_info
    }

    pub fn scheduling_info_arc(&self) -> Arc<JobSchedulingInfo> {
        Arc::clone(&self.scheduling_info)
    }

    pub fn in_terminal_state(&self) -> bool {
        self.succeeded || self.failed || self.cancelled
    }

    /// A job with the fail-fast marker is terminated after a single failed
    /// attempt instead of being retried.
    pub fn is_fail_fast(&self) -> bool {
        self.scheduling_info.at_most_once
    }

    pub fn queue_ttl(&self) -> Option<chrono::Duration> {
        match self.scheduling_info.queue_ttl_seconds {
            0 => None,
            secs => Some(chrono::Duration::seconds(secs as i64)),
        }
    }

    pub fn queue_ttl_expired(&self, now: DateTime<Utc>) -> bool {
        match self.queue_ttl() {
            Some(ttl) => now.timestamp_millis() - self.submitted >= ttl.num_milliseconds(),
            None => false,
        }
    }

    pub fn all_runs(&self) -> &[Arc<JobRun>] {
        &self.runs
    }

    pub fn has_runs(&self) -> bool {
        !self.runs.is_empty()
    }

    /// The most recently created run, if any.
    pub fn latest_run(&self) -> Option<&Arc<JobRun>> {
        self.runs.last()
    }

    pub fn run_by_id(&self, run_id: RunId) -> Option<&Arc<JobRun>> {
        self.runs.iter().find(|r| r.id() == run_id)
    }

    /// Number of runs that were actually attempted on a node. Compared
    /// against the configured attempt limit when a lease is returned.
    pub fn num_attempts(&self) -> u32 {
        self.runs.iter().filter(|r| r.run_attempted()).count() as u32
    }

    pub fn with_priority(&self, priority: u32) -> Self {
        let mut job = self.clone();
        job.priority = priority;
        job
    }

    pub fn with_requested_priority(&self, priority: u32) -> Self {
        let mut job = self.clone();
        job.requested_priority = priority;
        job
    }

    pub fn with_queued(&self, queued: bool) -> Self {
        let mut job = self.clone();
        job.queued = queued;
        job
    }

    pub fn with_queued_version(&self, version: i32) -> Self {
        let mut job = self.clone();
        job.queued_version = version;
        job
    }

    pub fn with_cancel_requested(&self, cancel_requested: bool) -> Self {
        let mut job = self.clone();
        job.cancel_requested = cancel_requested;
        job
    }

    pub fn with_cancel_by_jobset_requested(&self, requested: bool) -> Self {
        let mut job = self.clone();
        job.cancel_by_jobset_requested = requested;
        job
    }

    pub fn with_cancelled(&self, cancelled: bool) -> Self {
        let mut job = self.clone();
        job.cancelled = cancelled;
        job
    }

    pub fn with_succeeded(&self, succeeded: bool) -> Self {
        let mut job = self.clone();
        job.succeeded = succeeded;
        job
    }

    pub fn with_failed(&self, failed: bool) -> Self {
        let mut job = self.clone();
        job.failed = failed;
        job
    }

    pub fn with_scheduling_info(&self, scheduling_info: Arc<JobSchedulingInfo>) -> Self {
        let mut job = self.clone();
        job.scheduling_info = scheduling_info;
        job
    }

    /// Attach a fresh run for a lease decision. The new run becomes the
    /// latest run.
    pub fn with_new_run(
        &self,
        executor: &str,
        node_name: &str,
        scheduled_at_priority: i32,
        created: i64,
    ) -> Self {
        let run = JobRun::new(
            Uuid::new_v4(),
            self.id,
            created,
            executor.to_string(),
            node_id_from_executor_and_node_name(executor, node_name),
            node_name.to_string(),
            Some(scheduled_at_priority),
        );
        self.with_updated_run(Arc::new(run))
    }

    /// Replace the run with the same id, or insert it in creation order.
    pub fn with_updated_run(&self, run: Arc<JobRun>) -> Self {
        let mut job = self.clone();
        if let Some(existing) = job.runs.iter_mut().find(|r| r.id() == run.id()) {
            *existing = run;
        } else {
            let at = job
                .runs
                .iter()
                .position(|r| r.created() > run.created())
                .unwrap_or(job.runs.len());
            job.runs.insert(at, run);
        }
        job
    }

    /// Cancel every run that is not already terminal. Used when a job is
    /// cancelled so the "terminal job implies terminal runs" invariant holds.
    pub fn with_all_runs_cancelled(&self) -> Self {
        let mut job = self.clone();
        job.runs = job
            .runs
            .iter()
            .map(|r| {
                if r.in_terminal_state() {
                    Arc::clone(r)
                } else {
                    Arc::new(r.with_cancelled(true))
                }
            })
            .collect();
        job
    }

    /// Add a node anti-affinity for the given node id and bump the scheduling
    /// info version. No-op if the node is already excluded.
    pub fn with_node_anti_affinity(&self, node_id: &str) -> Self {
        if self
            .scheduling_info
            .node_anti_affinities
            .iter()
            .any(|n| n == node_id)
        {
            return self.clone();
        }
        let mut info = (*self.scheduling_info).clone();
        info.node_anti_affinities.push(node_id.to_string());
        info.version += 1;
        self.with_scheduling_info(Arc::new(info))
    }
}
