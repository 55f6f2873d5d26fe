//! The leader-gated reconcile/schedule/publish cycle.
//!
//! Each cycle either publishes all the events it derived and commits its
//! write transaction, or publishes nothing and rolls the transaction back.
//! The repository serial cursors only advance on commit, so a failed cycle
//! reproduces the same deltas, and the monotone-flag rules make reapplying
//! them idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::events;
use crate::jobdb::{Job, JobDb, JobStateTransitions, RunId, WriteTxn};
use crate::leader::{LeaderController, LeaderToken};
use crate::proto::{Event, EventSequence};
use crate::publisher::Publisher;
use crate::repository::{ExecutorRepository, JobRepository, JobRow, RunRow};
use crate::scheduler::algo::{SchedulerResult, SchedulingAlgo};
use crate::scheduler::submit_check::SubmitChecker;

/// What a completed cycle did, for logging and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleSummary {
    pub transitions: usize,
    pub events_published: usize,
}

pub struct Scheduler {
    jobdb: JobDb,
    job_repository: Arc<dyn JobRepository>,
    executor_repository: Arc<dyn ExecutorRepository>,
    scheduling_algo: Arc<dyn SchedulingAlgo>,
    leader_controller: Arc<dyn LeaderController>,
    publisher: Arc<dyn Publisher>,
    submit_checker: Arc<dyn SubmitChecker>,
    cycle_period: Duration,
    schedule_period: Duration,
    executor_timeout: chrono::Duration,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
    last_job_serial: i64,
    last_run_serial: i64,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobdb: JobDb,
        job_repository: Arc<dyn JobRepository>,
        executor_repository: Arc<dyn ExecutorRepository>,
        scheduling_algo: Arc<dyn SchedulingAlgo>,
        leader_controller: Arc<dyn LeaderController>,
        publisher: Arc<dyn Publisher>,
        submit_checker: Arc<dyn SubmitChecker>,
        cycle_period: Duration,
        schedule_period: Duration,
        executor_timeout: chrono::Duration,
        max_attempts: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobdb,
            job_repository,
            executor_repository,
            scheduling_algo,
            leader_controller,
            publisher,
            submit_checker,
            cycle_period,
            schedule_period,
            executor_timeout,
            max_attempts,
            clock,
            last_job_serial: -1,
            last_run_serial: -1,
        }
    }

    pub fn jobdb(&self) -> &JobDb {
        &self.jobdb
    }

    pub fn serials(&self) -> (i64, i64) {
        (self.last_job_serial, self.last_run_serial)
    }

    /// Tick every cycle period until shut down. Non-leaders skip the cycle
    /// entirely; a freshly elected leader resynchronizes from serial 0
    /// before resuming incremental pulls.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            cycle_period_ms = self.cycle_period.as_millis() as u64,
            schedule_period_ms = self.schedule_period.as_millis() as u64,
            "scheduler cycle loop starting"
        );
        let mut interval = tokio::time::interval(self.cycle_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_schedule: Option<Instant> = None;
        let mut was_leader = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("scheduler cycle loop stopping");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            let token = self.leader_controller.get_token();
            if !token.legitimate() {
                if was_leader {
                    tracing::info!("lost leadership, pausing cycles");
                }
                was_leader = false;
                continue;
            }
            let full_sync = !was_leader;
            if full_sync {
                tracing::info!("gained leadership, resynchronizing from serial 0");
                if let Err(e) = self.ensure_db_up_to_date(&shutdown).await {
                    tracing::warn!(error = %e, "could not verify the delta feed is caught up");
                    continue;
                }
            }
            was_leader = true;

            let should_schedule = last_schedule
                .map(|t| t.elapsed() >= self.schedule_period)
                .unwrap_or(true);
            match self.cycle(full_sync, token, should_schedule).await {
                Ok(summary) => {
                    if should_schedule {
                        last_schedule = Some(Instant::now());
                    }
                    tracing::debug!(
                        transitions = summary.transitions,
                        events = summary.events_published,
                        "cycle complete"
                    );
                }
                Err(SchedulerError::NotLeader) => {
                    tracing::warn!("leadership fence failed mid-cycle, rolled back");
                    was_leader = false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cycle failed, state rolled back for retry");
                }
            }
        }
    }

    /// Publish a partition marker to every bus partition and wait until the
    /// repository has ingested them all. Once it has, everything published
    /// before this moment is visible through the delta feed, so a fresh
    /// leader cannot act on a stale view.
    async fn ensure_db_up_to_date(&self, shutdown: &CancellationToken) -> Result<()> {
        let group_id = uuid::Uuid::new_v4();
        let expected = self.publisher.publish_markers(group_id).await?;
        loop {
            let received = self
                .job_repository
                .count_received_partitions(group_id)
                .await?;
            if received >= expected {
                tracing::info!(partitions = expected, "delta feed is caught up");
                return Ok(());
            }
            tracing::info!(
                received,
                expected,
                "waiting for partition markers to round-trip"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.cycle_period) => {}
            }
        }
    }

    /// One reconcile cycle. All-or-nothing: any error before the final
    /// commit leaves the job db and the serial cursors untouched.
    pub async fn cycle(
        &mut self,
        full_sync: bool,
        token: LeaderToken,
        should_schedule: bool,
    ) -> Result<CycleSummary> {
        let (job_cursor, run_cursor) = if full_sync {
            (-1, -1)
        } else {
            (self.last_job_serial, self.last_run_serial)
        };
        let (job_rows, run_rows) = self
            .job_repository
            .fetch_job_updates(job_cursor, run_cursor)
            .await?;
        let next_job_serial = job_rows.last().map(|r| r.serial).unwrap_or(self.last_job_serial);
        let next_run_serial = run_rows.last().map(|r| r.serial).unwrap_or(self.last_run_serial);
        if !job_rows.is_empty() || !run_rows.is_empty() {
            tracing::debug!(
                jobs = job_rows.len(),
                runs = run_rows.len(),
                "fetched repository deltas"
            );
        }

        let mut txn = self.jobdb.write_txn().await;
        let transitions = self.sync_state(&mut txn, &job_rows, &run_rows)?;

        let mut sequences = Vec::new();
        sequences.extend(self.generate_update_events(&mut txn, &transitions).await?);
        sequences.extend(self.expire_stale_leases(&mut txn).await?);
        sequences.extend(self.cancel_ttl_expired_jobs(&mut txn)?);
        if should_schedule {
            let result = self.scheduling_algo.schedule(&mut txn).await?;
            sequences.extend(self.events_from_scheduler_result(&result)?);
        }

        // Nothing escapes the process on a stale token.
        if !self.leader_controller.validate(token) {
            return Err(SchedulerError::NotLeader);
        }
        let events_published = sequences.iter().map(|s| s.events.len()).sum();
        let controller = Arc::clone(&self.leader_controller);
        self.publisher
            .publish_messages(sequences, &move || controller.validate(token))
            .await?;

        txn.commit();
        self.last_job_serial = next_job_serial;
        self.last_run_serial = next_run_serial;
        Ok(CycleSummary {
            transitions: transitions.len(),
            events_published,
        })
    }

    /// Merge the delta batch into the transaction. Jobs whose repository
    /// state is already terminal are dropped from the db; a snapshot that
    /// violates an invariant is skipped without failing the cycle.
    fn sync_state(
        &self,
        txn: &mut WriteTxn,
        job_rows: &[JobRow],
        run_rows: &[RunRow],
    ) -> Result<Vec<JobStateTransitions>> {
        let transitions = self.jobdb.reconcile_differences(txn, job_rows, run_rows)?;
        let mut to_upsert = Vec::new();
        let mut to_delete = Vec::new();
        for jst in &transitions {
            let Some(job) = &jst.job else { continue };
            if job.in_terminal_state() {
                to_delete.push(job.id());
            } else {
                to_upsert.push(job.clone());
            }
        }
        if let Err(e) = txn.upsert(to_upsert) {
            tracing::error!(error = %e, "skipped delta snapshots violating job db invariants");
        }
        txn.delete(&to_delete);
        Ok(transitions)
    }

    /// Turn the reconciled state transitions into lifecycle events and the
    /// matching job snapshots.
    async fn generate_update_events(
        &self,
        txn: &mut WriteTxn,
        transitions: &[JobStateTransitions],
    ) -> Result<Vec<EventSequence>> {
        // Terminal error payloads are only stored for runs that genuinely
        // failed, so fetch them lazily for exactly those.
        let failed_run_ids: Vec<RunId> = transitions
            .iter()
            .filter_map(|jst| {
                let job = jst.job.as_ref()?;
                if !jst.failed || job.in_terminal_state() {
                    return None;
                }
                let run = job.latest_run()?;
                (run.failed() && !run.returned()).then(|| run.id())
            })
            .collect();
        let mut run_errors = if failed_run_ids.is_empty() {
            HashMap::new()
        } else {
            self.job_repository
                .fetch_job_run_errors(&failed_run_ids)
                .await?
        };

        let mut sequences = Vec::new();
        let mut updated = Vec::new();
        for jst in transitions {
            let Some(job) = &jst.job else { continue };
            if job.in_terminal_state() {
                // Already terminal when it arrived; no more messages for it.
                continue;
            }
            let (job, events) = self
                .update_events_for_job(job, jst, &mut run_errors)
                .await?;
            if !events.is_empty() {
                sequences.push(events::sequence_for_job(&job, events));
            }
            updated.push(job);
        }
        if let Err(e) = txn.upsert(updated) {
            tracing::error!(error = %e, "skipped derived snapshots violating job db invariants");
        }
        Ok(sequences)
    }

    async fn update_events_for_job(
        &self,
        job: &Job,
        jst: &JobStateTransitions,
        run_errors: &mut HashMap<RunId, crate::proto::Error>,
    ) -> Result<(Job, Vec<Event>)> {
        let now = self.clock.now().timestamp_millis();
        let mut events = Vec::new();
        let mut job = job.clone();

        // A requested cancellation beats everything else.
        if job.cancel_requested() || job.cancel_by_jobset_requested() {
            job = job
                .with_queued(false)
                .with_cancelled(true)
                .with_all_runs_cancelled();
            events.push(events::event(now, events::cancelled_job(&job)));
            tracing::info!(job_id = %job.id(), "job cancelled");
            return Ok((job, events));
        }

        if jst.succeeded {
            job = job.with_queued(false).with_succeeded(true);
            events.push(events::event(now, events::job_succeeded(&job)));
            tracing::info!(job_id = %job.id(), "job succeeded");
        }

        if jst.failed && !job.in_terminal_state() {
            let run = job
                .latest_run()
                .cloned()
                .ok_or_else(|| {
                    SchedulerError::Internal(format!("job {} failed without a run", job.id()))
                })?;
            if run.returned() {
                job = self.requeue_or_fail(job, &run, now, &mut events).await?;
            } else {
                let error = run_errors.remove(&run.id()).unwrap_or_else(|| {
                    events::terminal_error(events::REASON_RUN_ERROR, "job run failed")
                });
                events.push(events::event(
                    now,
                    events::job_run_errors(&job, &run, vec![error.clone()]),
                ));
                events.push(events::event(now, events::job_errors(&job, vec![error])));
                job = job.with_queued(false).with_failed(true);
                tracing::info!(job_id = %job.id(), run_id = %run.id(), "job failed");
            }
        }

        // Repository-driven preemption is handled symmetrically with
        // scheduler-driven preemption.
        if jst.preempted && !job.in_terminal_state() {
            if let Some(run) = job.latest_run().cloned() {
                job = job.with_updated_run(Arc::new(run.with_failed(true)));
                let error =
                    events::terminal_error(events::REASON_PREEMPTED, "job run was preempted");
                events.push(events::event(now, events::job_run_preempted(&job, &run)));
                events.push(events::event(
                    now,
                    events::job_run_errors(&job, &run, vec![error.clone()]),
                ));
                events.push(events::event(now, events::job_errors(&job, vec![error])));
                job = job.with_queued(false).with_failed(true);
                tracing::info!(job_id = %job.id(), run_id = %run.id(), "job preempted");
            }
        }

        if !job.in_terminal_state() && job.requested_priority() != job.priority() {
            job = job.with_priority(job.requested_priority());
            events.push(events::event(
                now,
                events::reprioritised_job(&job, job.priority()),
            ));
            tracing::info!(job_id = %job.id(), priority = job.priority(), "job reprioritised");
        }

        Ok((job, events))
    }

    /// A run came back with its lease returned: requeue the job with an
    /// anti-affinity against the node that ran it, unless the attempt budget
    /// is spent, the job is fail-fast, or the augmented job no longer fits
    /// anywhere.
    async fn requeue_or_fail(
        &self,
        job: Job,
        run: &crate::jobdb::JobRun,
        now: i64,
        events: &mut Vec<Event>,
    ) -> Result<Job> {
        if job.num_attempts() >= self.max_attempts {
            let error = events::terminal_error(
                events::REASON_TOO_MANY_ATTEMPTS,
                format!(
                    "job has failed {} attempts, exceeding the limit of {}",
                    job.num_attempts(),
                    self.max_attempts
                ),
            );
            events.push(events::event(now, events::job_errors(&job, vec![error])));
            tracing::info!(job_id = %job.id(), "job exceeded its attempt budget");
            return Ok(job.with_queued(false).with_failed(true));
        }

        if !run.run_attempted() && job.is_fail_fast() {
            let error = events::terminal_error(
                events::REASON_RUN_ERROR,
                "fail-fast job returned its lease; not retrying",
            );
            events.push(events::event(now, events::job_errors(&job, vec![error])));
            tracing::info!(job_id = %job.id(), "fail-fast job terminated after one attempt");
            return Ok(job.with_queued(false).with_failed(true));
        }

        let mut requeued = job.clone();
        if run.run_attempted() {
            requeued = requeued.with_node_anti_affinity(run.node_id());
            let (schedulable, reason) = self.submit_checker.check_jobs(&[requeued.clone()]).await?;
            if !schedulable {
                let error = events::terminal_error(events::REASON_UNSCHEDULABLE, reason);
                events.push(events::event(now, events::job_errors(&job, vec![error])));
                tracing::info!(job_id = %job.id(), "returned job is no longer schedulable");
                return Ok(job.with_queued(false).with_failed(true));
            }
        }
        let requeued = requeued
            .with_queued(true)
            .with_queued_version(job.queued_version() + 1);
        events.push(events::event(now, events::job_requeued(&requeued, run)));
        tracing::info!(job_id = %requeued.id(), run_id = %run.id(), "job requeued");
        Ok(requeued)
    }

    /// Executors that stopped heartbeating have all their leased runs failed
    /// with a lease-expired error.
    async fn expire_stale_leases(&self, txn: &mut WriteTxn) -> Result<Vec<EventSequence>> {
        let heartbeats = self.executor_repository.get_last_update_times().await?;
        let cutoff = self.clock.now() - self.executor_timeout;
        let stale: HashSet<&str> = heartbeats
            .iter()
            .filter(|(_, seen)| **seen < cutoff)
            .map(|(id, _)| id.as_str())
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        for executor in &stale {
            tracing::warn!(executor, "executor heartbeat stale, expiring its leases");
        }

        let now = self.clock.now().timestamp_millis();
        let mut sequences = Vec::new();
        let mut updated = Vec::new();
        for job in txn.get_all() {
            if job.queued() || job.in_terminal_state() {
                continue;
            }
            let Some(run) = job.latest_run().cloned() else {
                continue;
            };
            if run.in_terminal_state() || !stale.contains(run.executor()) {
                continue;
            }
            let error = events::terminal_error(
                events::REASON_LEASE_EXPIRED,
                format!("executor {} stopped reporting", run.executor()),
            );
            let job = job
                .with_updated_run(Arc::new(run.with_failed(true)))
                .with_queued(false)
                .with_failed(true);
            let events = vec![
                events::event(now, events::job_run_errors(&job, &run, vec![error.clone()])),
                events::event(now, events::job_errors(&job, vec![error])),
            ];
            tracing::info!(job_id = %job.id(), run_id = %run.id(), "lease expired");
            sequences.push(events::sequence_for_job(&job, events));
            updated.push(job);
        }
        if let Err(e) = txn.upsert(updated) {
            tracing::error!(error = %e, "skipped lease-expiry snapshots violating invariants");
        }
        Ok(sequences)
    }

    /// Queued jobs that overstayed their queue TTL are cancel-requested and
    /// cancelled within the same cycle.
    fn cancel_ttl_expired_jobs(&self, txn: &mut WriteTxn) -> Result<Vec<EventSequence>> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let mut sequences = Vec::new();
        let mut updated = Vec::new();
        for job in txn.get_all() {
            if !job.queued() || job.in_terminal_state() || !job.queue_ttl_expired(now) {
                continue;
            }
            let mut events = Vec::new();
            if !job.cancel_requested() {
                events.push(events::event(
                    now_ms,
                    events::cancel_job(&job, events::REASON_QUEUE_TTL_EXPIRED),
                ));
            }
            let job = job
                .with_cancel_requested(true)
                .with_queued(false)
                .with_cancelled(true)
                .with_all_runs_cancelled();
            events.push(events::event(now_ms, events::cancelled_job(&job)));
            tracing::info!(job_id = %job.id(), "cancelled job whose queue ttl expired");
            sequences.push(events::sequence_for_job(&job, events));
            updated.push(job);
        }
        if let Err(e) = txn.upsert(updated) {
            tracing::error!(error = %e, "skipped ttl-cancel snapshots violating invariants");
        }
        Ok(sequences)
    }

    fn events_from_scheduler_result(
        &self,
        result: &SchedulerResult,
    ) -> Result<Vec<EventSequence>> {
        let now = self.clock.now().timestamp_millis();
        let mut sequences = Vec::new();
        for job in &result.scheduled {
            let run = job.latest_run().ok_or_else(|| {
                SchedulerError::Internal(format!("scheduled job {} has no run", job.id()))
            })?;
            sequences.push(events::sequence_for_job(
                job,
                vec![events::event(now, events::job_run_leased(job, run))],
            ));
        }
        for job in &result.preempted {
            let run = job.latest_run().ok_or_else(|| {
                SchedulerError::Internal(format!("preempted job {} has no run", job.id()))
            })?;
            let error =
                events::terminal_error(events::REASON_PREEMPTED, "preempted by the scheduler");
            sequences.push(events::sequence_for_job(
                job,
                vec![
                    events::event(now, events::job_run_preempted(job, run)),
                    events::event(now, events::job_run_errors(job, run, vec![error.clone()])),
                    events::event(now, events::job_errors(job, vec![error])),
                ],
            ));
        }
        for job in &result.failed {
            let error = events::terminal_error(
                events::REASON_UNSCHEDULABLE,
                "the scheduler determined the job cannot run",
            );
            sequences.push(events::sequence_for_job(
                job,
                vec![events::event(now, events::job_errors(job, vec![error]))],
            ));
        }
        Ok(sequences)
    }
}
