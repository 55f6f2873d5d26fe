//! Merges repository delta batches into the job db.
//!
//! The reconciler is a pure function over (current transaction state, new
//! repository rows). It never publishes events itself; it returns a summary
//! of the state transitions that fired per job, which the cycle driver turns
//! into lifecycle events.

use std::collections::HashMap;
use std::sync::Arc;

use prost::Message;

use crate::error::Result;
use crate::jobdb::job::{Job, JobId, JobRun};
use crate::jobdb::{JobDb, WriteTxn};
use crate::proto::JobSchedulingInfo;
use crate::repository::{JobRow, RunRow};

/// Which transitions were applied to produce the bundled job snapshot.
///
/// Cumulative: a job that went queued -> scheduled -> queued -> running ->
/// failed within one delta batch has queued, scheduled, running, and failed
/// all set.
#[derive(Debug, Clone, Default)]
pub struct JobStateTransitions {
    pub job: Option<Job>,

    pub queued: bool,
    pub scheduled: bool,
    pub pending: bool,
    pub running: bool,
    pub cancelled: bool,
    pub preempted: bool,
    pub failed: bool,
    pub succeeded: bool,
}

impl JobStateTransitions {
    /// Fold a run's transitions into the job's. A returned run re-queues the
    /// job, hence returned maps onto queued.
    fn apply_run_state_transitions(&mut self, rst: &RunStateTransitions) {
        self.queued |= rst.returned;
        self.scheduled |= rst.scheduled;
        self.pending |= rst.pending;
        self.running |= rst.running;
        self.cancelled |= rst.cancelled;
        self.preempted |= rst.preempted;
        self.failed |= rst.failed;
        self.succeeded |= rst.succeeded;
    }
}

/// Same bookkeeping as [`JobStateTransitions`], for a single run.
#[derive(Debug, Clone)]
pub struct RunStateTransitions {
    pub run: Arc<JobRun>,

    pub scheduled: bool,
    pub returned: bool,
    pub pending: bool,
    pub running: bool,
    pub cancelled: bool,
    pub preempted: bool,
    pub failed: bool,
    pub succeeded: bool,
}

impl JobDb {
    /// Reconcile differences between the jobs stored in the transaction and
    /// the repository rows, returning the applied transitions per job. The
    /// caller upserts the bundled snapshots.
    pub fn reconcile_differences(
        &self,
        txn: &WriteTxn,
        job_rows: &[JobRow],
        run_rows: &[RunRow],
    ) -> Result<Vec<JobStateTransitions>> {
        // Jobs touched only through a run map to None; jobs updated directly
        // map to their row.
        let mut rows_by_id: HashMap<JobId, Option<&JobRow>> =
            HashMap::with_capacity(job_rows.len().max(run_rows.len()));
        for run_row in run_rows {
            rows_by_id.entry(run_row.job_id).or_insert(None);
        }
        for job_row in job_rows {
            rows_by_id.insert(job_row.job_id, Some(job_row));
        }

        let mut run_rows_by_job: HashMap<JobId, Vec<&RunRow>> = HashMap::new();
        for run_row in run_rows {
            run_rows_by_job
                .entry(run_row.job_id)
                .or_default()
                .push(run_row);
        }

        let mut transitions = Vec::with_capacity(rows_by_id.len());
        for (job_id, job_row) in rows_by_id {
            let jst = self.reconcile_job_differences(
                txn.get_by_id(job_id),
                job_row,
                run_rows_by_job
                    .get(&job_id)
                    .map(|rows| rows.as_slice())
                    .unwrap_or(&[]),
            )?;
            transitions.push(jst);
        }
        Ok(transitions)
    }

    fn reconcile_job_differences(
        &self,
        job: Option<&Job>,
        job_row: Option<&JobRow>,
        run_rows: &[&RunRow],
    ) -> Result<JobStateTransitions> {
        let mut jst = JobStateTransitions::default();

        let mut job = match (job, job_row) {
            (None, None) => {
                // A run row for a job this scheduler has never seen and that
                // the batch does not create. Nothing to hold it against.
                for run_row in run_rows {
                    tracing::warn!(
                        run_id = %run_row.run_id,
                        job_id = %run_row.job_id,
                        "dropping run update for unknown job"
                    );
                }
                return Ok(jst);
            }
            (None, Some(row)) => {
                jst.queued = true;
                self.job_from_row(row)?
            }
            (Some(job), None) => {
                // No direct update to the job; any updated runs are still
                // applied below.
                job.clone()
            }
            (Some(job), Some(row)) => {
                let mut job = job.clone();
                if row.cancel_requested && !job.cancel_requested() {
                    job = job.with_cancel_requested(true);
                }
                if row.cancel_by_jobset_requested && !job.cancel_by_jobset_requested() {
                    job = job.with_cancel_by_jobset_requested(true);
                }
                if row.cancelled && !job.cancelled() {
                    job = job.with_cancelled(true);
                }
                if row.succeeded && !job.succeeded() {
                    job = job.with_succeeded(true);
                }
                if row.failed && !job.failed() {
                    job = job.with_failed(true);
                }
                if row.priority as u32 != job.requested_priority() {
                    job = job.with_requested_priority(row.priority as u32);
                }
                if row.scheduling_info_version as u32 > job.scheduling_info().version {
                    let info = JobSchedulingInfo::decode(row.scheduling_info.as_slice())?;
                    job = job.with_scheduling_info(Arc::new(info));
                }
                if row.queued_version > job.queued_version() {
                    job = job.with_queued_version(row.queued_version);
                    job = job.with_queued(row.queued);
                }
                job
            }
        };

        for run_row in run_rows {
            let rst = self.reconcile_run_differences(job.run_by_id(run_row.run_id), run_row);
            jst.apply_run_state_transitions(&rst);
            job = job.with_updated_run(Arc::clone(&rst.run));
        }

        jst.job = Some(job);
        Ok(jst)
    }

    fn reconcile_run_differences(
        &self,
        run: Option<&Arc<JobRun>>,
        row: &RunRow,
    ) -> RunStateTransitions {
        match run {
            // A run this scheduler has not seen before; its flags are taken
            // verbatim from the repository row.
            None => {
                let run = self.create_run(
                    row.run_id,
                    row.job_id,
                    row.created,
                    &row.executor,
                    &row.node,
                    row.scheduled_at_priority,
                    row.pending,
                    row.running,
                    row.succeeded,
                    row.failed,
                    row.cancelled,
                    row.preempted,
                    row.returned,
                    row.run_attempted,
                );
                RunStateTransitions {
                    run: Arc::new(run),
                    scheduled: true,
                    returned: row.returned,
                    pending: row.pending,
                    running: row.running,
                    cancelled: row.cancelled,
                    preempted: row.preempted,
                    failed: row.failed,
                    succeeded: row.succeeded,
                }
            }
            Some(existing) => {
                let mut run = (**existing).clone();
                let mut rst = RunStateTransitions {
                    run: Arc::clone(existing),
                    scheduled: false,
                    returned: false,
                    pending: false,
                    running: false,
                    cancelled: false,
                    preempted: false,
                    failed: false,
                    succeeded: false,
                };
                if row.pending && !run.pending() {
                    run = run.with_pending(true);
                    rst.pending = true;
                }
                if row.running && !run.running() {
                    run = run.with_running(true);
                    rst.running = true;
                }
                if row.succeeded && !run.succeeded() {
                    run = run.with_succeeded(true);
                    rst.succeeded = true;
                }
                if row.failed && !run.failed() {
                    run = run.with_failed(true);
                    rst.failed = true;
                }
                if row.cancelled && !run.cancelled() {
                    run = run.with_cancelled(true);
                    rst.cancelled = true;
                }
                if row.preempted && !run.preempted() {
                    run = run.with_preempted(true);
                    rst.preempted = true;
                }
                if row.returned && !run.returned() {
                    run = run.with_returned(true);
                    rst.returned = true;
                }
                if row.run_attempted && !run.run_attempted() {
                    run = run.with_attempted(true);
                }
                rst.run = Arc::new(run);
                rst
            }
        }
    }

    fn job_from_row(&self, row: &JobRow) -> Result<Job> {
        let scheduling_info = JobSchedulingInfo::decode(row.scheduling_info.as_slice())?;
        Ok(self.new_job(
            row.job_id,
            &row.jobset,
            &row.queue,
            row.priority as u32,
            scheduling_info,
            row.queued,
            row.queued_version,
            row.cancel_requested,
            row.cancel_by_jobset_requested,
            row.cancelled,
            row.submitted,
        ))
    }
}
