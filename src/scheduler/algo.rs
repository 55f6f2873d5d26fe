//! The scheduling-algorithm seam.
//!
//! The cycle driver works with any [`SchedulingAlgo`]; the fairness and
//! bin-packing pass proper is external. The in-tree [`LeastLoadedAlgo`]
//! leases queued jobs onto the least-loaded live executor, which is enough
//! for standalone deployments and for exercising the seam.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use crate::clock::Clock;
use crate::error::Result;
use crate::jobdb::{Job, JobDb, WriteTxn};
use crate::repository::{ExecutorRepository, ExecutorSnapshot};
use crate::scheduler::submit_check::node_fits;

/// What one scheduling pass decided. Jobs carry their post-decision
/// snapshots; the algorithm upserts them into the transaction itself so that
/// the decisions and the snapshots can never diverge.
#[derive(Debug, Default)]
pub struct SchedulerResult {
    pub scheduled: Vec<Job>,
    pub preempted: Vec<Job>,
    pub failed: Vec<Job>,
}

#[async_trait]
pub trait SchedulingAlgo: Send + Sync {
    async fn schedule(&self, txn: &mut WriteTxn) -> Result<SchedulerResult>;
}

/// Leases queued jobs in id order onto the live executor currently running
/// the fewest leases, picking the first node that admits the job.
pub struct LeastLoadedAlgo {
    jobdb: JobDb,
    executor_repository: Arc<dyn ExecutorRepository>,
    executor_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl LeastLoadedAlgo {
    pub fn new(
        jobdb: JobDb,
        executor_repository: Arc<dyn ExecutorRepository>,
        executor_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobdb,
            executor_repository,
            executor_timeout,
            clock,
        }
    }

    fn live_executors(&self, executors: Vec<ExecutorSnapshot>) -> Vec<ExecutorSnapshot> {
        let cutoff = self.clock.now() - self.executor_timeout;
        executors
            .into_iter()
            .filter(|e| e.last_update.map(|t| t >= cutoff).unwrap_or(false))
            .collect()
    }
}

#[async_trait]
impl SchedulingAlgo for LeastLoadedAlgo {
    async fn schedule(&self, txn: &mut WriteTxn) -> Result<SchedulerResult> {
        let executors = self.live_executors(self.executor_repository.get_executors().await?);
        if executors.is_empty() {
            return Ok(SchedulerResult::default());
        }

        // Current lease count per executor, from the transaction itself.
        let mut load: HashMap<String, usize> =
            executors.iter().map(|e| (e.id.clone(), 0)).collect();
        for job in txn.jobs() {
            if job.queued() || job.in_terminal_state() {
                continue;
            }
            if let Some(run) = job.latest_run() {
                if !run.in_terminal_state() {
                    if let Some(count) = load.get_mut(run.executor()) {
                        *count += 1;
                    }
                }
            }
        }

        // The queue index yields ulid (submission) order within each queue.
        let queued: Vec<Job> = txn
            .queued_jobs_ordered()
            .filter(|j| !j.in_terminal_state())
            .cloned()
            .collect();

        let now = self.clock.now().timestamp_millis();
        let mut scheduled = Vec::new();
        for job in queued {
            // Least-loaded executor with a node that admits the job.
            let mut candidates: Vec<&ExecutorSnapshot> = executors.iter().collect();
            candidates.sort_by_key(|e| load.get(&e.id).copied().unwrap_or(usize::MAX));
            let placement = candidates.iter().find_map(|executor| {
                executor
                    .nodes
                    .iter()
                    .find(|node| node_fits(&job, node))
                    .map(|node| (executor.id.clone(), node.name.clone()))
            });
            let Some((executor_id, node_name)) = placement else {
                tracing::debug!(job_id = %job.id(), "no executor admits job this pass");
                continue;
            };

            let leased = job
                .with_queued_version(job.queued_version() + 1)
                .with_queued(false)
                .with_new_run(
                    &executor_id,
                    &node_name,
                    self.jobdb.scheduled_at_priority_for(&job),
                    now,
                );
            *load.entry(executor_id).or_insert(0) += 1;
            tracing::info!(
                job_id = %leased.id(),
                run_id = %leased.latest_run().map(|r| r.id().to_string()).unwrap_or_default(),
                "job leased"
            );
            scheduled.push(leased);
        }

        txn.upsert(scheduled.clone())?;
        Ok(SchedulerResult {
            scheduled,
            preempted: Vec::new(),
            failed: Vec::new(),
        })
    }
}
