//! Contracts for the durable job repository and the executor repository.
//!
//! The relational store behind [`JobRepository`] is an external collaborator;
//! the scheduler only depends on its append-only, serial-ordered change
//! feeds. The executor repository is owned by the scheduler process: it is
//! the concurrent map of executor heartbeats and node inventories that the
//! executor API writes and the cycle driver reads.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::jobdb::{JobId, RunId};

/// A job row from the repository change feed.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub job_id: JobId,
    pub jobset: String,
    pub queue: String,
    pub priority: i64,
    pub submitted: i64,
    pub queued: bool,
    pub queued_version: i32,
    pub cancel_requested: bool,
    pub cancel_by_jobset_requested: bool,
    pub cancelled: bool,
    pub succeeded: bool,
    pub failed: bool,
    /// Prost-encoded `JobSchedulingInfo`.
    pub scheduling_info: Vec<u8>,
    pub scheduling_info_version: i32,
    pub serial: i64,
}

impl Default for JobRow {
    fn default() -> Self {
        Self {
            job_id: JobId::nil(),
            jobset: String::new(),
            queue: String::new(),
            priority: 0,
            submitted: 0,
            queued: false,
            queued_version: 0,
            cancel_requested: false,
            cancel_by_jobset_requested: false,
            cancelled: false,
            succeeded: false,
            failed: false,
            scheduling_info: Vec::new(),
            scheduling_info_version: 0,
            serial: 0,
        }
    }
}

/// A run row from the repository change feed.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: RunId,
    pub job_id: JobId,
    pub jobset: String,
    pub executor: String,
    pub node: String,
    pub created: i64,
    pub scheduled_at_priority: Option<i32>,
    pub pending: bool,
    pub running: bool,
    pub succeeded: bool,
    pub failed: bool,
    pub cancelled: bool,
    pub preempted: bool,
    pub returned: bool,
    pub run_attempted: bool,
    pub serial: i64,
}

impl Default for RunRow {
    fn default() -> Self {
        Self {
            run_id: RunId::nil(),
            job_id: JobId::nil(),
            jobset: String::new(),
            executor: String::new(),
            node: String::new(),
            created: 0,
            scheduled_at_priority: None,
            pending: false,
            running: false,
            succeeded: false,
            failed: false,
            cancelled: false,
            preempted: false,
            returned: false,
            run_attempted: false,
            serial: 0,
        }
    }
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Rows with serial strictly greater than the given cursors, in serial
    /// order.
    async fn fetch_job_updates(
        &self,
        job_serial: i64,
        run_serial: i64,
    ) -> Result<(Vec<JobRow>, Vec<RunRow>)>;

    /// Terminal error payloads for the given runs.
    async fn fetch_job_run_errors(
        &self,
        run_ids: &[RunId],
    ) -> Result<HashMap<RunId, crate::proto::Error>>;

    /// The subset of the given runs that are no longer active, used by the
    /// executor API to filter stale in-flight reports.
    async fn find_inactive_runs(&self, run_ids: &[RunId]) -> Result<Vec<RunId>>;

    /// How many of the partition markers published under `group_id` have
    /// made it through the bus and into the repository. A fresh leader polls
    /// this until every partition reports, proving its delta feed has caught
    /// up with everything previously published.
    async fn count_received_partitions(&self, group_id: uuid::Uuid) -> Result<u32>;
}

/// A node as last reported by its executor.
#[derive(Debug, Clone, Default)]
pub struct NodeSnapshot {
    pub name: String,
    pub node_id: String,
    pub allocatable: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub taints: Vec<String>,
    pub run_ids: Vec<RunId>,
}

/// An executor as last reported over the lease stream.
#[derive(Debug, Clone, Default)]
pub struct ExecutorSnapshot {
    pub id: String,
    pub pool: String,
    pub last_update: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeSnapshot>,
}

#[async_trait]
pub trait ExecutorRepository: Send + Sync {
    async fn store_executor(&self, executor: ExecutorSnapshot) -> Result<()>;
    async fn get_executors(&self) -> Result<Vec<ExecutorSnapshot>>;
    async fn get_last_update_times(&self) -> Result<HashMap<String, DateTime<Utc>>>;
}

/// Heartbeat map plus node inventories, held in memory by this process.
#[derive(Default)]
pub struct InMemoryExecutorRepository {
    executors: RwLock<HashMap<String, ExecutorSnapshot>>,
}

impl InMemoryExecutorRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutorRepository for InMemoryExecutorRepository {
    async fn store_executor(&self, executor: ExecutorSnapshot) -> Result<()> {
        self.executors
            .write()
            .unwrap()
            .insert(executor.id.clone(), executor);
        Ok(())
    }

    async fn get_executors(&self) -> Result<Vec<ExecutorSnapshot>> {
        Ok(self.executors.read().unwrap().values().cloned().collect())
    }

    async fn get_last_update_times(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        Ok(self
            .executors
            .read()
            .unwrap()
            .iter()
            .filter_map(|(id, e)| e.last_update.map(|t| (id.clone(), t)))
            .collect())
    }
}

/// An in-process job repository backing the standalone mode and tests.
/// Rows are appended with ever-increasing serials; the fetch side behaves
/// exactly like the relational feed contract.
#[derive(Default)]
pub struct InMemoryJobRepository {
    state: Mutex<InMemoryJobRepositoryState>,
}

struct InMemoryJobRepositoryState {
    job_rows: Vec<JobRow>,
    run_rows: Vec<RunRow>,
    run_errors: HashMap<RunId, crate::proto::Error>,
    inactive_runs: Vec<RunId>,
    received_partitions: u32,
}

impl Default for InMemoryJobRepositoryState {
    fn default() -> Self {
        Self {
            job_rows: Vec::new(),
            run_rows: Vec::new(),
            run_errors: HashMap::new(),
            inactive_runs: Vec::new(),
            // An in-process repository shares fate with the bus, so markers
            // are considered received as soon as they are published.
            received_partitions: u32::MAX,
        }
    }
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_job_row(&self, mut row: JobRow) {
        let mut state = self.state.lock().unwrap();
        let next = state.job_rows.last().map(|r| r.serial + 1).unwrap_or(1);
        if row.serial < next {
            row.serial = next;
        }
        state.job_rows.push(row);
    }

    pub fn append_run_row(&self, mut row: RunRow) {
        let mut state = self.state.lock().unwrap();
        let next = state.run_rows.last().map(|r| r.serial + 1).unwrap_or(1);
        if row.serial < next {
            row.serial = next;
        }
        state.run_rows.push(row);
    }

    pub fn put_run_error(&self, run_id: RunId, error: crate::proto::Error) {
        self.state.lock().unwrap().run_errors.insert(run_id, error);
    }

    pub fn mark_runs_inactive(&self, run_ids: &[RunId]) {
        self.state
            .lock()
            .unwrap()
            .inactive_runs
            .extend_from_slice(run_ids);
    }

    pub fn set_received_partitions(&self, count: u32) {
        self.state.lock().unwrap().received_partitions = count;
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn fetch_job_updates(
        &self,
        job_serial: i64,
        run_serial: i64,
    ) -> Result<(Vec<JobRow>, Vec<RunRow>)> {
        let state = self.state.lock().unwrap();
        let jobs = state
            .job_rows
            .iter()
            .filter(|r| r.serial > job_serial)
            .cloned()
            .collect();
        let runs = state
            .run_rows
            .iter()
            .filter(|r| r.serial > run_serial)
            .cloned()
            .collect();
        Ok((jobs, runs))
    }

    async fn fetch_job_run_errors(
        &self,
        run_ids: &[RunId],
    ) -> Result<HashMap<RunId, crate::proto::Error>> {
        let state = self.state.lock().unwrap();
        Ok(run_ids
            .iter()
            .filter_map(|id| state.run_errors.get(id).map(|e| (*id, e.clone())))
            .collect())
    }

    async fn find_inactive_runs(&self, run_ids: &[RunId]) -> Result<Vec<RunId>> {
        let state = self.state.lock().unwrap();
        Ok(run_ids
            .iter()
            .filter(|id| state.inactive_runs.contains(id))
            .copied()
            .collect())
    }

    async fn count_received_partitions(&self, _group_id: uuid::Uuid) -> Result<u32> {
        Ok(self.state.lock().unwrap().received_partitions)
    }
}
