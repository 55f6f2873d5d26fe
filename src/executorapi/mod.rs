//! The executor-facing gRPC surface.
//!
//! One bidirectional stream per executor session: every `LeaseRequest` is a
//! heartbeat carrying the executor's node inventory and the runs it holds,
//! and is answered with a burst of cancels, preemptions, and new leases,
//! terminated by exactly one `EndMarker`. Stream teardown loses nothing: all
//! state lives in the job db and the next request derives the same answers.

use std::collections::HashSet;
use std::sync::Arc;

use prost::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::clock::Clock;
use crate::jobdb::{JobDb, RunId};
use crate::leader::LeaderController;
use crate::proto::executor_api_server::ExecutorApi;
use crate::proto::{
    lease_stream_message, CancelRuns, EndMarker, EventList, JobRunLease, LeaseRequest,
    LeaseStreamMessage, PreemptRuns, ReportEventsResponse,
};
use crate::publisher::EventSink;
use crate::repository::{ExecutorRepository, ExecutorSnapshot, JobRepository, NodeSnapshot};

#[derive(Clone)]
pub struct ExecutorApiService {
    jobdb: JobDb,
    job_repository: Arc<dyn JobRepository>,
    executor_repository: Arc<dyn ExecutorRepository>,
    event_sink: Arc<dyn EventSink>,
    leader_controller: Arc<dyn LeaderController>,
    node_id_label: String,
    clock: Arc<dyn Clock>,
}

impl ExecutorApiService {
    pub fn new(
        jobdb: JobDb,
        job_repository: Arc<dyn JobRepository>,
        executor_repository: Arc<dyn ExecutorRepository>,
        event_sink: Arc<dyn EventSink>,
        leader_controller: Arc<dyn LeaderController>,
        node_id_label: String,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobdb,
            job_repository,
            executor_repository,
            event_sink,
            leader_controller,
            node_id_label,
            clock,
        }
    }

    /// Server-side reconciliation for one lease request: record the
    /// heartbeat, then answer from the committed job db.
    pub async fn handle_lease_request(
        &self,
        request: LeaseRequest,
    ) -> Result<Vec<LeaseStreamMessage>, Status> {
        if request.executor_id.is_empty() {
            return Err(Status::invalid_argument("executor_id cannot be empty"));
        }

        let snapshot = self.executor_snapshot(&request)?;
        let reported: Vec<RunId> = snapshot
            .nodes
            .iter()
            .flat_map(|n| n.run_ids.iter().copied())
            .collect();
        let unassigned = parse_run_ids(&request.unassigned_job_run_ids)?;
        self.executor_repository
            .store_executor(snapshot)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        // A deposed scheduler keeps streams alive but hands out no work.
        if !self.leader_controller.get_token().legitimate() {
            return Ok(vec![end_marker()]);
        }

        let read = self.jobdb.read_txn();
        let mut cancel_ids: Vec<RunId> = Vec::new();
        let mut preempt_ids: Vec<RunId> = Vec::new();
        for run_id in &reported {
            let Some(job) = read.job_by_run_id(*run_id) else {
                continue;
            };
            if job.cancelled() || job.cancel_requested() || job.cancel_by_jobset_requested() {
                cancel_ids.push(*run_id);
            } else if job.run_by_id(*run_id).is_some_and(|r| r.preempted()) {
                preempt_ids.push(*run_id);
            }
        }

        // Runs the executor still reports but that are long gone from the
        // repository are cancelled as well.
        let all_held: Vec<RunId> = reported
            .iter()
            .chain(unassigned.iter())
            .copied()
            .collect();
        let inactive = self
            .job_repository
            .find_inactive_runs(&all_held)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        for run_id in inactive {
            if !cancel_ids.contains(&run_id) {
                cancel_ids.push(run_id);
            }
        }

        let held: HashSet<RunId> = all_held.iter().copied().collect();
        let cancelled: HashSet<RunId> = cancel_ids.iter().copied().collect();
        let max_leases = request.max_jobs_to_lease as usize;
        let mut leases: Vec<JobRunLease> = Vec::new();

        // Leases the executor holds unplaced are confirmed first, then runs
        // committed for this executor that it has not seen yet.
        for run_id in &unassigned {
            if leases.len() >= max_leases {
                break;
            }
            if cancelled.contains(run_id) {
                continue;
            }
            if let Some(job) = read.job_by_run_id(*run_id) {
                if job.in_terminal_state() {
                    continue;
                }
                if let Some(run) = job.run_by_id(*run_id) {
                    if !run.in_terminal_state() {
                        leases.push(lease_for(job, *run_id));
                    }
                }
            }
        }
        for job in read.jobs() {
            if leases.len() >= max_leases {
                break;
            }
            if job.queued() || job.in_terminal_state() {
                continue;
            }
            let Some(run) = job.latest_run() else { continue };
            if run.in_terminal_state()
                || run.executor() != request.executor_id
                || held.contains(&run.id())
            {
                continue;
            }
            leases.push(lease_for(job, run.id()));
        }

        tracing::debug!(
            executor = %request.executor_id,
            cancels = cancel_ids.len(),
            preempts = preempt_ids.len(),
            leases = leases.len(),
            "answering lease request"
        );

        let mut messages = Vec::new();
        if !cancel_ids.is_empty() {
            messages.push(message(lease_stream_message::Event::CancelRuns(CancelRuns {
                run_ids: cancel_ids.iter().map(|id| id.to_string()).collect(),
            })));
        }
        if !preempt_ids.is_empty() {
            messages.push(message(lease_stream_message::Event::PreemptRuns(
                PreemptRuns {
                    run_ids: preempt_ids.iter().map(|id| id.to_string()).collect(),
                },
            )));
        }
        for lease in leases {
            messages.push(message(lease_stream_message::Event::Lease(lease)));
        }
        messages.push(end_marker());
        Ok(messages)
    }

    fn executor_snapshot(&self, request: &LeaseRequest) -> Result<ExecutorSnapshot, Status> {
        let mut nodes = Vec::with_capacity(request.nodes.len());
        for node in &request.nodes {
            let node_id = node
                .labels
                .get(&self.node_id_label)
                .cloned()
                .unwrap_or_else(|| {
                    crate::jobdb::node_id_from_executor_and_node_name(
                        &request.executor_id,
                        &node.name,
                    )
                });
            nodes.push(NodeSnapshot {
                name: node.name.clone(),
                node_id,
                allocatable: node.allocatable.clone(),
                labels: node.labels.clone(),
                taints: node.taints.clone(),
                run_ids: parse_run_ids(&node.run_ids)?,
            });
        }
        Ok(ExecutorSnapshot {
            id: request.executor_id.clone(),
            pool: request.pool.clone(),
            last_update: Some(self.clock.now()),
            nodes,
        })
    }
}

fn parse_run_ids(raw: &[String]) -> Result<Vec<RunId>, Status> {
    raw.iter()
        .map(|s| {
            RunId::parse_str(s).map_err(|_| Status::invalid_argument(format!("invalid run id {s}")))
        })
        .collect()
}

fn lease_for(job: &crate::jobdb::Job, run_id: RunId) -> JobRunLease {
    JobRunLease {
        run_id: run_id.to_string(),
        queue: job.queue().to_string(),
        jobset: job.jobset().to_string(),
        user: String::new(),
        groups: Vec::new(),
        job_id: job.id().to_string(),
        submit_job: Some(job.scheduling_info().clone()),
    }
}

fn message(event: lease_stream_message::Event) -> LeaseStreamMessage {
    LeaseStreamMessage { event: Some(event) }
}

fn end_marker() -> LeaseStreamMessage {
    message(lease_stream_message::Event::End(EndMarker {}))
}

#[tonic::async_trait]
impl ExecutorApi for ExecutorApiService {
    type LeaseJobRunsStream = ReceiverStream<Result<LeaseStreamMessage, Status>>;

    async fn lease_job_runs(
        &self,
        request: Request<Streaming<LeaseRequest>>,
    ) -> Result<Response<Self::LeaseJobRunsStream>, Status> {
        let mut requests = request.into_inner();
        let (tx, rx) = mpsc::channel(64);
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                match requests.message().await {
                    Ok(Some(lease_request)) => {
                        let executor = lease_request.executor_id.clone();
                        match service.handle_lease_request(lease_request).await {
                            Ok(burst) => {
                                for message in burst {
                                    if tx.send(Ok(message)).await.is_err() {
                                        // Receiver gone; in-flight leases are
                                        // re-derived on the next session.
                                        return;
                                    }
                                }
                            }
                            Err(status) => {
                                tracing::warn!(executor = %executor, error = %status, "lease request failed");
                                let _ = tx.send(Err(status)).await;
                                return;
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(status) => {
                        tracing::debug!(error = %status, "lease stream closed by executor");
                        return;
                    }
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn report_events(
        &self,
        request: Request<EventList>,
    ) -> Result<Response<ReportEventsResponse>, Status> {
        let sequences = request.into_inner().sequences;
        for sequence in sequences {
            let key = format!("{}:{}", sequence.queue, sequence.jobset);
            let payload = sequence.encode_to_vec();
            self.event_sink
                .send(&key, payload)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
        }
        Ok(Response::new(ReportEventsResponse {}))
    }
}
