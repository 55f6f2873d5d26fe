//! Tests for the executor-facing lease stream and event reporting.


use harness::*;

use std::sync::Arc;

use chrono::Utc;
use flotilla::clock::{Clock, ManualClock};
use flotilla::executorapi::ExecutorApiService;
use flotilla::jobdb::{JobDb, RunId};
use flotilla::leader::StandaloneLeaderController;
use flotilla::proto::executor_api_client::ExecutorApiClient;
use flotilla::proto::executor_api_server::ExecutorApiServer;
use flotilla::proto::{
    lease_stream_message, EventList, EventSequence, LeaseRequest, NodeInfo,
};
use flotilla::publisher::InMemoryEventSink;
use flotilla::repository::{ExecutorRepository, InMemoryExecutorRepository};

struct TestApi {
    service: ExecutorApiService,
    jobdb: JobDb,
    repository: Arc<StubJobRepository>,
    executors: Arc<InMemoryExecutorRepository>,
    sink: Arc<InMemoryEventSink>,
    leader: Arc<StandaloneLeaderController>,
    clock: Arc<ManualClock>,
}

fn new_test_api() -> TestApi {
    let jobdb = test_job_db();
    let repository = Arc::new(StubJobRepository::new());
    let executors = Arc::new(InMemoryExecutorRepository::new());
    let sink = Arc::new(InMemoryEventSink::new(1));
    let leader = Arc::new(StandaloneLeaderController::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let service = ExecutorApiService::new(
        jobdb.clone(),
        repository.clone(),
        executors.clone(),
        sink.clone(),
        leader.clone(),
        "kubernetes.io/hostname".to_string(),
        clock.clone(),
    );
    TestApi {
        service,
        jobdb,
        repository,
        executors,
        sink,
        leader,
        clock,
    }
}

fn lease_request(executor: &str, run_ids: Vec<RunId>) -> LeaseRequest {
    LeaseRequest {
        executor_id: executor.to_string(),
        pool: "default".to_string(),
        resources: Default::default(),
        minimum_job_size: Default::default(),
        nodes: vec![NodeInfo {
            name: "test-node".to_string(),
            allocatable: Default::default(),
            run_ids: run_ids.iter().map(|id| id.to_string()).collect(),
            taints: vec![],
            labels: Default::default(),
        }],
        unassigned_job_run_ids: vec![],
        max_jobs_to_lease: 10,
    }
}

enum Reply {
    Cancels(Vec<String>),
    Preempts(Vec<String>),
    Lease(flotilla::proto::JobRunLease),
    End,
}

fn classify(messages: Vec<flotilla::proto::LeaseStreamMessage>) -> Vec<Reply> {
    messages
        .into_iter()
        .map(|m| match m.event.unwrap() {
            lease_stream_message::Event::CancelRuns(c) => Reply::Cancels(c.run_ids),
            lease_stream_message::Event::PreemptRuns(p) => Reply::Preempts(p.run_ids),
            lease_stream_message::Event::Lease(l) => Reply::Lease(l),
            lease_stream_message::Event::End(_) => Reply::End,
        })
        .collect()
}

#[tokio::test]
async fn test_heartbeat_and_inventory_recorded() {
    let t = new_test_api();
    t.service
        .handle_lease_request(lease_request("testExecutor", vec![]))
        .await
        .unwrap();

    let times = t.executors.get_last_update_times().await.unwrap();
    assert_eq!(times.get("testExecutor"), Some(&t.clock.now()));
    let stored = t.executors.get_executors().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].nodes.len(), 1);
    assert_eq!(stored[0].nodes[0].node_id, "testExecutor-test-node");
}

#[tokio::test]
async fn test_empty_request_answered_with_end_marker_only() {
    let t = new_test_api();
    let replies = classify(
        t.service
            .handle_lease_request(lease_request("testExecutor", vec![]))
            .await
            .unwrap(),
    );
    assert_eq!(replies.len(), 1);
    assert!(matches!(replies[0], Reply::End));
}

#[tokio::test]
async fn test_cancel_requested_runs_are_cancelled() {
    let t = new_test_api();
    let job = leased_job(&t.jobdb).with_cancel_requested(true);
    let run_id = job.latest_run().unwrap().id();
    insert_jobs(&t.jobdb, vec![job]).await;

    let replies = classify(
        t.service
            .handle_lease_request(lease_request("testExecutor", vec![run_id]))
            .await
            .unwrap(),
    );
    match &replies[0] {
        Reply::Cancels(ids) => assert_eq!(ids, &vec![run_id.to_string()]),
        _ => panic!("expected a CancelRuns message first"),
    }
    assert!(matches!(replies.last(), Some(Reply::End)));
}

#[tokio::test]
async fn test_preempted_runs_are_preempted() {
    let t = new_test_api();
    let job = leased_job(&t.jobdb);
    let run = job.latest_run().unwrap().clone();
    let job = job.with_updated_run(Arc::new(run.with_preempted(true)));
    let run_id = run.id();
    insert_jobs(&t.jobdb, vec![job]).await;

    let replies = classify(
        t.service
            .handle_lease_request(lease_request("testExecutor", vec![run_id]))
            .await
            .unwrap(),
    );
    match &replies[0] {
        Reply::Preempts(ids) => assert_eq!(ids, &vec![run_id.to_string()]),
        _ => panic!("expected a PreemptRuns message first"),
    }
}

#[tokio::test]
async fn test_committed_runs_are_leased_up_to_cap() {
    let t = new_test_api();
    let jobs: Vec<_> = (0..3).map(|_| leased_job(&t.jobdb)).collect();
    insert_jobs(&t.jobdb, jobs.clone()).await;

    let mut request = lease_request("testExecutor", vec![]);
    request.max_jobs_to_lease = 2;
    let replies = classify(t.service.handle_lease_request(request).await.unwrap());

    let leases: Vec<_> = replies
        .iter()
        .filter_map(|r| match r {
            Reply::Lease(l) => Some(l.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(leases.len(), 2);
    for lease in &leases {
        assert_eq!(lease.queue, "testQueue");
        assert_eq!(lease.jobset, "testJobset");
        assert!(lease.submit_job.is_some());
        assert!(jobs.iter().any(|j| j.id().to_string() == lease.job_id));
    }
    assert!(matches!(replies.last(), Some(Reply::End)));
}

#[tokio::test]
async fn test_reported_runs_are_not_leased_again() {
    let t = new_test_api();
    let job = leased_job(&t.jobdb);
    let run_id = job.latest_run().unwrap().id();
    insert_jobs(&t.jobdb, vec![job]).await;

    let replies = classify(
        t.service
            .handle_lease_request(lease_request("testExecutor", vec![run_id]))
            .await
            .unwrap(),
    );
    assert_eq!(replies.len(), 1);
    assert!(matches!(replies[0], Reply::End));
}

#[tokio::test]
async fn test_unassigned_runs_are_confirmed_unless_inactive() {
    let t = new_test_api();
    let confirmed = leased_job(&t.jobdb);
    let confirmed_run = confirmed.latest_run().unwrap().id();
    let stale = leased_job(&t.jobdb);
    let stale_run = stale.latest_run().unwrap().id();
    insert_jobs(&t.jobdb, vec![confirmed, stale]).await;
    t.repository
        .inactive_runs
        .lock()
        .unwrap()
        .push(stale_run);

    let mut request = lease_request("testExecutor", vec![]);
    request.unassigned_job_run_ids = vec![confirmed_run.to_string(), stale_run.to_string()];
    let replies = classify(t.service.handle_lease_request(request).await.unwrap());

    let mut cancels = Vec::new();
    let mut leases = Vec::new();
    for reply in &replies {
        match reply {
            Reply::Cancels(ids) => cancels.extend(ids.clone()),
            Reply::Lease(l) => leases.push(l.run_id.clone()),
            _ => {}
        }
    }
    assert_eq!(cancels, vec![stale_run.to_string()]);
    assert!(leases.contains(&confirmed_run.to_string()));
    assert!(!leases.contains(&stale_run.to_string()));
}

#[tokio::test]
async fn test_non_leader_answers_with_end_marker_only() {
    let t = new_test_api();
    let job = leased_job(&t.jobdb).with_cancel_requested(true);
    let run_id = job.latest_run().unwrap().id();
    insert_jobs(&t.jobdb, vec![job]).await;
    t.leader.invalidate();

    let replies = classify(
        t.service
            .handle_lease_request(lease_request("testExecutor", vec![run_id]))
            .await
            .unwrap(),
    );
    assert_eq!(replies.len(), 1);
    assert!(matches!(replies[0], Reply::End));

    // The heartbeat is still recorded so liveness tracking keeps working.
    assert!(t
        .executors
        .get_last_update_times()
        .await
        .unwrap()
        .contains_key("testExecutor"));
}

#[tokio::test]
async fn test_report_events_forwarded_to_bus() {
    let t = new_test_api();
    let sequence = EventSequence {
        queue: "testQueue".to_string(),
        jobset: "testJobset".to_string(),
        user: String::new(),
        groups: vec![],
        events: vec![flotilla::events::event(
            1,
            flotilla::proto::event::Event::JobRunRunning(flotilla::proto::JobRunRunning {
                job_id: flotilla::jobdb::JobId::new().to_string(),
                run_id: RunId::new_v4().to_string(),
            }),
        )],
    };

    use flotilla::proto::executor_api_server::ExecutorApi;
    ExecutorApi::report_events(
        &t.service,
        tonic::Request::new(EventList {
            sequences: vec![sequence],
        }),
    )
    .await
    .unwrap();

    let forwarded = t.sink.sequences();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].queue, "testQueue");
    assert_eq!(forwarded[0].events.len(), 1);
}

#[tokio::test]
async fn test_lease_stream_over_grpc() {
    let t = new_test_api();
    let job = leased_job(&t.jobdb);
    let id = job.id();
    insert_jobs(&t.jobdb, vec![job]).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
    let service = t.service.clone();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(ExecutorApiServer::new(service))
            .serve_with_incoming(incoming)
            .await
            .unwrap();
    });

    let mut client = ExecutorApiClient::connect(format!("http://{addr}"))
        .await
        .unwrap();
    let outbound = tokio_stream::iter(vec![lease_request("testExecutor", vec![])]);
    let mut inbound = client.lease_job_runs(outbound).await.unwrap().into_inner();

    let mut messages = Vec::new();
    while let Some(message) = inbound.message().await.unwrap() {
        let done = matches!(message.event, Some(lease_stream_message::Event::End(_)));
        messages.push(message);
        if done {
            break;
        }
    }

    let replies = classify(messages);
    let leases: Vec<_> = replies
        .iter()
        .filter_map(|r| match r {
            Reply::Lease(l) => Some(l.job_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(leases, vec![id.to_string()]);
    assert!(matches!(replies.last(), Some(Reply::End)));
}
