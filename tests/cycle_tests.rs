//! Scenario tests for the reconcile/schedule/publish cycle.
//!
//! Each test seeds the job db and/or the repository stub, runs one cycle,
//! and asserts on the published events and the committed job db state.


use harness::*;

use chrono::Duration;
use flotilla::clock::Clock;
use flotilla::error::SchedulerError;
use flotilla::events::{REASON_LEASE_EXPIRED, REASON_TOO_MANY_ATTEMPTS, REASON_UNSCHEDULABLE};
use flotilla::jobdb::RunId;
use flotilla::leader::LeaderController;
use flotilla::proto::event::Event as K;
use flotilla::repository::RunRow;

#[tokio::test]
async fn test_lease_single_job_already_in_db() {
    let mut t = new_test_scheduler();
    let job = queued_job(&t.jobdb);
    let id = job.id();
    insert_jobs(&t.jobdb, vec![job]).await;
    t.algo.schedule_jobs(vec![id]);

    t.cycle().await.unwrap();

    assert_events(&t.publisher.recorded(), &[("JobRunLeased", id)]);
    let read = t.jobdb.read_txn();
    let leased = read.get_by_id(id).unwrap();
    assert!(!leased.queued());
    assert_eq!(leased.queued_version(), 2);
    let run = leased.latest_run().unwrap();
    assert!(!run.in_terminal_state());
    assert_eq!(run.executor(), "test-executor");
    assert_eq!(run.node_name(), "test-node");
}

#[tokio::test]
async fn test_lease_single_job_from_update() {
    let mut t = new_test_scheduler();
    let job = queued_job(&t.jobdb);
    let id = job.id();
    t.repository.set_rows(vec![job_row_for(&job, 1)], vec![]);
    t.algo.schedule_jobs(vec![id]);

    t.cycle().await.unwrap();

    assert_events(&t.publisher.recorded(), &[("JobRunLeased", id)]);
    assert_eq!(t.scheduler.serials(), (1, -1));
    assert!(!t.jobdb.read_txn().get_by_id(id).unwrap().queued());
}

#[tokio::test]
async fn test_nothing_leased_leaves_job_queued() {
    let mut t = new_test_scheduler();
    let job = queued_job(&t.jobdb);
    let id = job.id();
    insert_jobs(&t.jobdb, vec![job]).await;

    t.cycle().await.unwrap();

    assert_events(&t.publisher.recorded(), &[]);
    let read = t.jobdb.read_txn();
    let job = read.get_by_id(id).unwrap();
    assert!(job.queued());
    assert_eq!(job.queued_version(), 1);
}

#[tokio::test]
async fn test_failed_jobs_in_scheduler_result_publish_errors() {
    let mut t = new_test_scheduler();
    let job = queued_job(&t.jobdb);
    let id = job.id();
    insert_jobs(&t.jobdb, vec![job]).await;
    t.algo.fail_jobs(vec![id]);

    t.cycle().await.unwrap();

    assert_events(&t.publisher.recorded(), &[("JobErrors", id)]);
    let read = t.jobdb.read_txn();
    assert!(read.get_by_id(id).unwrap().in_terminal_state());
}

#[tokio::test]
async fn test_no_updates_to_leased_job() {
    let mut t = new_test_scheduler();
    heartbeat_test_executor(&t).await;
    let job = leased_job(&t.jobdb);
    let id = job.id();
    insert_jobs(&t.jobdb, vec![job]).await;

    t.cycle().await.unwrap();

    assert_events(&t.publisher.recorded(), &[]);
    let read = t.jobdb.read_txn();
    let job = read.get_by_id(id).unwrap();
    assert!(!job.queued());
    assert!(!job.in_terminal_state());
    assert_eq!(job.queued_version(), 2);
}

#[tokio::test]
async fn test_lease_returned_and_requeued_when_run_attempted() {
    let mut t = new_test_scheduler();
    heartbeat_test_executor(&t).await;
    let job = leased_job(&t.jobdb);
    let id = job.id();
    let run_id = job.latest_run().unwrap().id();
    let node_id = job.latest_run().unwrap().node_id().to_string();
    insert_jobs(&t.jobdb, vec![job.clone()]).await;
    t.repository
        .set_rows(vec![], vec![returned_run_row(&job, run_id, true, 1)]);

    t.cycle().await.unwrap();

    assert_events(&t.publisher.recorded(), &[("JobRequeued", id)]);
    let read = t.jobdb.read_txn();
    let requeued = read.get_by_id(id).unwrap();
    assert!(requeued.queued());
    assert_eq!(requeued.queued_version(), 3);
    // An anti-affinity for the node that ran it, with a version bump.
    assert_eq!(requeued.scheduling_info().version, 2);
    assert_eq!(
        requeued.scheduling_info().node_anti_affinities,
        vec![node_id]
    );
}

#[tokio::test]
async fn test_lease_returned_and_requeued_when_run_not_attempted() {
    let mut t = new_test_scheduler();
    heartbeat_test_executor(&t).await;
    let job = leased_job(&t.jobdb);
    let id = job.id();
    let run_id = job.latest_run().unwrap().id();
    insert_jobs(&t.jobdb, vec![job.clone()]).await;
    t.repository
        .set_rows(vec![], vec![returned_run_row(&job, run_id, false, 1)]);

    t.cycle().await.unwrap();

    assert_events(&t.publisher.recorded(), &[("JobRequeued", id)]);
    let read = t.jobdb.read_txn();
    let requeued = read.get_by_id(id).unwrap();
    assert!(requeued.queued());
    assert_eq!(requeued.queued_version(), 3);
    // No attempt on a node, so no anti-affinity and no version bump.
    assert_eq!(requeued.scheduling_info().version, 1);
    assert!(requeued.scheduling_info().node_anti_affinities.is_empty());
}

#[tokio::test]
async fn test_lease_returned_and_failed_when_unschedulable() {
    let mut t = new_test_scheduler();
    heartbeat_test_executor(&t).await;
    let job = leased_job(&t.jobdb);
    let id = job.id();
    let run_id = job.latest_run().unwrap().id();
    insert_jobs(&t.jobdb, vec![job.clone()]).await;
    t.repository
        .set_rows(vec![], vec![returned_run_row(&job, run_id, true, 1)]);
    t.checker.ok.store(false, std::sync::atomic::Ordering::SeqCst);

    t.cycle().await.unwrap();

    let recorded = t.publisher.recorded();
    assert_events(&recorded, &[("JobErrors", id)]);
    let reason: Vec<_> = recorded
        .iter()
        .flat_map(|s| s.events.iter())
        .filter_map(|e| match e.event.as_ref() {
            Some(K::JobErrors(x)) => Some(x.errors[0].reason.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(reason, vec![REASON_UNSCHEDULABLE.to_string()]);

    let read = t.jobdb.read_txn();
    let failed = read.get_by_id(id).unwrap();
    assert!(failed.failed());
    // The queued version stays at its pre-return value.
    assert_eq!(failed.queued_version(), 2);
}

#[tokio::test]
async fn test_lease_returned_too_many_times_fails_job() {
    let mut t = new_test_scheduler();
    heartbeat_test_executor(&t).await;
    let job = leased_job(&t.jobdb);
    let id = job.id();
    let run_id = job.latest_run().unwrap().id();
    insert_jobs(&t.jobdb, vec![job.clone()]).await;
    // Two attempted returns with max_attempts = 2.
    t.repository.set_rows(
        vec![],
        vec![
            returned_run_row(&job, run_id, true, 1),
            RunRow {
                serial: 2,
                ..returned_run_row(&job, RunId::new_v4(), true, 2)
            },
        ],
    );

    t.cycle().await.unwrap();

    let recorded = t.publisher.recorded();
    assert_events(&recorded, &[("JobErrors", id)]);
    let reasons: Vec<_> = recorded
        .iter()
        .flat_map(|s| s.events.iter())
        .filter_map(|e| match e.event.as_ref() {
            Some(K::JobErrors(x)) => Some(x.errors[0].reason.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![REASON_TOO_MANY_ATTEMPTS.to_string()]);
    assert!(t.jobdb.read_txn().get_by_id(id).unwrap().in_terminal_state());
}

#[tokio::test]
async fn test_lease_returned_for_fail_fast_job() {
    let mut t = new_test_scheduler();
    heartbeat_test_executor(&t).await;
    let job = leased_job_with_info(&t.jobdb, fail_fast_scheduling_info());
    let id = job.id();
    let run_id = job.latest_run().unwrap().id();
    insert_jobs(&t.jobdb, vec![job.clone()]).await;
    t.repository
        .set_rows(vec![], vec![returned_run_row(&job, run_id, false, 1)]);

    t.cycle().await.unwrap();

    assert_events(&t.publisher.recorded(), &[("JobErrors", id)]);
    assert!(t.jobdb.read_txn().get_by_id(id).unwrap().in_terminal_state());
}

#[tokio::test]
async fn test_cancel_requested_job_is_cancelled() {
    let mut t = new_test_scheduler();
    heartbeat_test_executor(&t).await;
    let job = leased_job(&t.jobdb);
    let id = job.id();
    insert_jobs(&t.jobdb, vec![job.clone()]).await;
    let mut row = job_row_for(&job, 1);
    row.cancel_requested = true;
    t.repository.set_rows(vec![row], vec![]);

    t.cycle().await.unwrap();

    assert_events(&t.publisher.recorded(), &[("CancelledJob", id)]);
    let read = t.jobdb.read_txn();
    let cancelled = read.get_by_id(id).unwrap();
    assert!(cancelled.cancelled());
    // Terminal job implies terminal runs.
    assert!(cancelled.all_runs().iter().all(|r| r.in_terminal_state()));
}

#[tokio::test]
async fn test_new_job_with_expired_queue_ttl_cancelled_in_one_cycle() {
    let mut t = new_test_scheduler();
    let job = queued_job_with_info(&t.jobdb, scheduling_info_with_queue_ttl(2));
    let id = job.id();
    let mut row = job_row_for(&job, 1);
    row.submitted = t.clock.now().timestamp_millis() - 10_000;
    t.repository.set_rows(vec![row], vec![]);

    t.cycle().await.unwrap();

    // Both the request and the cancellation are published this cycle.
    assert_events(
        &t.publisher.recorded(),
        &[("CancelJob", id), ("CancelledJob", id)],
    );
    assert!(t.jobdb.read_txn().get_by_id(id).unwrap().in_terminal_state());
}

#[tokio::test]
async fn test_existing_job_with_expired_queue_ttl_cancelled() {
    let mut t = new_test_scheduler();
    let job = queued_job_with_info(&t.jobdb, scheduling_info_with_queue_ttl(2));
    let id = job.id();
    insert_jobs(&t.jobdb, vec![job]).await;
    t.clock.advance(Duration::seconds(10));

    t.cycle().await.unwrap();

    assert_events(
        &t.publisher.recorded(),
        &[("CancelJob", id), ("CancelledJob", id)],
    );
    assert!(t.jobdb.read_txn().get_by_id(id).unwrap().in_terminal_state());
}

#[tokio::test]
async fn test_cancel_requested_ttl_job_only_publishes_cancelled() {
    let mut t = new_test_scheduler();
    let job = queued_job_with_info(&t.jobdb, scheduling_info_with_queue_ttl(2));
    let id = job.id();
    let mut row = job_row_for(&job, 1);
    row.submitted = t.clock.now().timestamp_millis() - 10_000;
    row.cancel_requested = true;
    t.repository.set_rows(vec![row], vec![]);

    t.cycle().await.unwrap();

    // The cancel request already exists, so only the cancellation goes out.
    assert_events(&t.publisher.recorded(), &[("CancelledJob", id)]);
    assert!(t.jobdb.read_txn().get_by_id(id).unwrap().in_terminal_state());
}

#[tokio::test]
async fn test_job_reprioritised() {
    let mut t = new_test_scheduler();
    let job = queued_job(&t.jobdb);
    let id = job.id();
    insert_jobs(&t.jobdb, vec![job.clone()]).await;
    let mut row = job_row_for(&job, 1);
    row.priority = 2;
    t.repository.set_rows(vec![row], vec![]);

    t.cycle().await.unwrap();

    assert_events(&t.publisher.recorded(), &[("ReprioritisedJob", id)]);
    let read = t.jobdb.read_txn();
    let job = read.get_by_id(id).unwrap();
    assert!(job.queued());
    assert_eq!(job.priority(), 2);
}

#[tokio::test]
async fn test_lease_expired_for_stale_executor() {
    let mut t = new_test_scheduler();
    // Last heartbeat two executor-timeouts ago.
    heartbeat_executor(
        &t,
        "testExecutor",
        t.clock.now() - Duration::hours(2 * EXECUTOR_TIMEOUT_HOURS),
    )
    .await;
    let job = leased_job(&t.jobdb);
    let id = job.id();
    insert_jobs(&t.jobdb, vec![job]).await;

    t.cycle().await.unwrap();

    let recorded = t.publisher.recorded();
    assert_events(&recorded, &[("JobRunErrors", id), ("JobErrors", id)]);
    let reasons: Vec<_> = recorded
        .iter()
        .flat_map(|s| s.events.iter())
        .filter_map(|e| match e.event.as_ref() {
            Some(K::JobErrors(x)) => Some(x.errors[0].reason.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![REASON_LEASE_EXPIRED.to_string()]);
    let read = t.jobdb.read_txn();
    let failed = read.get_by_id(id).unwrap();
    assert!(failed.in_terminal_state());
    assert!(failed.all_runs().iter().all(|r| r.in_terminal_state()));
}

#[tokio::test]
async fn test_job_failed_with_error_payload() {
    let mut t = new_test_scheduler();
    heartbeat_test_executor(&t).await;
    let job = leased_job(&t.jobdb);
    let id = job.id();
    let run_id = job.latest_run().unwrap().id();
    insert_jobs(&t.jobdb, vec![job.clone()]).await;
    t.repository.set_rows(
        vec![],
        vec![RunRow {
            run_id,
            job_id: id,
            jobset: "testJobset".to_string(),
            executor: "testExecutor".to_string(),
            failed: true,
            serial: 1,
            ..Default::default()
        }],
    );
    t.repository.put_run_error(
        run_id,
        flotilla::proto::Error {
            terminal: true,
            reason: "pod-error".to_string(),
            message: "generic pod error".to_string(),
        },
    );

    t.cycle().await.unwrap();

    let recorded = t.publisher.recorded();
    assert_events(&recorded, &[("JobRunErrors", id), ("JobErrors", id)]);
    // The stored payload travels on the run error event.
    let messages: Vec<_> = recorded
        .iter()
        .flat_map(|s| s.events.iter())
        .filter_map(|e| match e.event.as_ref() {
            Some(K::JobRunErrors(x)) => Some(x.errors[0].message.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(messages, vec!["generic pod error".to_string()]);
    assert!(t.jobdb.read_txn().get_by_id(id).unwrap().in_terminal_state());
}

#[tokio::test]
async fn test_job_succeeded() {
    let mut t = new_test_scheduler();
    heartbeat_test_executor(&t).await;
    let job = leased_job(&t.jobdb);
    let id = job.id();
    let run_id = job.latest_run().unwrap().id();
    insert_jobs(&t.jobdb, vec![job]).await;
    t.repository.set_rows(
        vec![],
        vec![RunRow {
            run_id,
            job_id: id,
            jobset: "testJobset".to_string(),
            executor: "testExecutor".to_string(),
            succeeded: true,
            serial: 1,
            ..Default::default()
        }],
    );

    t.cycle().await.unwrap();

    assert_events(&t.publisher.recorded(), &[("JobSucceeded", id)]);
    let read = t.jobdb.read_txn();
    let job = read.get_by_id(id).unwrap();
    assert!(job.succeeded());
    assert!(job.all_runs().iter().all(|r| r.in_terminal_state()));
}

#[tokio::test]
async fn test_job_preempted_by_scheduling_pass() {
    let mut t = new_test_scheduler();
    heartbeat_test_executor(&t).await;
    let job = leased_job(&t.jobdb);
    let id = job.id();
    insert_jobs(&t.jobdb, vec![job]).await;
    t.algo.preempt_jobs(vec![id]);

    t.cycle().await.unwrap();

    assert_events(
        &t.publisher.recorded(),
        &[
            ("JobRunPreempted", id),
            ("JobRunErrors", id),
            ("JobErrors", id),
        ],
    );
    assert!(t.jobdb.read_txn().get_by_id(id).unwrap().in_terminal_state());
}

#[tokio::test]
async fn test_fetch_failure_rolls_back() {
    let mut t = new_test_scheduler();
    heartbeat_test_executor(&t).await;
    let job = leased_job(&t.jobdb);
    let id = job.id();
    insert_jobs(&t.jobdb, vec![job]).await;
    let before = db_snapshot(&t.jobdb);
    t.repository.fail(true);

    assert!(t.cycle().await.is_err());

    assert!(t.publisher.recorded().is_empty());
    assert_eq!(db_snapshot(&t.jobdb), before);
    assert_eq!(t.scheduler.serials(), (-1, -1));
    assert!(!t.jobdb.read_txn().get_by_id(id).unwrap().queued());
}

#[tokio::test]
async fn test_schedule_failure_rolls_back() {
    let mut t = new_test_scheduler();
    heartbeat_test_executor(&t).await;
    let job = leased_job(&t.jobdb);
    insert_jobs(&t.jobdb, vec![job]).await;
    let before = db_snapshot(&t.jobdb);
    t.algo.fail(true);

    assert!(t.cycle().await.is_err());

    assert!(t.publisher.recorded().is_empty());
    assert_eq!(db_snapshot(&t.jobdb), before);
}

#[tokio::test]
async fn test_publish_failure_rolls_back_and_retry_is_identical() {
    let mut t = new_test_scheduler();
    let job = queued_job(&t.jobdb);
    let id = job.id();
    t.repository.set_rows(vec![job_row_for(&job, 1)], vec![]);
    t.algo.schedule_jobs(vec![id]);
    t.publisher.fail(true);

    let before = db_snapshot(&t.jobdb);
    assert!(t.cycle().await.is_err());

    // Rolled back: nothing committed, cursors unmoved.
    assert_eq!(db_snapshot(&t.jobdb), before);
    assert_eq!(t.scheduler.serials(), (-1, -1));
    let attempted = t.publisher.take();

    // The retry reproduces the same delta and publishes the same events.
    t.publisher.fail(false);
    t.cycle().await.unwrap();
    let published = t.publisher.recorded();

    let kinds = |seqs: &[flotilla::proto::EventSequence]| {
        let mut v: Vec<_> = seqs
            .iter()
            .flat_map(|s| s.events.iter())
            .filter_map(kind_and_job_id)
            .collect();
        v.sort();
        v
    };
    assert_eq!(kinds(&attempted), kinds(&published));
    assert_eq!(t.scheduler.serials(), (1, -1));
    assert!(!t.jobdb.read_txn().get_by_id(id).unwrap().queued());
}

#[tokio::test]
async fn test_invalid_leader_token_fences_cycle() {
    let mut t = new_test_scheduler();
    let job = queued_job(&t.jobdb);
    let id = job.id();
    insert_jobs(&t.jobdb, vec![job]).await;
    t.algo.schedule_jobs(vec![id]);

    let token = t.leader.get_token();
    t.leader.invalidate();
    let before = db_snapshot(&t.jobdb);

    let err = t.scheduler.cycle(false, token, true).await.unwrap_err();
    assert!(matches!(err, SchedulerError::NotLeader));
    assert!(t.publisher.recorded().is_empty());
    assert_eq!(db_snapshot(&t.jobdb), before);
}

#[tokio::test]
async fn test_reapplying_identical_delta_changes_nothing() {
    let mut t = new_test_scheduler();
    heartbeat_test_executor(&t).await;
    let job = leased_job(&t.jobdb);
    let id = job.id();
    let run_id = job.latest_run().unwrap().id();
    insert_jobs(&t.jobdb, vec![job.clone()]).await;
    t.repository
        .set_rows(vec![], vec![returned_run_row(&job, run_id, true, 1)]);

    t.cycle().await.unwrap();
    let after_first = db_snapshot(&t.jobdb);
    assert_events(&t.publisher.take(), &[("JobRequeued", id)]);

    // The same content arrives again under a fresh serial: the monotone-flag
    // rules make the merge a no-op, so no new events and no state change.
    t.repository.set_rows(
        vec![],
        vec![RunRow {
            serial: 2,
            ..returned_run_row(&job, run_id, true, 2)
        }],
    );
    t.cycle().await.unwrap();

    assert_events(&t.publisher.recorded(), &[]);
    assert_eq!(db_snapshot(&t.jobdb), after_first);
}
