//! Tests for the periodic cycle loop and its leadership gating.


use harness::*;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_run_loop_publishes_only_while_leader() {
    let t = new_test_scheduler();
    let TestScheduler {
        mut scheduler,
        jobdb,
        repository,
        algo,
        publisher,
        leader,
        ..
    } = t;

    let job = queued_job(&jobdb);
    let id = job.id();
    repository.set_rows(vec![job_row_for(&job, 1)], vec![]);
    algo.schedule_jobs(vec![id]);

    let shutdown = CancellationToken::new();
    let loop_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move { scheduler.run(loop_shutdown).await });

    // Leader from the start: the job gets leased within a few cycles.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_events(&publisher.take(), &[("JobRunLeased", id)]);
    assert!(!jobdb.read_txn().get_by_id(id).unwrap().queued());
    algo.schedule_jobs(vec![]);

    // Lose leadership: cycles stop publishing.
    leader.invalidate();
    tokio::time::sleep(Duration::from_millis(100)).await;
    publisher.take();
    let calls_while_follower = algo.num_calls();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(publisher.recorded().is_empty());
    assert_eq!(algo.num_calls(), calls_while_follower);

    // Regain leadership: the loop resynchronizes and cycles resume.
    leader.renew();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(algo.num_calls() > calls_while_follower);
    // The resync replays known rows without emitting anything new.
    assert_events(&publisher.recorded(), &[]);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}
