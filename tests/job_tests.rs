//! Job table behaviour: claiming, due times, failure backoff and drain helpers.


use std::collections::HashSet;
use std::time::Duration;

use nodequeue::clock::Clock;
use nodequeue::scheduler::Priority;
use nodequeue::{NewWork, NonPerformingQueuer, QueueError, Store, Transaction};
use serde_json::json;
use test_harness::{
    assert_eventually, ClockExt, Fixture, BLOCKING_WORK, FAILING_WORK, TEMPORARY_DELAY,
    TEMPORARY_WORK,
};

#[tokio::test]
async fn test_make_job_defaults_not_before_to_now() {
    let fx = Fixture::new();
    let now = fx.clock.now();
    let proposal = fx
        .enqueue(NewWork::from_value("DUMMY_WORK", json!({"a": 1, "b": 2})))
        .await
        .unwrap();

    assert_eq!(proposal.not_before, now);
    let job = fx.job(proposal.job_id).await.unwrap();
    assert_eq!(job.priority, Priority::Low);
    assert_eq!(job.failed, 0);
    assert!(job.assigned.is_none());
    assert_eq!(fx.store.work_count("DUMMY_WORK"), 1);
}

#[tokio::test]
async fn test_make_job_rejects_unknown_type_and_heavy_work() {
    let fx = Fixture::new();
    let mut txn = fx.store.begin("enqueue").await.unwrap();

    let err = fx
        .queue
        .make_job(txn.as_mut(), NewWork::from_value("NOPE", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::UnknownWorkType(_)));

    let err = fx
        .queue
        .make_job(
            txn.as_mut(),
            NewWork::from_value("DUMMY_WORK", json!({})).with_weight(11),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidWork(_)));
    txn.abort().await.unwrap();
}

#[tokio::test]
async fn test_aborted_enqueue_leaves_nothing() {
    let fx = Fixture::new();
    let mut txn = fx.store.begin("enqueue").await.unwrap();
    fx.queue
        .make_job(txn.as_mut(), fx.dummy(1, 1, Duration::ZERO))
        .await
        .unwrap();
    txn.abort().await.unwrap();

    assert_eq!(fx.store.job_count(), 0);
    assert_eq!(fx.store.work_count("DUMMY_WORK"), 0);
}

#[tokio::test]
async fn test_not_before_boundary() {
    let fx = Fixture::new();
    let when = fx.clock.now_plus(Duration::from_secs(10));
    fx.enqueue(
        NewWork::from_value("DUMMY_WORK", json!({"a": 1, "b": 1})).not_before(when),
    )
    .await
    .unwrap();

    let mut txn = fx.store.begin("poll").await.unwrap();
    let early = fx
        .queue
        .next_job(
            txn.as_mut(),
            fx.clock.now_plus(Duration::from_secs(9)),
            Priority::Low,
        )
        .await
        .unwrap();
    assert!(early.is_none());

    let exact = fx
        .queue
        .next_job(txn.as_mut(), when, Priority::Low)
        .await
        .unwrap();
    assert!(exact.is_some());
    txn.commit().await.unwrap();
}

#[tokio::test]
async fn test_next_job_respects_min_priority_and_prefers_higher() {
    let fx = Fixture::new();
    let low = fx
        .enqueue(fx.dummy(1, 1, Duration::from_secs(1)))
        .await
        .unwrap();
    let high = fx
        .enqueue(
            fx.dummy(2, 2, Duration::from_secs(1))
                .with_priority(Priority::High),
        )
        .await
        .unwrap();

    let now = fx.clock.now();
    let mut txn = fx.store.begin("poll").await.unwrap();
    let first = fx
        .queue
        .next_job(txn.as_mut(), now, Priority::Low)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.job_id, high.job_id);
    txn.commit().await.unwrap();

    let mut txn = fx.store.begin("poll").await.unwrap();
    let jobs = fx
        .queue
        .next_jobs(txn.as_mut(), now, Priority::Medium, 10)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_id, high.job_id);
    assert!(jobs.iter().all(|j| j.job_id != low.job_id));
    txn.commit().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_pollers_never_share_a_job() {
    let fx = Fixture::new();
    for i in 0..3 {
        fx.enqueue(fx.dummy(i, i, Duration::from_secs(20)))
            .await
            .unwrap();
    }

    let now = fx.clock.now();
    let mut pollers = Vec::new();
    let mut seen = HashSet::new();
    for _ in 0..4 {
        let mut txn = fx.store.begin("poll").await.unwrap();
        if let Some(job) = fx
            .queue
            .next_job(txn.as_mut(), now, Priority::Low)
            .await
            .unwrap()
        {
            assert!(seen.insert(job.job_id), "job {} claimed twice", job.job_id);
        }
        pollers.push(txn);
    }
    assert_eq!(seen.len(), 3);

    for txn in pollers {
        txn.commit().await.unwrap();
    }
}

#[tokio::test]
async fn test_assigned_job_is_skipped_until_overdue() {
    let fx = Fixture::new();
    let proposal = fx
        .enqueue(fx.dummy(1, 1, Duration::from_secs(1)))
        .await
        .unwrap();
    let claimed = fx.claim(proposal.job_id).await;
    assert!(claimed.assigned.is_some());

    let mut txn = fx.store.begin("poll").await.unwrap();
    assert!(fx
        .queue
        .next_job(txn.as_mut(), fx.clock.now(), Priority::Low)
        .await
        .unwrap()
        .is_none());
    let later = fx
        .clock
        .now_plus(fx.queue.config().overdue_timeout + Duration::from_secs(1));
    let overdue = fx
        .queue
        .next_job(txn.as_mut(), later, Priority::Low)
        .await
        .unwrap();
    assert_eq!(overdue.map(|j| j.job_id), Some(proposal.job_id));
    txn.commit().await.unwrap();
}

#[tokio::test]
async fn test_ultimately_perform_runs_and_removes_job() {
    let fx = Fixture::new();
    let proposal = fx
        .enqueue(fx.dummy(3, 4, Duration::from_secs(20)))
        .await
        .unwrap();
    fx.claim(proposal.job_id).await;

    fx.queue
        .ultimately_perform(proposal.job_id, &fx.queuer)
        .await
        .unwrap();

    assert_eq!(fx.result(proposal.job_id), Some(7));
    assert!(fx.job(proposal.job_id).await.is_none());
    assert_eq!(fx.store.work_count("DUMMY_WORK"), 0);
}

#[tokio::test]
async fn test_ultimately_perform_of_missing_job_is_ok() {
    let fx = Fixture::new();
    fx.queue.ultimately_perform(42, &fx.queuer).await.unwrap();
}

#[tokio::test]
async fn test_failed_job_is_unassigned_and_backed_off() {
    let fx = Fixture::new();
    let proposal = fx
        .enqueue(NewWork::from_value(FAILING_WORK, json!({})))
        .await
        .unwrap();
    fx.claim(proposal.job_id).await;

    let now = fx.clock.now();
    fx.queue
        .ultimately_perform(proposal.job_id, &fx.queuer)
        .await
        .unwrap();

    let job = fx.job(proposal.job_id).await.unwrap();
    assert!(job.assigned.is_none());
    assert!(job.overdue.is_none());
    assert_eq!(job.failed, 1);
    assert!(job.not_before > now);
    assert_eq!(fx.store.work_count(FAILING_WORK), 1);

    // A second failure waits longer.
    let first_delay = job.not_before - now;
    fx.clock.set(job.not_before);
    let retry_at = fx.clock.now();
    fx.claim(proposal.job_id).await;
    fx.queue
        .ultimately_perform(proposal.job_id, &fx.queuer)
        .await
        .unwrap();
    let job = fx.job(proposal.job_id).await.unwrap();
    assert_eq!(job.failed, 2);
    assert!(job.not_before - retry_at > first_delay);
}

#[tokio::test]
async fn test_temporary_failure_uses_requested_delay() {
    let fx = Fixture::new();
    let proposal = fx
        .enqueue(NewWork::from_value(TEMPORARY_WORK, json!({})))
        .await
        .unwrap();
    fx.claim(proposal.job_id).await;

    fx.queue
        .ultimately_perform(proposal.job_id, &fx.queuer)
        .await
        .unwrap();
    let job = fx.job(proposal.job_id).await.unwrap();
    assert_eq!(job.failed, 1);
    assert!(job.assigned.is_none());
    assert_eq!(job.not_before, fx.clock.now_plus(TEMPORARY_DELAY));

    fx.clock.set(job.not_before);
    fx.queue
        .ultimately_perform(proposal.job_id, &fx.queuer)
        .await
        .unwrap();
    let job = fx.job(proposal.job_id).await.unwrap();
    assert_eq!(job.failed, 2);
    assert_eq!(job.not_before, fx.clock.now_plus(TEMPORARY_DELAY * 2));
}

#[tokio::test]
async fn test_running_job_defers_without_counting_failure() {
    let fx = Fixture::new();
    let proposal = fx
        .enqueue(fx.dummy(1, 2, Duration::from_secs(1)))
        .await
        .unwrap();

    // Someone else is executing this work row.
    let mut holder = fx.store.begin("holder").await.unwrap();
    assert!(holder
        .try_lock_work("DUMMY_WORK", proposal.work_id, None)
        .await
        .unwrap());

    let mut txn = fx.store.begin("check").await.unwrap();
    let job = txn.load_job(proposal.job_id).await.unwrap().unwrap();
    assert!(fx.queue.is_running(txn.as_mut(), &job).await.unwrap());
    txn.commit().await.unwrap();

    let now = fx.clock.now();
    fx.queue
        .ultimately_perform(proposal.job_id, &fx.queuer)
        .await
        .unwrap();
    holder.abort().await.unwrap();

    let job = fx.job(proposal.job_id).await.unwrap();
    assert_eq!(job.failed, 0);
    assert!(job.not_before > now);
    assert!(fx.result(proposal.job_id).is_none());
}

#[tokio::test]
async fn test_group_member_waits_for_running_sibling() {
    let fx = Fixture::new();
    let first = fx.enqueue(fx.blocking(Some("tenant-a"))).await.unwrap();
    let second = fx.enqueue(fx.blocking(Some("tenant-a"))).await.unwrap();
    fx.claim(first.job_id).await;
    fx.claim(second.job_id).await;

    let queue = fx.queue.clone();
    let queuer = NonPerformingQueuer::new(queue.clone());
    let running =
        tokio::spawn(async move { queue.ultimately_perform(first.job_id, &queuer).await });
    let gate = fx.gate.clone();
    assert_eventually(
        || async { gate.entered() == 1 },
        Duration::from_secs(5),
        "first group member never started",
    )
    .await;

    // The sibling cannot take the group lock: it is counted as a failure and
    // pushed back without ever reaching its work.
    fx.queue
        .ultimately_perform(second.job_id, &fx.queuer)
        .await
        .unwrap();
    assert_eq!(fx.gate.entered(), 1);
    let job = fx.job(second.job_id).await.unwrap();
    assert_eq!(job.failed, 1);
    assert!(job.assigned.is_none());
    assert_eq!(
        job.not_before,
        fx.clock.now_plus(fx.queue.config().lock_reschedule_interval)
    );

    fx.gate.release(false);
    running.await.unwrap().unwrap();
    assert!(fx.job(first.job_id).await.is_none());
    assert_eq!(fx.store.work_count(BLOCKING_WORK), 1);
}

#[tokio::test]
async fn test_histogram_counts_by_state() {
    let fx = Fixture::new();
    let first = fx
        .enqueue(fx.dummy(1, 1, Duration::from_secs(5)))
        .await
        .unwrap();
    fx.enqueue(fx.dummy(2, 2, Duration::from_secs(5)))
        .await
        .unwrap();
    fx.enqueue(
        NewWork::from_value("DUMMY_WORK", json!({"a": 0, "b": 0}))
            .not_before(fx.clock.now_plus(Duration::from_secs(60))),
    )
    .await
    .unwrap();
    fx.claim(first.job_id).await;

    let mut txn = fx.store.begin("histogram").await.unwrap();
    let histogram = fx.queue.histogram(txn.as_mut()).await.unwrap();
    txn.commit().await.unwrap();

    let dummy = histogram["DUMMY_WORK"];
    assert_eq!(dummy.queued, 3);
    assert_eq!(dummy.assigned, 1);
    assert_eq!(dummy.late, 1);
    assert_eq!(dummy.failed, 0);
    assert_eq!(histogram[FAILING_WORK].queued, 0);
}

#[tokio::test]
async fn test_wait_helpers_report_timeout() {
    let fx = Fixture::new();
    assert!(fx.queue.wait_empty(Duration::from_millis(50)).await.unwrap());

    let proposal = fx
        .enqueue(fx.dummy(1, 1, Duration::ZERO))
        .await
        .unwrap();
    assert!(!fx.queue.wait_empty(Duration::from_millis(50)).await.unwrap());
    assert!(!fx
        .queue
        .wait_job_done(proposal.job_id, Duration::from_millis(50))
        .await
        .unwrap());

    fx.queue
        .ultimately_perform(proposal.job_id, &fx.queuer)
        .await
        .unwrap();
    assert!(fx
        .queue
        .wait_job_done(proposal.job_id, Duration::from_millis(50))
        .await
        .unwrap());
    assert!(fx
        .queue
        .wait_work_done(&["DUMMY_WORK"], Duration::from_millis(50))
        .await
        .unwrap());
}
