//! Dispatcher and in-process queue: enqueue, events, waiting, listing.

use std::sync::Arc;
use std::time::Duration;

use caseflow::error::Error;
use caseflow::event::EventKind;
use caseflow::model::{Claim, JobKind, JobState, NewJob};
use caseflow::queue::memory::MemoryQueue;
use caseflow::queue::{Dispatcher, JobQueue};
use serde_json::json;

#[tokio::test]
async fn enqueue_persists_payload_and_publishes_event() {
    let queue = Arc::new(MemoryQueue::new());
    let mut events = queue.subscribe();
    let dispatcher = Dispatcher::new(queue.clone());

    let id = dispatcher
        .enqueue(
            JobKind::Ingestion,
            ["--agency", "agency-alpha", "--file", "/tmp/report.txt"],
        )
        .await
        .unwrap();

    let job = queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.arg("--file"), Some("/tmp/report.txt"));

    let event = events.recv().await.unwrap();
    assert!(matches!(
        event.kind,
        EventKind::JobQueued { id: queued, kind: JobKind::Ingestion, attempt: 0 } if queued == id
    ));
}

#[tokio::test]
async fn completed_job_cannot_fail_afterwards() {
    let queue = MemoryQueue::new();
    queue.enqueue(NewJob::new(JobKind::Allocation)).await.unwrap();
    let claimed = queue
        .claim(&[JobKind::Allocation], "w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let claim = Claim::of(&claimed, "w1");
    queue.complete(&claim, json!({ "ok": true })).await.unwrap();

    let err = queue.fail(&claim, "late failure", true).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
    let err = queue.complete(&claim, json!(null)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[tokio::test]
async fn stale_worker_cannot_settle_a_reclaimed_job() {
    let queue = MemoryQueue::new();
    let lease = Duration::from_secs(30);
    let job = queue.enqueue(NewJob::new(JobKind::Allocation)).await.unwrap();

    // w1 stalls past its lease and the job goes to w2.
    let first = queue.claim(&[JobKind::Allocation], "w1", lease).await.unwrap().unwrap();
    let stale = Claim::of(&first, "w1");
    queue.expire_lease(job.id).unwrap();
    assert_eq!(queue.recover_expired().await.unwrap().len(), 1);
    let second = queue.claim(&[JobKind::Allocation], "w2", lease).await.unwrap().unwrap();
    assert_eq!(second.attempts, 2);

    let err = queue.complete(&stale, json!({ "from": "w1" })).await.unwrap_err();
    assert!(matches!(err, Error::LeaseLost { attempt: 1, .. }));
    let err = queue.renew(&stale, lease).await.unwrap_err();
    assert!(matches!(err, Error::LeaseLost { .. }));
    let current = queue.get(job.id).await.unwrap();
    assert_eq!(current.state, JobState::Active);
    assert_eq!(current.worker_id.as_deref(), Some("w2"));

    let done = queue
        .complete(&Claim::of(&second, "w2"), json!({ "from": "w2" }))
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.attempts, 2);
    assert_eq!(done.result, Some(json!({ "from": "w2" })));

    let err = queue.fail(&stale, "late failure", true).await.unwrap_err();
    assert!(matches!(err, Error::LeaseLost { .. }));
    let stored = queue.get(job.id).await.unwrap();
    assert_eq!(stored.result, Some(json!({ "from": "w2" })));
    assert!(stored.error.is_none());
}

#[tokio::test]
async fn same_worker_cannot_settle_an_earlier_attempt() {
    let queue = MemoryQueue::new();
    let lease = Duration::from_secs(30);
    let job = queue.enqueue(NewJob::new(JobKind::Allocation)).await.unwrap();

    let first = queue.claim(&[JobKind::Allocation], "w1", lease).await.unwrap().unwrap();
    queue.expire_lease(job.id).unwrap();
    queue.recover_expired().await.unwrap();
    queue.claim(&[JobKind::Allocation], "w1", lease).await.unwrap().unwrap();

    let err = queue
        .complete(&Claim::of(&first, "w1"), json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LeaseLost { attempt: 1, .. }));
    assert_eq!(queue.get(job.id).await.unwrap().state, JobState::Active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_see_events_in_sequence_order() {
    let queue = Arc::new(MemoryQueue::new());
    let mut events = queue.subscribe();

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    queue.enqueue(NewJob::new(JobKind::Allocation)).await.unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let mut last = 0;
    for _ in 0..200 {
        let event = events.recv().await.unwrap();
        assert!(event.seq > last, "seq {} arrived after {last}", event.seq);
        last = event.seq;
    }
    assert_eq!(last, 200);
}

#[tokio::test]
async fn wait_for_terminal_sees_completion() {
    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = Dispatcher::new(queue.clone());
    let id = dispatcher.request_allocation("test").await.unwrap();

    let finisher = tokio::spawn({
        let queue = queue.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let claimed = queue
                .claim(&[JobKind::Allocation], "w1", Duration::from_secs(30))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(claimed.id, id);
            let claim = Claim::of(&claimed, "w1");
            queue.complete(&claim, json!({ "assigned": 0 })).await.unwrap();
        }
    });

    let job = dispatcher
        .wait_for_terminal(id, Duration::from_secs(5))
        .await
        .unwrap();
    finisher.await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result, Some(json!({ "assigned": 0 })));
}

#[tokio::test]
async fn wait_for_terminal_times_out() {
    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = Dispatcher::new(queue.clone());
    let id = dispatcher.request_allocation("test").await.unwrap();

    let err = dispatcher
        .wait_for_terminal(id, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
}

#[tokio::test]
async fn list_filters_by_state_and_kind_newest_first() {
    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = Dispatcher::new(queue.clone());
    let first = dispatcher.request_allocation("one").await.unwrap();
    let second = dispatcher.request_allocation("two").await.unwrap();
    dispatcher
        .enqueue(JobKind::Ingestion, ["--agency", "a", "--file", "f"])
        .await
        .unwrap();
    queue
        .claim(&[JobKind::Allocation], "w1", Duration::from_secs(30))
        .await
        .unwrap();

    let allocations = queue.list(None, Some(JobKind::Allocation), 10).await.unwrap();
    let ids: Vec<_> = allocations.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![second, first]);

    let active = queue.list(Some(JobState::Active), None, 10).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, first);

    assert_eq!(queue.list(None, None, 2).await.unwrap().len(), 2);
}
