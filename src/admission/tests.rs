//! Tests for admission ordering, limits, and processing slots.

use std::{convert::Infallible, time::Duration};

use proptest::prelude::*;
use rstest::{fixture, rstest};
use tokio::time::{self, Instant};

use super::*;

fn config(max_size: usize, concurrency: usize, rate_limit: usize) -> AdmissionConfig {
    AdmissionConfig {
        max_size,
        concurrency,
        rate_limit,
        rate_window: Duration::from_secs(60),
        queue_full_retry_after: Duration::from_secs(1),
    }
}

#[fixture]
fn queue() -> AdmissionQueue<&'static str> {
    AdmissionQueue::new(config(16, 1, 100)).expect("valid config")
}

fn drain_order<T: Copy>(queue: &AdmissionQueue<T>) -> Vec<T> {
    let mut order = Vec::new();
    loop {
        match queue.acquire() {
            Acquire::Leased(mut lease) => {
                order.push(lease.take_payload().expect("payload present"));
                lease.complete();
            }
            Acquire::Empty => return order,
            Acquire::AtCapacity => panic!("no lease should be outstanding"),
        }
    }
}

#[rstest]
#[case::zero_size(config(0, 1, 1), AdmissionConfigError::ZeroLimit { name: "max_size" })]
#[case::zero_concurrency(config(1, 0, 1), AdmissionConfigError::ZeroLimit { name: "concurrency" })]
#[case::zero_rate(config(1, 1, 0), AdmissionConfigError::ZeroLimit { name: "rate_limit" })]
fn rejects_zero_limits(#[case] cfg: AdmissionConfig, #[case] expected: AdmissionConfigError) {
    let err = AdmissionQueue::<u8>::new(cfg).expect_err("config should be rejected");
    assert_eq!(err, expected);
}

#[rstest]
#[tokio::test]
async fn higher_priority_dequeues_first_and_ties_are_fifo(queue: AdmissionQueue<&'static str>) {
    queue.enqueue(1, "low-a").expect("admit");
    queue.enqueue(5, "high-a").expect("admit");
    queue.enqueue(1, "low-b").expect("admit");
    queue.enqueue(5, "high-b").expect("admit");
    queue.enqueue(3, "mid").expect("admit");

    assert_eq!(
        drain_order(&queue),
        vec!["high-a", "high-b", "mid", "low-a", "low-b"]
    );
}

#[rstest]
#[tokio::test]
async fn positions_follow_priority(queue: AdmissionQueue<&'static str>) {
    let low = queue.enqueue(0, "low").expect("admit");
    let high = queue.enqueue(9, "high").expect("admit");
    assert_eq!(queue.position(high), Some(0));
    assert_eq!(queue.position(low), Some(1));
    assert_eq!(queue.status(low), Some(EntryStatus::Pending));
}

#[tokio::test]
async fn queue_full_until_an_entry_leaves() {
    let queue = AdmissionQueue::new(config(2, 1, 100)).expect("valid config");
    let first = queue.enqueue(0, 1u8).expect("first admitted");
    queue.enqueue(0, 2u8).expect("second admitted");

    let err = queue.enqueue(0, 3u8).expect_err("third rejected");
    let AdmissionError::QueueFull {
        max_size,
        rejection,
    } = err
    else {
        panic!("expected QueueFull, got {err:?}");
    };
    assert_eq!(max_size, 2);
    assert_eq!(rejection.limit, 100);
    assert_eq!(rejection.remaining, 98);
    assert!(rejection.reset_at >= Instant::now());

    assert_eq!(queue.cancel(first), Some(1));
    queue.enqueue(0, 3u8).expect("admitted after cancel");
}

#[tokio::test(start_paused = true)]
async fn burst_beyond_rate_cap_is_rate_limited() {
    let queue = AdmissionQueue::new(config(100, 1, 5)).expect("valid config");
    let now = Instant::now();
    let results: Vec<_> = (0..8).map(|i| queue.enqueue(0, i)).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
    for err in results.into_iter().filter_map(Result::err) {
        let AdmissionError::RateLimited(rejection) = err else {
            panic!("expected RateLimited, got {err:?}");
        };
        assert_eq!(rejection.limit, 5);
        assert_eq!(rejection.remaining, 0);
        assert!(rejection.reset_at >= now);
        assert_eq!(rejection.retry_after, Duration::from_secs(60));
    }
}

#[tokio::test(start_paused = true)]
async fn rate_window_slides() {
    let queue = AdmissionQueue::new(config(100, 1, 2)).expect("valid config");
    queue.enqueue(0, 'a').expect("admit");
    time::advance(Duration::from_secs(30)).await;
    queue.enqueue(0, 'b').expect("admit");

    let err = queue.enqueue(0, 'c').expect_err("window full");
    assert_eq!(err.rejection().retry_after, Duration::from_secs(30));

    time::advance(Duration::from_secs(30)).await;
    queue.enqueue(0, 'c').expect("oldest admission left the window");
    assert_eq!(queue.stats().window_admissions, 2);
}

#[rstest]
#[tokio::test]
async fn process_respects_concurrency_cap(queue: AdmissionQueue<&'static str>) {
    queue.enqueue(0, "a").expect("admit");
    queue.enqueue(0, "b").expect("admit");

    let Acquire::Leased(lease) = queue.acquire() else {
        panic!("expected a lease");
    };
    let outcome = queue
        .process(|_, _| async { Ok::<_, Infallible>(()) })
        .await;
    assert_eq!(outcome, ProcessOutcome::NotNow);
    assert_eq!(queue.len(), 1, "NotNow must not dequeue");

    lease.complete();
    let outcome = queue
        .process(|_, payload| async move {
            assert_eq!(payload, "b");
            Ok::<_, Infallible>(())
        })
        .await;
    assert!(matches!(outcome, ProcessOutcome::Completed(_)));
    assert_eq!(queue.stats().completed, 2);
}

#[rstest]
#[tokio::test]
async fn failed_handlers_are_counted(queue: AdmissionQueue<&'static str>) {
    let id = queue.enqueue(0, "a").expect("admit");
    let outcome = queue
        .process(|_, _| async { Err::<(), _>("scenario exploded") })
        .await;
    assert_eq!(outcome, ProcessOutcome::Failed(id, "scenario exploded".into()));
    let stats = queue.stats();
    assert_eq!((stats.completed, stats.failed, stats.processing), (0, 1, 0));
}

#[rstest]
#[tokio::test]
async fn dropped_lease_releases_slot(queue: AdmissionQueue<&'static str>) {
    queue.enqueue(0, "a").expect("admit");
    queue.enqueue(0, "b").expect("admit");
    let Acquire::Leased(lease) = queue.acquire() else {
        panic!("expected a lease");
    };
    assert!(matches!(queue.acquire(), Acquire::AtCapacity));
    drop(lease);
    assert!(matches!(queue.acquire(), Acquire::Leased(_)));
    assert_eq!(queue.stats().failed, 1);
}

#[rstest]
#[tokio::test]
async fn cancel_is_noop_once_processing(queue: AdmissionQueue<&'static str>) {
    let id = queue.enqueue(0, "a").expect("admit");
    let Acquire::Leased(_lease) = queue.acquire() else {
        panic!("expected a lease");
    };
    assert_eq!(queue.status(id), Some(EntryStatus::Processing));
    assert_eq!(queue.cancel(id), None);
    assert_eq!(queue.position(id), None);
}

#[rstest]
#[tokio::test]
async fn clear_resets_everything(queue: AdmissionQueue<&'static str>) {
    queue.enqueue(0, "a").expect("admit");
    queue.enqueue(0, "b").expect("admit");
    let Acquire::Leased(lease) = queue.acquire() else {
        panic!("expected a lease");
    };
    queue.clear();
    lease.complete();
    assert_eq!(queue.stats(), AdmissionStats::default());
}

#[tokio::test]
async fn wait_for_work_sees_admissions_made_before_waiting() {
    let queue = AdmissionQueue::new(config(4, 1, 10)).expect("valid config");
    queue.enqueue(0, ()).expect("admit");
    time::timeout(Duration::from_millis(100), queue.wait_for_work())
        .await
        .expect("stored wake-up should resolve immediately");
}

#[tokio::test]
async fn concurrent_enqueues_never_exceed_limits() {
    let queue = AdmissionQueue::new(config(1000, 1, 50)).expect("valid config");
    let mut tasks = Vec::new();
    for i in 0..8 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            (0..20)
                .filter(|j| queue.enqueue(i, i * 100 + j).is_ok())
                .count()
        }));
    }
    let mut admitted = 0;
    for task in tasks {
        admitted += task.await.expect("task panicked");
    }
    assert_eq!(admitted, 50);
    assert_eq!(queue.len(), 50);
}

proptest! {
    #[test]
    fn dequeue_order_is_priority_then_arrival(priorities in proptest::collection::vec(-3i32..3, 1..40)) {
        let queue = AdmissionQueue::new(config(64, 1, 64)).expect("valid config");
        for (arrival, priority) in priorities.iter().enumerate() {
            queue.enqueue(*priority, (*priority, arrival)).expect("admit");
        }
        let order = drain_order(&queue);
        for pair in order.windows(2) {
            let (p_a, arrival_a) = pair[0];
            let (p_b, arrival_b) = pair[1];
            prop_assert!(p_a > p_b || (p_a == p_b && arrival_a < arrival_b));
        }
    }
}
