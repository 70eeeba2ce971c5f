#![cfg(feature = "metrics")]
//! Tests for `streamkeeper` metrics helpers.
//!
//! These tests verify that counters and gauges update as expected using
//! `metrics_util::debugging::DebuggingRecorder`.
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use rstest::rstest;
use streamkeeper::{
    AdmissionConfig,
    AdmissionQueue,
    metrics::{self as sk_metrics, Direction},
};

/// Creates a debugging recorder and snapshotter for metrics testing.
fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

fn counter_with_label(snapshotter: &Snapshotter, name: &str, label: (&str, &str)) -> Option<u64> {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find_map(|(k, _, _, v)| {
            let key = k.key();
            let labelled = key
                .labels()
                .any(|l| l.key() == label.0 && l.value() == label.1);
            match v {
                DebugValue::Counter(c) if key.name() == name && labelled => Some(c),
                _ => None,
            }
        })
}

#[rstest]
#[case(Direction::Inbound, "inbound")]
#[case(Direction::Outbound, "outbound")]
fn delivered_events_are_labelled_by_direction(#[case] direction: Direction, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        sk_metrics::add_events(direction, 3);
    });

    assert_eq!(
        counter_with_label(&snapshotter, sk_metrics::EVENTS_DELIVERED, ("direction", label)),
        Some(3)
    );
}

#[test]
fn active_connection_gauge_tracks_open_and_close() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        sk_metrics::inc_connections();
        sk_metrics::inc_connections();
        sk_metrics::dec_connections();
    });

    let metrics = snapshotter.snapshot().into_vec();
    let found = metrics.iter().any(|(k, _, _, v)| {
        k.key().name() == sk_metrics::CONNECTIONS_ACTIVE
            && matches!(v, DebugValue::Gauge(g) if (g.into_inner() - 1.0).abs() < f64::EPSILON)
    });
    assert!(found, "active connections gauge not recorded");
}

#[test]
fn full_queue_counts_a_rejection() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    let queue = AdmissionQueue::new(AdmissionConfig {
        max_size: 1,
        ..AdmissionConfig::default()
    })
    .expect("valid admission config");

    metrics::with_local_recorder(&recorder, || {
        queue.enqueue(0, "first").expect("room for one");
        let err = queue.enqueue(0, "second").expect_err("queue is full");
        assert_eq!(err.reason(), "queue_full");
    });

    assert_eq!(
        counter_with_label(&snapshotter, sk_metrics::REJECTIONS_TOTAL, ("reason", "queue_full")),
        Some(1)
    );
}

#[test]
fn duplicate_and_reconnect_counters_increment() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        sk_metrics::inc_duplicates();
        sk_metrics::inc_reconnects();
        sk_metrics::inc_reconnects();
    });

    let metrics = snapshotter.snapshot().into_vec();
    let count = |name: &str| {
        metrics.iter().find_map(|(k, _, _, v)| match v {
            DebugValue::Counter(c) if k.key().name() == name => Some(*c),
            _ => None,
        })
    };
    assert_eq!(count(sk_metrics::DUPLICATES_DROPPED), Some(1));
    assert_eq!(count(sk_metrics::RECONNECTS_TOTAL), Some(2));
}
