//! Integration tests for harness self-observability percentile tracking:
//! the HdrHistogram-backed tracker used for RPC and scenario latency, not
//! the Job's own `LatencyHistogram` counters in `counters.rs`.

use loadmesh::percentiles::{
    format_percentile_table, MultiLabelPercentileTracker, PercentileStats, PercentileTracker,
    GLOBAL_RPC_PERCENTILES, GLOBAL_SCENARIO_PERCENTILES,
};
use std::collections::HashMap;

#[test]
fn test_percentile_tracker_basic() {
    let tracker = PercentileTracker::new();

    // Record latencies: 10ms, 20ms, 30ms, 40ms, 50ms, 60ms, 70ms, 80ms, 90ms, 100ms
    for i in 1..=10 {
        tracker.record_ms(i * 10);
    }

    let stats = tracker.stats().expect("should have stats");

    assert_eq!(stats.count, 10);
    assert!(
        stats.min >= 9_900 && stats.min <= 10_100,
        "min {}μs should be around 10000μs",
        stats.min
    );
    assert!(
        stats.max >= 99_900 && stats.max <= 100_500,
        "max {}μs should be around 100000μs",
        stats.max
    );
    assert!(
        stats.p50 >= 45_000 && stats.p50 <= 55_000,
        "P50 {}μs should be around 50000μs",
        stats.p50
    );
    assert!(
        stats.p90 >= 85_000 && stats.p90 <= 95_000,
        "P90 {}μs should be around 90000μs",
        stats.p90
    );
}

#[test]
fn test_percentile_tracker_large_dataset() {
    let tracker = PercentileTracker::new();

    for i in 1..=1000 {
        tracker.record_ms(i);
    }

    let stats = tracker.stats().expect("should have stats");
    assert_eq!(stats.count, 1000);

    assert!(
        stats.p50 >= 480_000 && stats.p50 <= 520_000,
        "P50 {}μs should be around 500000μs",
        stats.p50
    );
    assert!(
        stats.p99 >= 970_000 && stats.p99 <= 1_010_000,
        "P99 {}μs should be around 990000μs",
        stats.p99
    );
}

#[test]
fn test_percentile_tracker_skewed_distribution() {
    let tracker = PercentileTracker::new();

    // 90 fast requests (10ms), 10 slow requests (1000ms)
    for _ in 0..90 {
        tracker.record_ms(10);
    }
    for _ in 0..10 {
        tracker.record_ms(1000);
    }

    let stats = tracker.stats().expect("should have stats");
    assert_eq!(stats.count, 100);

    assert!(stats.p50 <= 15_000, "P50 {}μs should be around 10000μs", stats.p50);
    assert!(stats.p90 <= 15_000, "P90 {}μs should be around 10000μs", stats.p90);
    assert!(stats.p95 >= 900_000, "P95 {}μs should be around 1000000μs", stats.p95);
    assert!(stats.p99 >= 900_000, "P99 {}μs should be around 1000000μs", stats.p99);
}

#[test]
fn test_percentile_tracker_reset() {
    let tracker = PercentileTracker::new();

    tracker.record_ms(100);
    tracker.record_ms(200);
    assert!(tracker.stats().is_some());

    tracker.reset();
    assert!(tracker.stats().is_none());
}

#[test]
fn test_percentile_stats_format_contains_all_percentiles() {
    let tracker = PercentileTracker::new();
    for i in 1..=100 {
        tracker.record_ms(i);
    }

    let stats = tracker.stats().expect("should have stats");
    let formatted = stats.format();

    assert!(formatted.contains("count="));
    assert!(formatted.contains("min="));
    assert!(formatted.contains("max="));
    assert!(formatted.contains("mean="));
    assert!(formatted.contains("p50="));
    assert!(formatted.contains("p90="));
    assert!(formatted.contains("p95="));
    assert!(formatted.contains("p99="));
    assert!(formatted.contains("p99.9="));
}

#[test]
fn test_multi_label_tracker_separates_labels() {
    let tracker = MultiLabelPercentileTracker::new();

    tracker.record("/api/fast", 10);
    tracker.record("/api/fast", 20);
    tracker.record("/api/fast", 15);

    tracker.record("/api/slow", 100);
    tracker.record("/api/slow", 200);
    tracker.record("/api/slow", 150);

    let fast_stats = tracker.stats("/api/fast").expect("should have fast stats");
    let slow_stats = tracker.stats("/api/slow").expect("should have slow stats");

    assert_eq!(fast_stats.count, 3);
    assert_eq!(slow_stats.count, 3);
    assert!(fast_stats.max < 30_000, "fast max should be under 30ms");
    assert!(slow_stats.min > 90_000, "slow min should be over 90ms");

    assert!(tracker.stats("/api/missing").is_none());
}

#[test]
fn test_multi_label_all_stats_and_labels() {
    let tracker = MultiLabelPercentileTracker::new();

    tracker.record("endpoint1", 10);
    tracker.record("endpoint2", 20);
    tracker.record("endpoint3", 30);

    let all_stats = tracker.all_stats();
    assert_eq!(all_stats.len(), 3);
    assert!(all_stats.contains_key("endpoint1"));

    let mut labels = tracker.labels();
    labels.sort();
    assert_eq!(labels, vec!["endpoint1", "endpoint2", "endpoint3"]);
}

#[test]
fn test_multi_label_tracker_evicts_least_recently_used() {
    let tracker = MultiLabelPercentileTracker::new_with_limit(2);

    tracker.record("a", 10);
    tracker.record("b", 20);
    // touching "a" again keeps it more recently used than "b"
    tracker.record("a", 15);
    tracker.record("c", 30);

    assert_eq!(tracker.len(), 2);
    assert!(tracker.stats("b").is_none(), "b should have been evicted");
    assert!(tracker.stats("a").is_some());
    assert!(tracker.stats("c").is_some());
}

#[test]
fn global_rpc_and_scenario_trackers_are_independent() {
    GLOBAL_RPC_PERCENTILES.record("worker-rpc-test-label", 5);
    GLOBAL_SCENARIO_PERCENTILES.record("scenario-test-label", 50);

    assert!(GLOBAL_RPC_PERCENTILES.stats("worker-rpc-test-label").is_some());
    assert!(GLOBAL_SCENARIO_PERCENTILES.stats("scenario-test-label").is_some());
    assert!(GLOBAL_RPC_PERCENTILES.stats("scenario-test-label").is_none());
}

#[test]
fn test_format_percentile_table_renders_rows_and_handles_empty() {
    let mut stats_map = HashMap::new();
    stats_map.insert(
        "endpoint1".to_string(),
        PercentileStats {
            count: 100,
            min: 10_000,
            max: 100_000,
            mean: 50_000.0,
            p50: 50_000,
            p90: 90_000,
            p95: 95_000,
            p99: 99_000,
            p99_9: 99_900,
        },
    );

    let table = format_percentile_table("Test Table", &stats_map);
    assert!(table.contains("Test Table"));
    assert!(table.contains("endpoint1"));
    assert!(table.contains("P50"));

    let empty = format_percentile_table("Empty Table", &HashMap::new());
    assert!(empty.contains("No data available"));
}
