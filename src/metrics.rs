//! Metrics exposition for `GET /metrics`, in the standard Prometheus text
//! format. `spec.md` §6, §4.2 "Stats exposed", §7 (failure counters).

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install(namespace: &str) -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("installing the global metrics recorder exactly once at startup");

    describe_counter!(
        format!("{namespace}_candidates_validated_total"),
        "Total candidates that completed a validation attempt"
    );
    describe_counter!(
        format!("{namespace}_candidates_alive_total"),
        "Total candidates that validated alive"
    );
    describe_counter!(
        format!("{namespace}_candidates_dead_total"),
        "Total candidates that failed validation"
    );
    describe_counter!(
        format!("{namespace}_scanner_scans_total"),
        "Total scanner invocations"
    );
    describe_counter!(
        format!("{namespace}_persistence_failures_total"),
        "Total snapshot persistence write failures"
    );
    describe_gauge!(
        format!("{namespace}_alive_proxies"),
        "Current count of alive proxies in the published snapshot"
    );
    describe_gauge!(
        format!("{namespace}_adaptive_concurrency_limit"),
        "Effective concurrency limit computed for the most recent batch"
    );

    handle
}

pub fn record_validated(namespace: &str, alive: u64, dead: u64) {
    counter!(format!("{namespace}_candidates_validated_total")).increment(alive + dead);
    counter!(format!("{namespace}_candidates_alive_total")).increment(alive);
    counter!(format!("{namespace}_candidates_dead_total")).increment(dead);
}

pub fn record_snapshot_size(namespace: &str, alive: u64) {
    gauge!(format!("{namespace}_alive_proxies")).set(alive as f64);
}

pub fn record_scan(namespace: &str) {
    counter!(format!("{namespace}_scanner_scans_total")).increment(1);
}

pub fn record_persistence_failure(namespace: &str) {
    counter!(format!("{namespace}_persistence_failures_total")).increment(1);
}

pub fn record_adaptive_limit(namespace: &str, limit: usize) {
    gauge!(format!("{namespace}_adaptive_concurrency_limit")).set(limit as f64);
}
