//! # Metrics
//!
//! Counters and gauges recorded through the `metrics` facade. The library
//! installs no exporter; without a recorder these calls are no-ops.

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register metric descriptions with whatever recorder is installed.
pub fn describe_metrics() {
    describe_counter!("flowgate_snapshots_published_total", "Snapshots published per label");
    describe_counter!(
        "flowgate_snapshot_publish_rejected_total",
        "Publishes rejected by snapshot validation"
    );
    describe_counter!("flowgate_registry_polls_total", "Registry polls by outcome");
    describe_gauge!("flowgate_xds_connections", "Open ADS streams");
}

pub fn record_snapshot_published(label: &str) {
    let labels = [("label", label.to_string())];
    counter!("flowgate_snapshots_published_total", &labels).increment(1);
}

pub fn record_publish_rejected(label: &str) {
    let labels = [("label", label.to_string())];
    counter!("flowgate_snapshot_publish_rejected_total", &labels).increment(1);
}

/// Outcome is one of `changed`, `unchanged`, `empty`, `error`, `timeout`.
pub fn record_registry_poll(outcome: &'static str) {
    let labels = [("outcome", outcome.to_string())];
    counter!("flowgate_registry_polls_total", &labels).increment(1);
}

pub fn record_xds_connection(connected: bool) {
    if connected {
        gauge!("flowgate_xds_connections").increment(1.0);
    } else {
        gauge!("flowgate_xds_connections").decrement(1.0);
    }
}
