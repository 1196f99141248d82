//! Prometheus metrics for the ZOS bridge relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};

lazy_static! {
    // Scan progress
    pub static ref HEAD_BLOCK: GaugeVec = register_gauge_vec!(
        "relayer_head_block",
        "Last irreversible block reported by the chain",
        &["network"]
    ).unwrap();

    pub static ref WATERMARK: GaugeVec = register_gauge_vec!(
        "relayer_watermark_block",
        "Last committed block per network",
        &["network"]
    ).unwrap();

    // Ingestion
    pub static ref EVENTS_INGESTED: CounterVec = register_counter_vec!(
        "relayer_events_ingested_total",
        "Transfer events committed to the ledger",
        &["network"]
    ).unwrap();

    pub static ref DUPLICATE_EVENTS: CounterVec = register_counter_vec!(
        "relayer_duplicate_events_total",
        "Events skipped by the ledger uniqueness constraint",
        &["network"]
    ).unwrap();

    // Settlement
    pub static ref REPORTS_PROCESSED: CounterVec = register_counter_vec!(
        "relayer_reports_processed_total",
        "Settlement transitions committed, labeled by resulting status",
        &["status"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relayer_errors_total",
        "Total number of errors",
        &["component", "type"]
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();

    pub static ref LAST_SUCCESSFUL_POLL: GaugeVec = register_gauge_vec!(
        "relayer_last_successful_poll_timestamp",
        "Unix timestamp of last successful poll",
        &["network"]
    ).unwrap();
}

/// Record the chain head seen by a watcher
pub fn set_head_block(network: &str, block_number: i64) {
    HEAD_BLOCK
        .with_label_values(&[network])
        .set(block_number as f64);
}

/// Record an advanced watermark
pub fn set_watermark(network: &str, block_number: i64) {
    WATERMARK
        .with_label_values(&[network])
        .set(block_number as f64);
}

/// Record newly ledgered events
pub fn record_events_ingested(network: &str, count: u64) {
    EVENTS_INGESTED
        .with_label_values(&[network])
        .inc_by(count as f64);
}

/// Record events skipped as duplicates
pub fn record_duplicates_skipped(network: &str, count: u64) {
    DUPLICATE_EVENTS
        .with_label_values(&[network])
        .inc_by(count as f64);
}

/// Record a committed settlement transition
pub fn record_report_processed(status: &str) {
    REPORTS_PROCESSED.with_label_values(&[status]).inc();
}

/// Record an error
pub fn record_error(component: &str, error_type: &str) {
    ERRORS.with_label_values(&[component, error_type]).inc();
}

/// Record last successful poll
pub fn record_successful_poll(network: &str) {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    LAST_SUCCESSFUL_POLL
        .with_label_values(&[network])
        .set(timestamp);
}
