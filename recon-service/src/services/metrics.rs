//! Prometheus metrics for recon-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use tracing::info;

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "recon_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .unwrap()
});

/// Reconciliation runs by terminal status.
pub static RUNS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_runs_total",
        "Reconciliation runs by terminal status",
        &["status"]
    )
    .unwrap()
});

/// Matched pairs by the strategy that produced them.
pub static MATCH_STRATEGIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_match_strategies_total",
        "Matched pairs by matching strategy",
        &["strategy"]
    )
    .unwrap()
});

/// Order reconciler actions (marked paid, synthesized payment, ...).
pub static ORDER_RECONCILE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_order_reconcile_total",
        "Order reconciler actions",
        &["action"]
    )
    .unwrap()
});

/// Errors by type.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("recon_errors_total", "Errors by type", &["error_type"]).unwrap()
});

/// Initialize all metrics (forces lazy statics to register).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&RUNS_TOTAL);
    Lazy::force(&MATCH_STRATEGIES_TOTAL);
    Lazy::force(&ORDER_RECONCILE_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    info!("Prometheus metrics initialized");
}

/// Gather all metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_run_outcome(status: &str) {
    RUNS_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_match_strategy(strategy: &str) {
    MATCH_STRATEGIES_TOTAL.with_label_values(&[strategy]).inc();
}

pub fn record_order_reconcile(action: &str) {
    ORDER_RECONCILE_TOTAL.with_label_values(&[action]).inc();
}

pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}
