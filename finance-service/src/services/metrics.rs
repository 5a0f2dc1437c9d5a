//! Prometheus metrics for finance-service.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec,
    IntGauge, TextEncoder,
};

/// Ledger writes by kind and outcome.
pub static LEDGER_WRITES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finance_ledger_writes_total",
        "Total number of ledger writes",
        &["kind", "status"] // kind: payment, invoice, adjustment, settlement
    )
    .expect("Failed to register ledger_writes_total")
});

pub static SUMMARY_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finance_summary_requests_total",
        "Finance summary lookups by cache result",
        &["cache"] // hit, miss
    )
    .expect("Failed to register summary_requests_total")
});

/// Payment attempts by provider and terminal outcome.
pub static RECONCILIATION_OUTCOMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finance_reconciliation_outcomes_total",
        "Payment attempts by provider and terminal state",
        &["provider", "outcome"]
    )
    .expect("Failed to register reconciliation_outcomes_total")
});

pub static ACTIVE_ATTEMPTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "finance_active_payment_attempts",
        "Payment attempts currently awaiting confirmation"
    )
    .expect("Failed to register active_payment_attempts")
});

pub static GATEWAY_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finance_gateway_requests_total",
        "Outbound payment provider requests",
        &["provider", "operation", "status"]
    )
    .expect("Failed to register gateway_requests_total")
});

pub static GATEWAY_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "finance_gateway_request_duration_seconds",
        "Payment provider request duration in seconds",
        &["provider", "operation"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register gateway_request_duration")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "finance_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

static HTTP_RECORDER: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&LEDGER_WRITES_TOTAL);
    Lazy::force(&SUMMARY_REQUESTS_TOTAL);
    Lazy::force(&RECONCILIATION_OUTCOMES_TOTAL);
    Lazy::force(&ACTIVE_ATTEMPTS);
    Lazy::force(&GATEWAY_REQUESTS_TOTAL);
    Lazy::force(&GATEWAY_REQUEST_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Install the recorder backing the HTTP middleware counters. Process-wide,
/// so only the binary calls it.
pub fn install_http_recorder() {
    if HTTP_RECORDER.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = HTTP_RECORDER.set(handle);
        }
        Err(e) => tracing::warn!(error = %e, "HTTP metrics recorder not installed"),
    }
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut output = encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default();
    if let Some(handle) = HTTP_RECORDER.get() {
        output.push_str(&handle.render());
    }
    output
}
