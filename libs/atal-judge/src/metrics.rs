// Prometheus metrics for the execution pipeline
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref SUBMISSIONS_TOTAL: IntCounter = register_int_counter!(
        "atal_submissions_total",
        "Executions accepted into the queue"
    )
    .expect("metric can be registered");
    pub static ref EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "atal_executions_total",
        "Finished executions by terminal status",
        &["status"]
    )
    .expect("metric can be registered");
    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "atal_queue_depth",
        "Executions waiting for a worker"
    )
    .expect("metric can be registered");
    pub static ref ACTIVE_EXECUTIONS: IntGauge = register_int_gauge!(
        "atal_active_executions",
        "Executions currently held by a worker"
    )
    .expect("metric can be registered");
    pub static ref EXECUTION_SECONDS: Histogram = register_histogram!(
        "atal_execution_seconds",
        "Wall time from worker pickup to terminal status",
        vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 40.0, 80.0]
    )
    .expect("metric can be registered");
    pub static ref POLL_TIMEOUTS_TOTAL: IntCounter = register_int_counter!(
        "atal_poll_timeouts_total",
        "Batch polls that gave up before every token finished"
    )
    .expect("metric can be registered");
    pub static ref CLEANUP_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "atal_cleanup_failures_total",
        "Working directories that could not be removed"
    )
    .expect("metric can be registered");
    pub static ref TRACKED_TOKENS: IntGauge = register_int_gauge!(
        "atal_tracked_tokens",
        "Status records currently held by the registry"
    )
    .expect("metric can be registered");
}

/// Render every registered metric in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
