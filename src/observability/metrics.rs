use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics facade for the idempotency coordinator and its storage backends.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_request(&self, branch: &str, duration_ms: f64) {
        counter!("idempotency_requests_total", "branch" => branch.to_string()).increment(1);
        histogram!("idempotency_request_duration_ms", "branch" => branch.to_string()).record(duration_ms);
    }

    pub fn record_storage_operation(&self, operation: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_storage_operations_total", "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_storage_operation_duration_ms", "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_unlock_failure(&self) {
        counter!("idempotency_unlock_failures_total").increment(1);
    }

    pub fn record_result_write_conflict(&self) {
        counter!("idempotency_result_write_conflicts_total").increment(1);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();

    let handle = METRICS_HANDLE.get_or_init(|| handle).clone();
    METRICS.get_or_init(Metrics::new);

    Ok(handle)
}

fn describe_metrics() {
    describe_counter!("idempotency_requests_total", Unit::Count, "Requests processed by the idempotency coordinator, by branch");
    describe_histogram!("idempotency_request_duration_ms", Unit::Milliseconds, "Coordinator latency in milliseconds, handler included");

    describe_counter!("idempotency_storage_operations_total", Unit::Count, "Storage backend operations");
    describe_histogram!("idempotency_storage_operation_duration_ms", Unit::Milliseconds, "Storage backend latency in milliseconds");

    describe_counter!("idempotency_unlock_failures_total", Unit::Count, "Lock releases that failed and were left to TTL expiry");
    describe_counter!("idempotency_result_write_conflicts_total", Unit::Count, "Result writes that found an existing result entry");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
