//! Observability metrics for the media pipeline.
//!
//! Prometheus-compatible metrics exposed via the `metrics` crate facade.
//! Designed to support:
//!
//! - **Alerting**: failure rates on optimization jobs and dead letters
//! - **Dashboards**: upload/optimization throughput and queue depth
//! - **Debugging**: lock wait latency when models see upload contention
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `vitrine_uploads_total` | Counter | `outcome` | Upload attempts by outcome |
//! | `vitrine_optimizations_total` | Counter | `outcome` | Optimization jobs by outcome |
//! | `vitrine_job_retries_total` | Counter | `queue` | Job redeliveries |
//! | `vitrine_dead_letters_total` | Counter | `queue` | Jobs that exhausted retries |
//! | `vitrine_lock_wait_seconds` | Histogram | - | Ordering lock acquisition time |
//! | `vitrine_optimize_seconds` | Histogram | - | Full optimization job duration |
//!
//! To export to Prometheus, install a recorder at startup (e.g.
//! `metrics_exporter_prometheus::PrometheusBuilder`); without a recorder
//! every call is a no-op.

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: upload attempts by outcome.
    pub const UPLOADS_TOTAL: &str = "vitrine_uploads_total";
    /// Counter: optimization jobs by outcome.
    pub const OPTIMIZATIONS_TOTAL: &str = "vitrine_optimizations_total";
    /// Counter: job redeliveries.
    pub const JOB_RETRIES_TOTAL: &str = "vitrine_job_retries_total";
    /// Counter: jobs that exhausted their retry budget.
    pub const DEAD_LETTERS_TOTAL: &str = "vitrine_dead_letters_total";
    /// Histogram: ordering lock acquisition time in seconds.
    pub const LOCK_WAIT_SECONDS: &str = "vitrine_lock_wait_seconds";
    /// Histogram: full optimization job duration in seconds.
    pub const OPTIMIZE_SECONDS: &str = "vitrine_optimize_seconds";
}

/// Records an upload outcome (`"ok"`, `"unsupported"`, `"lock_timeout"`,
/// `"error"`).
pub fn record_upload(outcome: &'static str) {
    counter!(names::UPLOADS_TOTAL, "outcome" => outcome).increment(1);
}

/// Records an optimization job outcome (`"ok"` or `"error"`).
pub fn record_optimization(outcome: &'static str) {
    counter!(names::OPTIMIZATIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// Records a job redelivery on the given queue.
pub fn record_job_retry(queue: &str) {
    counter!(names::JOB_RETRIES_TOTAL, "queue" => queue.to_string()).increment(1);
}

/// Records a job moved to the dead-letter set.
pub fn record_job_dead_letter(queue: &str) {
    counter!(names::DEAD_LETTERS_TOTAL, "queue" => queue.to_string()).increment(1);
}

/// Records how long an ordering lock acquisition took.
pub fn record_lock_wait(seconds: f64) {
    histogram!(names::LOCK_WAIT_SECONDS).record(seconds);
}

/// Records a full optimization job duration.
pub fn record_optimize_duration(seconds: f64) {
    histogram!(names::OPTIMIZE_SECONDS).record(seconds);
}
