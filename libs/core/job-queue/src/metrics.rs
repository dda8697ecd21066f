//! Prometheus metrics for the job queue.
//!
//! Provides observability into queue depth, throughput, and retries.

use crate::job::JobClass;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");
        info!("Prometheus metrics initialized");
        handle
    });
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

fn class_label(class: JobClass) -> String {
    class.as_ref().to_string()
}

/// Record a job accepted by the producer API.
pub fn record_enqueued(class: JobClass) {
    counter!("job_queue_enqueued_total", "class" => class_label(class)).increment(1);
}

/// Record a job completing, with its handler duration.
pub fn record_completed(class: JobClass, duration: Duration) {
    counter!(
        "job_queue_processed_total",
        "class" => class_label(class),
        "status" => "completed"
    )
    .increment(1);

    histogram!("job_queue_job_duration_seconds", "class" => class_label(class))
        .record(duration.as_secs_f64());
}

/// Record a job exhausting its attempts.
pub fn record_failed(class: JobClass) {
    counter!(
        "job_queue_processed_total",
        "class" => class_label(class),
        "status" => "failed"
    )
    .increment(1);
}

/// Record a failed attempt being rescheduled.
pub fn record_retry(class: JobClass) {
    counter!("job_queue_retries_total", "class" => class_label(class)).increment(1);
}

/// Record a handler exceeding its execution timeout.
pub fn record_timeout(class: JobClass) {
    counter!("job_queue_timeouts_total", "class" => class_label(class)).increment(1);
}

/// Record a job discarded by the degraded store.
pub fn record_discarded(class: JobClass) {
    counter!("job_queue_discarded_total", "class" => class_label(class)).increment(1);
}

/// Update the in-flight gauge for a class.
pub fn set_active(class: JobClass, active: usize) {
    gauge!("job_queue_active_jobs", "class" => class_label(class)).set(active as f64);
}
