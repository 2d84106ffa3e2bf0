/// Metrics and telemetry for Shutterhub
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - HTTP request counts and latencies
/// - Upload outcomes
/// - Match queue and verification activity
/// - Notification fan-out
/// - Realtime channels and background jobs

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // ========== HTTP Metrics ==========

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latencies in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // ========== Upload Metrics ==========

    /// Uploads by bucket and outcome
    pub static ref UPLOADS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "uploads_total",
        "Total number of file uploads",
        &["bucket", "outcome"]
    )
    .unwrap();

    /// Bytes written to the object store
    pub static ref UPLOAD_BYTES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "upload_bytes_total",
        "Total bytes written to the object store",
        &["bucket"]
    )
    .unwrap();

    // ========== Matching Metrics ==========

    /// Queue enqueues by outcome (created, existing, failed)
    pub static ref QUEUE_ENQUEUES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "match_queue_enqueues_total",
        "Total number of face-match queue requests",
        &["outcome"]
    )
    .unwrap();

    /// Active (pending + processing) queue entries
    pub static ref QUEUE_BACKLOG: IntGauge = register_int_gauge!(
        "match_queue_backlog",
        "Number of pending or processing queue entries"
    )
    .unwrap();

    /// Verification dispositions (verified, rejected, erased)
    pub static ref MATCH_DISPOSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "match_dispositions_total",
        "Total number of match candidate dispositions",
        &["disposition"]
    )
    .unwrap();

    // ========== Notification Metrics ==========

    /// Notifications created by type
    pub static ref NOTIFICATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "notifications_total",
        "Total number of notifications created",
        &["type"]
    )
    .unwrap();

    // ========== Realtime Metrics ==========

    /// Open change feed channels
    pub static ref REALTIME_CHANNELS_ACTIVE: IntGauge = register_int_gauge!(
        "realtime_channels_active",
        "Number of open change feed channels"
    )
    .unwrap();

    // ========== Background Job Metrics ==========

    /// Background job executions by job type and status
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "background_jobs_total",
        "Total number of background job executions",
        &["job_type", "status"]
    )
    .unwrap();

    /// Background job duration in seconds
    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "background_job_duration_seconds",
        "Background job execution time in seconds",
        &["job_type"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    // ========== Error Metrics ==========

    /// Errors by error type
    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "errors_total",
        "Total number of errors",
        &["error_type", "module"]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration);
}

/// Record an upload attempt
pub fn record_upload(bucket: &str, outcome: &str, bytes: u64) {
    UPLOADS_TOTAL.with_label_values(&[bucket, outcome]).inc();
    if outcome == "success" {
        UPLOAD_BYTES_TOTAL.with_label_values(&[bucket]).inc_by(bytes);
    }
}

/// Record a queue request
pub fn record_enqueue(outcome: &str) {
    QUEUE_ENQUEUES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Publish the current queue backlog
pub fn set_queue_backlog(count: i64) {
    QUEUE_BACKLOG.set(count);
}

/// Record a verification disposition
pub fn record_disposition(disposition: &str) {
    MATCH_DISPOSITIONS_TOTAL
        .with_label_values(&[disposition])
        .inc();
}

/// Record a created notification
pub fn record_notification(kind: &str) {
    NOTIFICATIONS_TOTAL.with_label_values(&[kind]).inc();
}

/// Publish the number of open change feed channels
pub fn set_realtime_channels(count: usize) {
    REALTIME_CHANNELS_ACTIVE.set(i64::try_from(count).unwrap_or(i64::MAX));
}

/// Record a background job execution
pub fn record_background_job(job_type: &str, status: &str, duration: f64) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration);
}

/// Record an error
pub fn record_error(error_type: &str, module: &str) {
    ERRORS_TOTAL
        .with_label_values(&[error_type, module])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_http_request() {
        record_http_request("GET", "/api/queue", 200, 0.05);
        let metrics = render_metrics();
        assert!(metrics.contains("http_requests_total"));
        assert!(metrics.contains("http_request_duration_seconds"));
    }

    #[test]
    fn test_record_upload() {
        record_upload("event-photos", "success", 1024);
        record_upload("event-photos", "validation", 0);
        let metrics = render_metrics();
        assert!(metrics.contains("uploads_total"));
        assert!(metrics.contains("upload_bytes_total"));
    }

    #[test]
    fn test_matching_metrics() {
        record_enqueue("created");
        record_disposition("verified");
        set_queue_backlog(3);
        let metrics = render_metrics();
        assert!(metrics.contains("match_queue_enqueues_total"));
        assert!(metrics.contains("match_dispositions_total"));
        assert!(metrics.contains("match_queue_backlog"));
    }

    #[test]
    fn test_record_background_job() {
        record_background_job("notification_prune", "success", 0.2);
        let metrics = render_metrics();
        assert!(metrics.contains("background_jobs_total"));
        assert!(metrics.contains("background_job_duration_seconds"));
    }

    #[test]
    fn test_realtime_and_notifications() {
        set_realtime_channels(2);
        record_notification("photo_match");
        let metrics = render_metrics();
        assert!(metrics.contains("realtime_channels_active"));
        assert!(metrics.contains("notifications_total"));
    }
}
