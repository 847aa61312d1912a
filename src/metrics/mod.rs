//! Prometheus metrics for the feed puller
//!
//! This module tracks:
//! - Feed requests: outcome counts and fetch duration
//! - Scheduling: queue depth and tracked feeds
//! - Manager pushes: failures by kind
//! - Data hygiene: truncated message lists and invariant violations
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all puller metrics
struct PullerMetrics {
    requests: CounterVec,
    fetch_duration: HistogramVec,
    queue_depth: Gauge,
    tracked_feeds: Gauge,
    upstream_failures: CounterVec,
    messages_truncated: Counter,
    invariant_violations: CounterVec,
}

/// Global storage for puller metrics
static PULLER_METRICS: OnceLock<PullerMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Call once at startup. A failed registration is returned to the caller
/// and leaves every recording function a no-op.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = feedpull::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = PullerMetrics {
        requests: register_counter_vec!(
            "feedpull_requests_total",
            "Feed requests by outcome",
            &["outcome"]
        )?,
        fetch_duration: register_histogram_vec!(
            "feedpull_fetch_duration_seconds",
            "Duration of feed fetches",
            &["outcome"],
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        )?,
        queue_depth: register_gauge!(
            "feedpull_queue_depth",
            "Feed requests waiting in the schedule queue"
        )?,
        tracked_feeds: register_gauge!("feedpull_tracked_feeds", "Feeds currently tracked")?,
        upstream_failures: register_counter_vec!(
            "feedpull_upstream_failures_total",
            "Failed calls to the manager by kind",
            &["kind"]
        )?,
        messages_truncated: register_counter!(
            "feedpull_messages_truncated_total",
            "Message codes dropped by state list truncation"
        )?,
        invariant_violations: register_counter_vec!(
            "feedpull_invariant_violations_total",
            "Internal consistency errors by kind",
            &["kind"]
        )?,
    };

    PULLER_METRICS
        .set(metrics)
        .map_err(|_| "Puller metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    PULLER_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record one classified feed request
pub fn record_request(outcome: &str, duration_secs: f64) {
    let Some(m) = PULLER_METRICS.get() else {
        return;
    };

    m.requests.with_label_values(&[outcome]).inc();
    m.fetch_duration
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

/// Update scheduling gauges
pub fn update_schedule_metrics(queue_depth: usize, tracked_feeds: usize) {
    if let Some(m) = PULLER_METRICS.get() {
        m.queue_depth.set(queue_depth as f64);
        m.tracked_feeds.set(tracked_feeds as f64);
    }
}

/// Record a failed manager call (`login`, `ping`, `feed_state`, `feed_stat`)
pub fn record_upstream_failure(kind: &str) {
    if let Some(m) = PULLER_METRICS.get() {
        m.upstream_failures.with_label_values(&[kind]).inc();
    }
}

pub fn record_messages_truncated(count: usize) {
    if let Some(m) = PULLER_METRICS.get() {
        m.messages_truncated.inc_by(count as f64);
    }
}

pub fn record_invariant_violation(kind: &str) {
    if let Some(m) = PULLER_METRICS.get() {
        m.invariant_violations.with_label_values(&[kind]).inc();
    }
}

// ============================================================================
// Tests
// ============================================================================
