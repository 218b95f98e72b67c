//! Prometheus metrics for the message bus.
//!
//! All metrics follow the naming convention: `mesh_<component>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., messages_published_total)
//! - **Gauge**: Value that can go up or down (e.g., connection_state)
//! - **Histogram**: Distribution of values (e.g., publish_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // PUBLISH
    // =========================================================================

    /// Messages appended to the log, by stream
    pub static ref MESSAGES_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("mesh_bus_messages_published_total", "Messages appended to the log"),
        &["stream"]
    ).expect("metric creation failed");

    /// Publish failures, by error kind
    pub static ref PUBLISH_FAILURES: CounterVec = CounterVec::new(
        Opts::new("mesh_bus_publish_failures_total", "Publish calls that returned an error"),
        &["kind"]  // kind: serialization/schema/integrity/transport/timeout/tenant_scope
    ).expect("metric creation failed");

    /// Publish duration histogram
    pub static ref PUBLISH_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "mesh_bus_publish_duration_seconds",
            "Time from publish call to log acknowledgment"
        ).buckets(exponential_buckets(0.0001, 2.0, 15).expect("valid buckets"))
    ).expect("metric creation failed");

    // =========================================================================
    // DELIVERY
    // =========================================================================

    /// Delivery outcomes, by outcome
    pub static ref DELIVERIES: CounterVec = CounterVec::new(
        Opts::new("mesh_bus_deliveries_total", "Delivered records by dispatch outcome"),
        &["outcome"]  // outcome: acked/nak_handler/nak_timeout/nak_decode/nak_integrity/dead_lettered
    ).expect("metric creation failed");

    /// Handler execution duration
    pub static ref HANDLER_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "mesh_bus_handler_duration_seconds",
            "Time spent inside subscription handlers"
        ).buckets(exponential_buckets(0.0001, 2.0, 18).expect("valid buckets"))
    ).expect("metric creation failed");

    /// Active subscriptions
    pub static ref ACTIVE_SUBSCRIPTIONS: IntGauge = IntGauge::new(
        "mesh_bus_active_subscriptions",
        "Number of subscriptions currently delivering"
    ).expect("metric creation failed");

    // =========================================================================
    // REPLAY
    // =========================================================================

    /// Replay duration
    pub static ref REPLAY_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "mesh_bus_replay_duration_seconds",
            "Time spent materializing a replay"
        ).buckets(exponential_buckets(0.001, 2.0, 14).expect("valid buckets"))
    ).expect("metric creation failed");

    // =========================================================================
    // SECURITY
    // =========================================================================

    /// Cross-tenant access attempts rejected
    pub static ref TENANT_REJECTIONS: CounterVec = CounterVec::new(
        Opts::new("mesh_bus_tenant_rejections_total", "Subject/tenant mismatches rejected"),
        &["operation"]  // operation: publish/subscribe/replay
    ).expect("metric creation failed");

    /// Envelope hash mismatches seen on delivery
    pub static ref INTEGRITY_FAILURES: CounterVec = CounterVec::new(
        Opts::new("mesh_bus_integrity_failures_total", "Records whose envelope hash did not validate"),
        &["stream"]
    ).expect("metric creation failed");

    // =========================================================================
    // CONNECTION
    // =========================================================================

    /// Connection state (0=disconnected 1=connecting 2=connected 3=reconnecting 4=closed)
    pub static ref CONNECTION_STATE: Gauge = Gauge::new(
        "mesh_bus_connection_state",
        "Current connection state of the bus"
    ).expect("metric creation failed");

    /// Connection attempts, by outcome
    pub static ref CONNECTION_ATTEMPTS: CounterVec = CounterVec::new(
        Opts::new("mesh_bus_connection_attempts_total", "Connection attempts"),
        &["outcome"]  // outcome: success/failed/timeout
    ).expect("metric creation failed");
}

/// Handle to the registry all bus metrics are registered in.
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the global registry.
///
/// Metrics are updated whether or not they are registered; registration only
/// makes them visible to [`encode_metrics`].
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Publish
        Box::new(MESSAGES_PUBLISHED.clone()),
        Box::new(PUBLISH_FAILURES.clone()),
        Box::new(PUBLISH_DURATION.clone()),
        // Delivery
        Box::new(DELIVERIES.clone()),
        Box::new(HANDLER_DURATION.clone()),
        Box::new(ACTIVE_SUBSCRIPTIONS.clone()),
        // Replay
        Box::new(REPLAY_DURATION.clone()),
        // Security
        Box::new(TENANT_REJECTIONS.clone()),
        Box::new(INTEGRITY_FAILURES.clone()),
        // Connection
        Box::new(CONNECTION_STATE.clone()),
        Box::new(CONNECTION_ATTEMPTS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}

/// Start timing for a histogram. Observation happens on drop.
#[macro_export]
macro_rules! time_histogram {
    ($histogram:expr) => {
        $crate::metrics::HistogramTimer::new(&$histogram)
    };
}
