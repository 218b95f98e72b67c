//! # Mesh Telemetry
//!
//! Observability glue for the agent mesh bus.
//!
//! ## Components
//!
//! - **Tracing middleware**: injects/extracts trace context into message metadata
//! - **Logging**: correlation-aware structured log macros
//! - **Metrics**: Prometheus counters and histograms for the bus
//! - **Setup**: subscriber installation with optional OTLP span export
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mesh_telemetry::{TelemetryConfig, init_telemetry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TelemetryConfig::from_env();
//!     let _guard = init_telemetry(config).expect("Failed to init telemetry");
//!
//!     // Spans, logs and metrics are now being collected
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | unset | OTLP endpoint; unset disables export |
//! | `OTEL_SERVICE_NAME` | `agent-mesh` | Service name in traces |
//! | `MESH_LOG_LEVEL` | `info` | Log level filter |
//! | `MESH_JSON_LOGS` | `false` | JSON log lines |

mod config;
pub mod context;
pub mod logging;
pub mod metrics;
pub mod middleware;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use context::PropagatedContext;
pub use logging::Correlation;
pub use metrics::{encode_metrics, register_metrics, MetricsHandle};
pub use middleware::{NoopTracing, OtelTracing, TracingMiddleware};
pub use tracing_setup::TracingGuard;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize tracer: {0}")]
    TracerInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging, optional trace export and metrics.
///
/// Returns a guard that must be held for the lifetime of the application.
/// When dropped, it flushes pending spans.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    // Initialize metrics first (synchronous)
    let metrics_handle = register_metrics()?;

    let tracing_guard = tracing_setup::init_tracing(&config)?;

    Ok(TelemetryGuard {
        _tracing: tracing_guard,
        _metrics: metrics_handle,
    })
}

/// Guard that keeps telemetry active. Drop to flush and shutdown.
pub struct TelemetryGuard {
    _tracing: TracingGuard,
    _metrics: MetricsHandle,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}
