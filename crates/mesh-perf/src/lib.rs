//! # Mesh Perf
//!
//! Latency and throughput measurement for the message bus.
//!
//! [`PerformanceHarness`] runs closed-loop ping-pong pairs over a
//! [`MessageBus`](mesh_bus::MessageBus) until a message count or a wall-clock
//! limit is reached, then reports nearest-rank latency percentiles.
//!
//! ## Usage
//!
//! ```bash
//! # In-process log
//! cargo run -p mesh-perf -- --pairs 8 --messages 50000
//!
//! # Against a NATS JetStream server, for 30 seconds
//! cargo run -p mesh-perf -- --url nats://127.0.0.1:4222 --messages 0 --duration 30
//! ```
//!
//! Serializer micro-benchmarks:
//!
//! ```bash
//! cargo bench -p mesh-perf --bench canonical
//! ```

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod harness;
pub mod report;

pub use config::PerfConfig;
pub use harness::PerformanceHarness;
pub use report::{percentile, LatencySummary, PerfReport};

use mesh_bus::{BusError, SubjectError};
use thiserror::Error;

/// Harness errors.
#[derive(Debug, Error)]
pub enum PerfError {
    #[error("Invalid perf configuration: {0}")]
    Config(String),

    /// Setting up subscriptions failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// A pinger task panicked or was aborted.
    #[error("Pinger task failed: {0}")]
    Task(String),
}

impl From<SubjectError> for PerfError {
    fn from(err: SubjectError) -> Self {
        Self::Bus(err.into())
    }
}
