//! # Agent Mesh Test Suite
//!
//! Cross-crate flows that no single crate can test on its own.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── fixtures.rs       # Buses, collectors, wait helpers
//! └── integration/
//!     ├── choreography.rs   # Request/response and workflow trails
//!     ├── isolation.rs      # Tenant boundaries end to end
//!     ├── integrity.rs      # Tampering and the dead-letter queue
//!     ├── resilience.rs     # Outages, restarts, unreachable brokers
//!     └── perf.rs           # Ping-pong harness over the bus
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p mesh-tests
//!
//! # By area
//! cargo test -p mesh-tests integration::isolation::
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

#[cfg(test)]
pub mod fixtures;
pub mod integration;
