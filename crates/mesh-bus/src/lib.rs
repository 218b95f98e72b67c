//! # Mesh Bus - Durable Messaging Backbone for Agents
//!
//! Tenant-aware, tamper-evident, replayable publish/subscribe over a durable
//! log (NATS JetStream, or an in-process log for tests and single-node runs).
//!
//! ## Message Flow
//!
//! ```text
//! ┌──────────┐  publish()   ┌────────────┐   append    ┌──────────────┐
//! │ Producer │ ───────────► │ MessageBus │ ──────────► │ Durable log  │
//! └──────────┘  seal+scope  └────────────┘             │  MESSAGES    │
//!                                 ▲                    │  TOOLS       │
//!                                 │ decode+validate    │  SYSTEM      │
//! ┌──────────┐   handler    ┌─────┴──────┐  deliver    └──────┬───────┘
//! │ Consumer │ ◄─────────── │ Dispatcher │ ◄──────────────────┘
//! └──────────┘  ack / nak   └────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Integrity:** every message is sealed with the SHA-256 of its canonical
//!   encoding; tampered records are never handed to a handler
//! - **Tenant isolation:** tenant-scoped subjects are checked against the
//!   caller's context on publish and subscribe, failing closed
//! - **At-least-once:** durable consumers with explicit ack; handler errors
//!   and timeouts cause redelivery, bounded by `max_deliver`
//! - **Dead Letter Queue:** exhausted records are written to `system.dlq`
//! - **Replay:** a workflow's history is read back in event-time order

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod backoff;
pub mod bus;
pub mod config;
pub mod context;
pub mod dead_letter;
pub mod errors;
pub mod stats;
pub mod streams;
pub mod subjects;
pub mod subscription;
pub mod tenant;
pub mod transport;

// Re-export main types
pub use backoff::BackoffPolicy;
pub use bus::{MessageBus, PublishReceipt};
pub use config::BusConfig;
pub use context::BusContext;
pub use dead_letter::{DeadLetter, FailureKind, DLQ_SUBJECT};
pub use errors::{BusError, SubjectError, TenantScopeError};
pub use stats::BusStatsSnapshot;
pub use streams::StreamSpec;
pub use subjects::{Direction, Subject, SubjectBuilder, SubjectPattern};
pub use subscription::{handler_fn, MessageHandler, Subscription};
pub use tenant::{extract_tenant, validate_subject_tenant_access, TenantId, TenantSubjectBuilder};
pub use transport::{ConnectionState, JetStreamTransport, LogTransport, MemoryLog};
