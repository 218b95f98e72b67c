//! # Mesh Types Crate
//!
//! This crate contains the `Message` entity exchanged between agents and the
//! canonical serialization layer that makes every message content-addressable.
//!
//! ## Design Principles
//!
//! - **Closed Schema**: Unknown top-level fields are rejected at decode time.
//!   Schema evolution happens only inside `metadata`.
//! - **Deterministic Encoding**: Object keys are sorted at every nesting level
//!   so semantically equal messages produce byte-identical output.
//! - **Envelope Integrity**: A sealed message carries the SHA-256 of its own
//!   canonical encoding; any later mutation is detectable.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod canonical;
pub mod errors;
pub mod message;

pub use canonical::CanonicalSerializer;
pub use errors::CodecError;
pub use message::{Cost, Message, MessageId, MessageType, TRACE_METADATA_PREFIX};
