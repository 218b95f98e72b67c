//! # Dead Letters
//!
//! A record that keeps failing is not redelivered forever. On its last
//! allowed delivery the dispatcher writes a [`DeadLetter`] to `system.dlq`
//! and terminates the original, so operators can inspect poison messages
//! without them blocking the consumer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::BusError;

/// Subject dead letters are appended to.
pub const DLQ_SUBJECT: &str = "system.dlq";

/// Why a record was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bytes did not decode into a message
    Decode,
    /// Envelope hash did not match the content
    Integrity,
    /// Handler returned an error
    Handler,
    /// Handler exceeded the ack deadline
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Integrity => "integrity",
            Self::Handler => "handler",
            Self::Timeout => "timeout",
        }
    }
}

/// Record written to the dead-letter subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeadLetter {
    /// Subject the failed record was delivered on
    pub subject: String,
    /// Durable consumer that gave up on it
    pub consumer: String,
    /// Stream sequence of the failed record
    pub sequence: u64,
    /// Deliveries made, including the last
    pub deliveries: u32,
    pub kind: FailureKind,
    pub error: String,
    /// Original bytes, lossily decoded as UTF-8
    pub payload: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Encode with sorted keys, like every other record on the bus.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        Ok(mesh_types::canonical::to_canonical_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        serde_json::from_slice(bytes).map_err(|e| BusError::Serialization(e.to_string()))
    }
}
