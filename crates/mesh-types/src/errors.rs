//! # Error Types
//!
//! Errors raised at the encode/decode boundary of a `Message`.

use thiserror::Error;

/// Errors from canonical encoding, decoding and seal verification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Malformed or unsupported content (bad JSON, non-finite numbers).
    /// Always local, never retried.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Missing, mistyped or unknown fields, or a field that violates its
    /// declared format.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Stored envelope hash does not match the recomputed one.
    #[error("Integrity error: envelope hash mismatch (expected {expected}, stored {stored:?})")]
    Integrity { expected: String, stored: String },
}

impl CodecError {
    /// Returns true if the error signals tampering or corruption.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(self, CodecError::Integrity { .. })
    }

    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        CodecError::Schema(msg.into())
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        use serde_json::error::Category;

        match err.classify() {
            Category::Data => CodecError::Schema(err.to_string()),
            Category::Io | Category::Syntax | Category::Eof => {
                CodecError::Serialization(err.to_string())
            }
        }
    }
}
