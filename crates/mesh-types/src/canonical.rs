//! # Canonical Serialization
//!
//! Deterministic encoding and SHA-256 content hashing of messages.
//!
//! ## Encoding Rules
//!
//! - Object keys are sorted lexicographically (bytewise) at every nesting level.
//! - Arrays keep their original order; their elements are canonicalized.
//! - Struct fields are emitted under their serde names, never declaration order.
//! - Timestamps are always RFC3339 with nine fractional digits and a `Z` suffix.
//! - Numbers use `serde_json`'s shortest round-trip formatting.
//!
//! The key-sorting pass rebuilds every map in sorted insertion order, so the
//! output is the same whether `serde_json::Map` is backed by a `BTreeMap` or
//! by an insertion-ordered map.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::errors::CodecError;
use crate::message::Message;

/// Deterministic encoder/decoder for [`Message`].
pub struct CanonicalSerializer;

impl CanonicalSerializer {
    /// Encode a message as canonical JSON.
    ///
    /// # Errors
    ///
    /// - `CodecError::Schema` if a field violates its declared format
    /// - `CodecError::Serialization` if the content cannot be represented
    pub fn serialize(msg: &Message) -> Result<Vec<u8>, CodecError> {
        msg.validate_fields()?;
        to_canonical_vec(msg)
    }

    /// Decode canonical (or any key-ordered) JSON into a message.
    ///
    /// The schema is closed: unknown top-level fields, missing required
    /// fields and mistyped fields are all rejected.
    pub fn deserialize(bytes: &[u8]) -> Result<Message, CodecError> {
        let msg: Message = serde_json::from_slice(bytes)?;
        msg.validate_fields()?;
        Ok(msg)
    }

    /// Compute the hex SHA-256 of the message with its hash field cleared.
    pub fn compute_hash(msg: &Message) -> Result<String, CodecError> {
        let mut unsealed = msg.clone();
        unsealed.envelope_hash.clear();
        let bytes = Self::serialize(&unsealed)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Compute and assign the envelope hash, sealing the message.
    pub fn set_envelope_hash(msg: &mut Message) -> Result<(), CodecError> {
        msg.envelope_hash = Self::compute_hash(msg)?;
        Ok(())
    }

    /// Verify the stored envelope hash against the message content.
    ///
    /// # Errors
    ///
    /// `CodecError::Integrity` if the message is unsealed or the hashes differ.
    pub fn validate_hash(msg: &Message) -> Result<(), CodecError> {
        let expected = Self::compute_hash(msg)?;
        if msg.envelope_hash != expected {
            return Err(CodecError::Integrity {
                expected,
                stored: msg.envelope_hash.clone(),
            });
        }
        Ok(())
    }
}

/// Encode any serializable value as canonical JSON.
pub fn to_canonical_vec<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let tree = serde_json::to_value(value)
        .map_err(|e| CodecError::Serialization(e.to_string()))?;
    serde_json::to_vec(&canonicalize(tree)).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Recursively sort object keys.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut sorted = Map::with_capacity(entries.len());
            for (key, child) in entries {
                sorted.insert(key, canonicalize(child));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        scalar => scalar,
    }
}
