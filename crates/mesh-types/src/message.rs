//! # Message
//!
//! The unit of exchange between agents.
//!
//! ## Wire Schema (closed)
//!
//! | Field | Type | Required | Format |
//! |-------|------|----------|--------|
//! | `id` | string | yes | ULID-shaped, non-empty |
//! | `trace_id` | string | no | 32 hex chars |
//! | `span_id` | string | no | 16 hex chars |
//! | `from` / `to` | string | yes | non-empty |
//! | `type` | enum | yes | `request`, `response`, `event`, `control` |
//! | `payload` | any | no | opaque to the bus |
//! | `metadata` | object | no | `trace.*` keys reserved |
//! | `cost` | object | no | `{tokens ≥ 0, dollars ≥ 0}` |
//! | `ts` | string | yes | RFC3339, nanosecond precision, UTC |
//! | `envelope_hash` | string | no | 64 hex chars |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::errors::CodecError;

/// Metadata keys with this prefix carry propagated trace context.
pub const TRACE_METADATA_PREFIX: &str = "trace.";

/// Crockford base32 alphabet used by ULIDs.
const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// ULID-shaped message identifier helpers.
///
/// Identifiers are 26 Crockford base32 characters: 48 bits of millisecond
/// timestamp followed by 80 random bits, so they sort by creation time.
pub struct MessageId;

impl MessageId {
    /// Length of an encoded identifier.
    pub const LEN: usize = 26;

    /// Generate a new identifier for the current instant.
    #[must_use]
    pub fn generate() -> String {
        Self::from_parts(Utc::now().timestamp_millis().max(0) as u64, rand::random())
    }

    /// Encode a millisecond timestamp and entropy into a ULID string.
    ///
    /// Only the low 48 bits of `millis` and the low 80 bits of `entropy` are used.
    #[must_use]
    pub fn from_parts(millis: u64, entropy: u128) -> String {
        let time = u128::from(millis & 0xFFFF_FFFF_FFFF);
        let random = entropy & ((1u128 << 80) - 1);
        let value = (time << 80) | random;

        (0..Self::LEN)
            .map(|i| {
                let shift = 125 - 5 * i;
                CROCKFORD[((value >> shift) & 0x1F) as usize] as char
            })
            .collect()
    }

    /// Check whether `id` is a well-formed ULID.
    #[must_use]
    pub fn is_ulid(id: &str) -> bool {
        id.len() == Self::LEN
            && id.bytes().all(|b| CROCKFORD.contains(&b))
            // 26 * 5 = 130 bits, the top two must be zero
            && id.as_bytes()[0] <= b'7'
    }
}

/// The closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Control,
}

impl MessageType {
    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Event => "event",
            MessageType::Control => "control",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource cost attributed to a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cost {
    /// Tokens consumed.
    #[serde(default)]
    pub tokens: u64,
    /// Monetary cost in dollars. Must be finite and non-negative.
    #[serde(default)]
    pub dollars: f64,
}

impl Cost {
    pub fn new(tokens: u64, dollars: f64) -> Self {
        Self { tokens, dollars }
    }
}

/// The canonical data entity exchanged between agents.
///
/// A message is *sealed* once `envelope_hash` holds the SHA-256 of its own
/// canonical encoding (see [`crate::CanonicalSerializer`]). Mutating any field
/// afterwards without resealing makes [`Message::validate_hash`] fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    /// Globally unique, lexicographically sortable identifier.
    pub id: String,

    /// Distributed trace identifier (32 hex chars).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Span identifier of the producing span (16 hex chars).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    /// Sending agent or topic.
    pub from: String,

    /// Receiving agent or topic.
    pub to: String,

    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Application payload, opaque to the bus.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,

    /// Workflow context and propagated trace context.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,

    /// Attributed cost.
    #[serde(default)]
    pub cost: Cost,

    /// Event time.
    #[serde(rename = "ts", with = "rfc3339_nanos")]
    pub timestamp: DateTime<Utc>,

    /// Hex SHA-256 of the canonical encoding; empty until sealed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub envelope_hash: String,
}

impl Message {
    /// Create an unsealed message with a fresh ID and the current time.
    pub fn new(from: impl Into<String>, to: impl Into<String>, kind: MessageType) -> Self {
        Self {
            id: MessageId::generate(),
            trace_id: None,
            span_id: None,
            from: from.into(),
            to: to.into(),
            kind,
            payload: Value::Null,
            metadata: Map::new(),
            cost: Cost::default(),
            timestamp: Utc::now(),
            envelope_hash: String::new(),
        }
    }

    pub fn request(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, MessageType::Request)
    }

    pub fn response(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, MessageType::Response)
    }

    pub fn event(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, MessageType::Event)
    }

    pub fn control(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, MessageType::Control)
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_cost(mut self, cost: Cost) -> Self {
        self.cost = cost;
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns true once an envelope hash has been assigned.
    ///
    /// A sealed message is not necessarily valid; use [`Message::validate_hash`].
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        !self.envelope_hash.is_empty()
    }

    /// Seal the message in place. See [`crate::CanonicalSerializer::set_envelope_hash`].
    pub fn seal(&mut self) -> Result<(), CodecError> {
        crate::CanonicalSerializer::set_envelope_hash(self)
    }

    /// Verify the seal. See [`crate::CanonicalSerializer::validate_hash`].
    pub fn validate_hash(&self) -> Result<(), CodecError> {
        crate::CanonicalSerializer::validate_hash(self)
    }

    /// Metadata entries reserved for trace propagation.
    pub fn trace_metadata(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.metadata
            .iter()
            .filter(|(k, _)| k.starts_with(TRACE_METADATA_PREFIX))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Check every field against its declared format.
    ///
    /// Serde enforces presence and types; this enforces the value constraints
    /// the type system cannot express.
    pub fn validate_fields(&self) -> Result<(), CodecError> {
        if self.id.is_empty() {
            return Err(CodecError::schema("field `id` must not be empty"));
        }
        if self.from.is_empty() {
            return Err(CodecError::schema("field `from` must not be empty"));
        }
        if self.to.is_empty() {
            return Err(CodecError::schema("field `to` must not be empty"));
        }
        if let Some(trace_id) = &self.trace_id {
            check_hex("trace_id", trace_id, 32)?;
        }
        if let Some(span_id) = &self.span_id {
            check_hex("span_id", span_id, 16)?;
        }
        if !self.envelope_hash.is_empty() {
            check_hex("envelope_hash", &self.envelope_hash, 64)?;
        }
        if !self.cost.dollars.is_finite() || self.cost.dollars < 0.0 {
            return Err(CodecError::schema(format!(
                "field `cost.dollars` must be a finite non-negative number, got {}",
                self.cost.dollars
            )));
        }
        Ok(())
    }
}

fn check_hex(field: &str, value: &str, len: usize) -> Result<(), CodecError> {
    if value.len() != len || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CodecError::schema(format!(
            "field `{field}` must be {len} hex chars, got {value:?}"
        )));
    }
    Ok(())
}

/// Fixed timestamp rendering: RFC3339, nine fractional digits, `Z` suffix.
pub(crate) mod rfc3339_nanos {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| serde::de::Error::custom(format!("invalid RFC3339 timestamp {raw:?}: {e}")))
    }
}
