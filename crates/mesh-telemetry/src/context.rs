//! Trace context propagation through message metadata.
//!
//! When a message crosses process boundaries via the bus, trace context
//! travels inside the message itself so the consumer's spans become children
//! of the producer's span.
//!
//! ## How It Works
//!
//! 1. The producer's publish span is captured as a `PropagatedContext`
//! 2. The context is written into the message: `trace_id`/`span_id` fields plus
//!    the reserved `trace.*` metadata keys (before sealing, so it is hashed)
//! 3. The consumer reads it back with `PropagatedContext::from_message`
//! 4. The consume span is parented to it via `to_otel_context`
//!
//! ## Example
//!
//! ```rust,ignore
//! // Producer
//! let span = tracing::info_span!("plan_step", workflow = %wf);
//! let context = PropagatedContext::from_span(&span);
//! context.inject_into(&mut msg);
//!
//! // Consumer
//! let parent = PropagatedContext::from_message(&msg);
//! let span = tracing::info_span!("handle_step");
//! span.set_parent(parent.to_otel_context());
//! ```

use mesh_types::Message;
use opentelemetry::{
    trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState},
    Context,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Reserved metadata keys. All share the `trace.` prefix.
pub mod keys {
    pub const TRACE_ID: &str = "trace.trace_id";
    pub const SPAN_ID: &str = "trace.span_id";
    pub const FLAGS: &str = "trace.flags";
    pub const STATE: &str = "trace.state";
}

const EMPTY_TRACE_ID: &str = "00000000000000000000000000000000";
const EMPTY_SPAN_ID: &str = "0000000000000000";

/// Trace context that can be serialized and sent across process boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagatedContext {
    /// Trace ID (32 hex characters)
    pub trace_id: String,
    /// Parent span ID (16 hex characters)
    pub span_id: String,
    /// Trace flags (sampled, etc.)
    pub trace_flags: u8,
    /// Optional trace state (vendor-specific data)
    pub trace_state: Option<String>,
}

impl PropagatedContext {
    /// Create an empty context (no parent trace)
    pub fn empty() -> Self {
        Self {
            trace_id: EMPTY_TRACE_ID.to_string(),
            span_id: EMPTY_SPAN_ID.to_string(),
            trace_flags: 0,
            trace_state: None,
        }
    }

    /// Start a new sampled trace with random identifiers.
    pub fn new_root() -> Self {
        Self {
            trace_id: format!("{:032x}", rand::random::<u128>().max(1)),
            span_id: Self::random_span_id(),
            trace_flags: TraceFlags::SAMPLED.to_u8(),
            trace_state: None,
        }
    }

    /// Same trace, fresh span identifier.
    pub fn child(&self) -> Self {
        Self {
            span_id: Self::random_span_id(),
            ..self.clone()
        }
    }

    fn random_span_id() -> String {
        format!("{:016x}", rand::random::<u64>().max(1))
    }

    /// Check if this context is valid (has a real trace)
    pub fn is_valid(&self) -> bool {
        is_hex(&self.trace_id, 32)
            && is_hex(&self.span_id, 16)
            && !self.trace_id.chars().all(|c| c == '0')
            && !self.span_id.chars().all(|c| c == '0')
    }

    /// Capture the OpenTelemetry context attached to a `tracing` span.
    ///
    /// Returns an empty context when no OpenTelemetry layer is installed.
    pub fn from_span(span: &tracing::Span) -> Self {
        let context = span.context();
        let span_context = context.span().span_context().clone();

        if !span_context.is_valid() {
            return Self::empty();
        }

        Self {
            trace_id: span_context.trace_id().to_string(),
            span_id: span_context.span_id().to_string(),
            trace_flags: span_context.trace_flags().to_u8(),
            trace_state: None,
        }
    }

    /// Read the context carried by a message.
    ///
    /// The reserved `trace.*` metadata keys win over the top-level
    /// `trace_id`/`span_id` fields.
    pub fn from_message(msg: &Message) -> Self {
        let meta_str = |key: &str| msg.metadata.get(key).and_then(Value::as_str).map(str::to_string);

        let trace_id = meta_str(keys::TRACE_ID).or_else(|| msg.trace_id.clone());
        let span_id = meta_str(keys::SPAN_ID).or_else(|| msg.span_id.clone());

        let (Some(trace_id), Some(span_id)) = (trace_id, span_id) else {
            return Self::empty();
        };

        let trace_flags = msg
            .metadata
            .get(keys::FLAGS)
            .and_then(Value::as_u64)
            .and_then(|f| u8::try_from(f).ok())
            .unwrap_or(0);

        let ctx = Self {
            trace_id,
            span_id,
            trace_flags,
            trace_state: meta_str(keys::STATE),
        };

        if ctx.is_valid() {
            ctx
        } else {
            Self::empty()
        }
    }

    /// Write this context into a message. Invalid contexts are ignored.
    ///
    /// Must happen before sealing: the fields are covered by the envelope hash.
    pub fn inject_into(&self, msg: &mut Message) {
        if !self.is_valid() {
            return;
        }

        msg.trace_id = Some(self.trace_id.clone());
        msg.span_id = Some(self.span_id.clone());
        msg.metadata
            .insert(keys::TRACE_ID.to_string(), Value::from(self.trace_id.clone()));
        msg.metadata
            .insert(keys::SPAN_ID.to_string(), Value::from(self.span_id.clone()));
        msg.metadata
            .insert(keys::FLAGS.to_string(), Value::from(self.trace_flags));
        if let Some(state) = &self.trace_state {
            msg.metadata
                .insert(keys::STATE.to_string(), Value::from(state.clone()));
        }
    }

    /// Convert to an OpenTelemetry context usable as a remote parent.
    pub fn to_otel_context(&self) -> Context {
        if !self.is_valid() {
            return Context::new();
        }

        let trace_id = TraceId::from_hex(&self.trace_id).unwrap_or(TraceId::INVALID);
        let span_id = SpanId::from_hex(&self.span_id).unwrap_or(SpanId::INVALID);

        let trace_state = self
            .trace_state
            .as_ref()
            .and_then(|s| TraceState::from_key_value(vec![("mesh", s.as_str())]).ok())
            .unwrap_or_default();

        let span_context = SpanContext::new(
            trace_id,
            span_id,
            TraceFlags::new(self.trace_flags),
            true, // remote = true (came from another process)
            trace_state,
        );

        Context::new().with_remote_span_context(span_context)
    }
}

impl Default for PropagatedContext {
    fn default() -> Self {
        Self::empty()
    }
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}
