//! Tracing middleware consumed by the message bus.
//!
//! The bus calls into a [`TracingMiddleware`] at three points: before sealing a
//! published message, when dispatching a delivered message to its handler,
//! and around a replay. The middleware is constructed by the caller and
//! handed to the bus, so there is no process-wide tracer lookup inside the bus.

use mesh_types::Message;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::context::PropagatedContext;

/// Trace-context hooks the bus invokes at its publish/consume/replay boundaries.
pub trait TracingMiddleware: Send + Sync {
    /// Write the current trace context into an unsealed message.
    fn inject_trace_context(&self, span: &Span, msg: &mut Message);

    /// Read the trace context carried by a delivered message.
    fn extract_trace_context(&self, msg: &Message) -> PropagatedContext {
        PropagatedContext::from_message(msg)
    }

    /// Span covering a single publish.
    fn publish_span(&self, subject: &str, msg: &Message) -> Span;

    /// Span covering handler execution for a delivered message.
    fn consume_span(&self, subject: &str, msg: &Message) -> Span;

    /// Span covering a replay read.
    fn replay_span(&self, workflow_id: &str) -> Span;
}

/// Middleware that does nothing. The bus accepts it anywhere a tracer is expected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracing;

impl TracingMiddleware for NoopTracing {
    fn inject_trace_context(&self, _span: &Span, _msg: &mut Message) {}

    fn extract_trace_context(&self, _msg: &Message) -> PropagatedContext {
        PropagatedContext::empty()
    }

    fn publish_span(&self, _subject: &str, _msg: &Message) -> Span {
        Span::none()
    }

    fn consume_span(&self, _subject: &str, _msg: &Message) -> Span {
        Span::none()
    }

    fn replay_span(&self, _workflow_id: &str) -> Span {
        Span::none()
    }
}

/// OpenTelemetry-backed middleware.
///
/// Uses the OpenTelemetry context of the publish span when a
/// `tracing-opentelemetry` layer is installed. Without one, it still keeps
/// messages correlated: an existing context on the message is continued with
/// a fresh span id, otherwise a new root trace is started.
#[derive(Debug, Clone)]
pub struct OtelTracing {
    component: String,
}

impl OtelTracing {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }
}

impl Default for OtelTracing {
    fn default() -> Self {
        Self::new("mesh-bus")
    }
}

impl TracingMiddleware for OtelTracing {
    fn inject_trace_context(&self, span: &Span, msg: &mut Message) {
        let mut context = PropagatedContext::from_span(span);
        if !context.is_valid() {
            let carried = PropagatedContext::from_message(msg);
            context = if carried.is_valid() {
                carried.child()
            } else {
                PropagatedContext::new_root()
            };
        }
        context.inject_into(msg);
    }

    fn publish_span(&self, subject: &str, msg: &Message) -> Span {
        tracing::info_span!(
            "bus.publish",
            component = %self.component,
            subject = %subject,
            message_id = %msg.id,
            message_type = %msg.kind,
            otel.kind = "producer",
        )
    }

    fn consume_span(&self, subject: &str, msg: &Message) -> Span {
        let parent = self.extract_trace_context(msg);
        let span = tracing::info_span!(
            "bus.consume",
            component = %self.component,
            subject = %subject,
            message_id = %msg.id,
            message_type = %msg.kind,
            trace_id = %parent.trace_id,
            otel.kind = "consumer",
        );
        if parent.is_valid() {
            span.set_parent(parent.to_otel_context());
        }
        span
    }

    fn replay_span(&self, workflow_id: &str) -> Span {
        tracing::info_span!(
            "bus.replay",
            component = %self.component,
            workflow_id = %workflow_id,
        )
    }
}
