//! Correlation-aware structured logging.
//!
//! Every log line about a message carries the same three correlation fields so
//! logs can be joined with traces:
//! - `message_id`: the message's ULID
//! - `trace_id`: 32-hex trace identifier, or empty
//! - `span_id`: 16-hex span identifier, or empty
//!
//! The bus only emits events; installing a subscriber is the caller's job
//! (see [`crate::init_telemetry`]).

use mesh_types::Message;

/// Borrowed correlation fields of a message.
#[derive(Debug, Clone, Copy)]
pub struct Correlation<'a> {
    pub message_id: &'a str,
    pub trace_id: &'a str,
    pub span_id: &'a str,
}

impl<'a> Correlation<'a> {
    pub fn of(msg: &'a Message) -> Self {
        Self {
            message_id: &msg.id,
            trace_id: msg.trace_id.as_deref().unwrap_or_default(),
            span_id: msg.span_id.as_deref().unwrap_or_default(),
        }
    }
}

/// Log an event about a message with its correlation fields attached.
///
/// # Example
///
/// ```rust,ignore
/// log_message_event!(info, &msg, "Message published", subject = %subject);
/// ```
#[macro_export]
macro_rules! log_message_event {
    ($level:ident, $msg:expr, $text:expr $(, $($field:tt)*)?) => {{
        let correlation = $crate::logging::Correlation::of($msg);
        tracing::$level!(
            message_id = %correlation.message_id,
            trace_id = %correlation.trace_id,
            span_id = %correlation.span_id,
            $($($field)*,)?
            $text
        )
    }};
}

/// Log a security-relevant event (tenant violations, tampering).
#[macro_export]
macro_rules! log_security_event {
    ($text:expr $(, $($field:tt)*)?) => {
        tracing::warn!(
            security = true,
            $($($field)*,)?
            $text
        )
    };
}
