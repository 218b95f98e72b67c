//! # Bus Errors
//!
//! Every fallible bus operation returns [`BusError`]. The variants mirror the
//! failure classes callers need to tell apart: encoding problems, integrity
//! violations, substrate failures, tenant isolation and deadlines.

use std::time::Duration;

use mesh_types::CodecError;
use thiserror::Error;

/// Errors from bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The message could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Decoded data does not satisfy the message schema.
    #[error("Schema violation: {0}")]
    Schema(String),

    /// The envelope hash does not match the message content.
    #[error("Integrity violation: expected envelope hash {expected}, found {stored}")]
    Integrity { expected: String, stored: String },

    /// The log substrate failed or is unreachable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The subject and the caller's tenant disagree.
    #[error(transparent)]
    TenantScope(#[from] TenantScopeError),

    /// The operation exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The subject or subject pattern is malformed.
    #[error(transparent)]
    InvalidSubject(#[from] SubjectError),

    /// The caller's context was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The bus has been closed.
    #[error("Message bus is closed")]
    Closed,

    /// The configuration is unusable.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BusError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Serialization(_) => "serialization",
            Self::Schema(_) => "schema",
            Self::Integrity { .. } => "integrity",
            Self::Transport(_) => "transport",
            Self::TenantScope(_) => "tenant_scope",
            Self::Timeout { .. } => "timeout",
            Self::InvalidSubject(_) => "invalid_subject",
            Self::Cancelled => "cancelled",
            Self::Closed => "closed",
            Self::Config(_) => "config",
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. })
    }
}

impl From<CodecError> for BusError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Serialization(reason) => Self::Serialization(reason),
            CodecError::Schema(reason) => Self::Schema(reason),
            CodecError::Integrity { expected, stored } => Self::Integrity { expected, stored },
        }
    }
}

/// Tenant isolation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TenantScopeError {
    /// A tenant-scoped operation was attempted without a tenant in context.
    #[error("No tenant in context for tenant-scoped subject")]
    MissingTenant,

    /// The subject does not follow `<tenant>.<category>.<resource>...`.
    #[error("Invalid tenant subject {subject:?}: {reason}")]
    InvalidFormat { subject: String, reason: String },

    /// The subject belongs to a different tenant than the context.
    #[error("Tenant {context_tenant} may not access subject of tenant {subject_tenant}")]
    CrossTenant {
        subject_tenant: String,
        context_tenant: String,
    },
}

/// Subject grammar failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubjectError {
    #[error("Subject is empty")]
    Empty,

    #[error("Subject {subject:?} has an empty token at position {position}")]
    EmptyToken { subject: String, position: usize },

    #[error("Subject {subject:?} contains invalid character {found:?}")]
    InvalidCharacter { subject: String, found: char },

    #[error("Wildcards are not allowed in concrete subject {0:?}")]
    WildcardNotAllowed(String),

    #[error("Subject pattern {0:?} has '>' before the last token")]
    MisplacedTail(String),

    #[error("Identifier {0:?} is not a single subject token")]
    InvalidToken(String),

    #[error("No stream stores subject {0:?}")]
    Unrouted(String),
}
