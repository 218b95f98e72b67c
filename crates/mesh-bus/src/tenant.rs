//! # Tenant Routing
//!
//! Tenant-scoped subjects carry the tenant as their first token:
//!
//! ```text
//! <tenant_id>.<category>.<resource>.<in|out>
//! 6f1c2a9e-7d3b-4f0e-9a51-2c8d4e6f7a90.agents.planner.in
//! ```
//!
//! There is no broker-side enforcement point, so every publish and subscribe
//! on a tenant-scoped subject checks the subject's tenant against the
//! caller's [`BusContext`]. The check fails closed: a missing context tenant
//! is a rejection, not a pass.

use std::fmt;

use mesh_telemetry::{log_security_event, metrics};
use uuid::Uuid;

use crate::context::BusContext;
use crate::errors::{SubjectError, TenantScopeError};
use crate::subjects::{category, validate_token, Direction, Subject, SubjectPattern};

/// Length of a tenant identifier in canonical UUID text form.
pub const TENANT_ID_LEN: usize = 36;

const TENANT_ID_HYPHENS: usize = 4;

/// Minimum tokens in a tenant-scoped subject.
pub const MIN_TENANT_SUBJECT_TOKENS: usize = 3;

/// Tenant identifier: 36 characters with exactly four hyphens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, TenantScopeError> {
        let raw = raw.into();
        if !Self::is_tenant_shaped(&raw) {
            return Err(TenantScopeError::InvalidFormat {
                reason: format!(
                    "tenant id must be {TENANT_ID_LEN} characters with {TENANT_ID_HYPHENS} hyphens"
                ),
                subject: raw,
            });
        }
        Ok(Self(raw))
    }

    /// Fresh random tenant identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Shape check only; content is not otherwise interpreted.
    pub fn is_tenant_shaped(token: &str) -> bool {
        token.len() == TENANT_ID_LEN
            && token.matches('-').count() == TENANT_ID_HYPHENS
            && validate_token(token).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for TenantId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }
}

/// Builds subjects inside one tenant's namespace.
#[derive(Debug, Clone)]
pub struct TenantSubjectBuilder {
    tenant: TenantId,
}

impl TenantSubjectBuilder {
    pub fn new(tenant: TenantId) -> Self {
        Self { tenant }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    fn build(&self, category: &str, resource: &str, direction: Direction) -> Result<Subject, SubjectError> {
        validate_token(resource)?;
        Subject::parse(format!(
            "{}.{category}.{resource}.{direction}",
            self.tenant
        ))
    }

    pub fn workflow(&self, id: &str, direction: Direction) -> Result<Subject, SubjectError> {
        self.build(category::WORKFLOWS, id, direction)
    }

    pub fn agent(&self, id: &str, direction: Direction) -> Result<Subject, SubjectError> {
        self.build(category::AGENTS, id, direction)
    }

    pub fn tool(&self, name: &str, direction: Direction) -> Result<Subject, SubjectError> {
        self.build(category::TOOLS, name, direction)
    }

    /// Every subject of one workflow in this tenant: `<tenant>.workflows.<id>.*`.
    pub fn workflow_all(&self, id: &str) -> Result<SubjectPattern, SubjectError> {
        validate_token(id)?;
        SubjectPattern::parse(format!("{}.{}.{id}.*", self.tenant, category::WORKFLOWS))
    }
}

/// Extract the tenant from a tenant-scoped subject or pattern.
pub fn extract_tenant(subject: &str) -> Result<TenantId, TenantScopeError> {
    let invalid = |reason: &str| TenantScopeError::InvalidFormat {
        subject: subject.to_string(),
        reason: reason.to_string(),
    };

    let tokens: Vec<&str> = subject.split('.').collect();
    if tokens.len() < MIN_TENANT_SUBJECT_TOKENS {
        return Err(invalid("tenant subject needs at least 3 segments"));
    }
    if !TenantId::is_tenant_shaped(tokens[0]) {
        return Err(invalid("first segment is not a tenant id"));
    }
    Ok(TenantId(tokens[0].to_string()))
}

/// Check that `ctx` may address `subject`. Returns the subject's tenant.
///
/// Fails on malformed tenant subjects, a missing context tenant, and tenant
/// mismatch. Every rejection is logged as a security event and counted.
pub fn validate_subject_tenant_access(
    ctx: &BusContext,
    subject: &str,
) -> Result<TenantId, TenantScopeError> {
    check_access(ctx, subject, "access")
}

pub(crate) fn check_access(
    ctx: &BusContext,
    subject: &str,
    operation: &'static str,
) -> Result<TenantId, TenantScopeError> {
    let result = extract_tenant(subject).and_then(|subject_tenant| {
        let context_tenant = ctx.tenant()?;
        if *context_tenant != subject_tenant {
            return Err(TenantScopeError::CrossTenant {
                subject_tenant: subject_tenant.to_string(),
                context_tenant: context_tenant.to_string(),
            });
        }
        Ok(subject_tenant)
    });

    if let Err(err) = &result {
        metrics::TENANT_REJECTIONS
            .with_label_values(&[operation])
            .inc();
        log_security_event!(
            "Tenant scope rejected",
            operation = operation,
            subject = %subject,
            error = %err
        );
    }
    result
}
