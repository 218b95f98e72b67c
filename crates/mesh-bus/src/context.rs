//! Per-call context: tenant identity and cancellation.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::errors::{BusError, TenantScopeError};
use crate::tenant::TenantId;

/// Context passed to every bus operation and to subscription handlers.
///
/// Cloning shares the cancellation token; [`child`](Self::child) derives one
/// that is cancelled with its parent but can also be cancelled on its own.
#[derive(Debug, Clone, Default)]
pub struct BusContext {
    tenant: Option<TenantId>,
    cancel: CancellationToken,
}

impl BusContext {
    /// Untenanted, never-cancelled context.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_tenant(tenant: TenantId) -> Self {
        Self::new().with_tenant(tenant)
    }

    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The caller's tenant. Absence is an error, never a default.
    pub fn tenant(&self) -> Result<&TenantId, TenantScopeError> {
        self.tenant.as_ref().ok_or(TenantScopeError::MissingTenant)
    }

    pub fn tenant_opt(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Same tenant, cancellation scoped below this context.
    pub fn child(&self) -> Self {
        Self {
            tenant: self.tenant.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    pub(crate) fn ensure_active(&self) -> Result<(), BusError> {
        if self.is_cancelled() {
            Err(BusError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` until it completes or this context is cancelled.
    pub(crate) async fn run<F, T>(&self, fut: F) -> Result<T, BusError>
    where
        F: Future<Output = Result<T, BusError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BusError::Cancelled),
            result = fut => result,
        }
    }
}
