//! Ambient tenant context.
//!
//! Every job and lookup is scoped to one tenant. Request handling code runs
//! inside [`TenantContext::scope`], and anything underneath (job submission
//! in particular) can recover the current tenant without threading it
//! through every call.

use std::future::Future;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
}

tokio::task_local! {
    static CURRENT: TenantContext;
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: None,
            request_id: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Run `fut` with this context as the ambient tenant.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, fut).await
    }

    /// The ambient context, if any.
    pub fn current() -> Option<TenantContext> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// The ambient tenant id, if any.
    pub fn current_tenant_id() -> Option<String> {
        CURRENT.try_with(|context| context.tenant_id.clone()).ok()
    }
}
