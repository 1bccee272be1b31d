//! Operation context threaded through every entity call.

use std::sync::Arc;

use serde_json::{Map, Value};

use super::capabilities::Capabilities;
use super::id::TenantId;

/// Opaque caller/request context.
///
/// Carries the tenant identity and caller capabilities. The field engine
/// passes it through untouched to tenancy resolvers, authorization hooks,
/// field hooks and scope functions; interpretation is up to them.
///
/// Cloning is cheap: capabilities and metadata are shared.
///
/// # Examples
///
/// ```
/// use helios_entity::tenant::{Capabilities, OperationContext};
///
/// let ctx = OperationContext::new(Capabilities::all())
///     .with_tenant("acme")
///     .with_user_id("user-1")
///     .with_meta("locale", serde_json::json!("en"));
///
/// assert_eq!(ctx.tenant_id().map(|t| t.as_str()), Some("acme"));
/// assert_eq!(ctx.meta("locale"), Some(&serde_json::json!("en")));
/// ```
#[derive(Debug, Clone)]
pub struct OperationContext {
    tenant_id: Option<TenantId>,
    capabilities: Arc<Capabilities>,
    correlation_id: Option<String>,
    user_id: Option<String>,
    meta: Arc<Map<String, Value>>,
    /// Number of populate lookups between the caller and this context.
    populate_depth: usize,
}

impl OperationContext {
    /// Creates a context without a tenant.
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            tenant_id: None,
            capabilities: Arc::new(capabilities),
            correlation_id: None,
            user_id: None,
            meta: Arc::new(Map::new()),
            populate_depth: 0,
        }
    }

    /// Creates an internal context with every capability.
    pub fn system() -> Self {
        Self::new(Capabilities::all())
    }

    /// Creates a context with the given tenant and full capabilities.
    pub fn for_tenant(tenant_id: impl Into<TenantId>) -> Self {
        Self::system().with_tenant(tenant_id)
    }

    /// Sets the tenant.
    pub fn with_tenant(mut self, tenant_id: impl Into<TenantId>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Sets the correlation ID for tracing.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the user ID for auditing.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        Arc::make_mut(&mut self.meta).insert(key.into(), value);
        self
    }

    /// Returns the tenant ID, if any.
    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    /// Returns the caller capabilities.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Returns the correlation ID, if set.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Returns the user ID, if set.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Returns a metadata entry.
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.meta.get(key)
    }

    /// Returns the current populate depth.
    pub fn populate_depth(&self) -> usize {
        self.populate_depth
    }

    /// Returns a copy of this context one populate level deeper.
    pub fn nested(&self) -> Self {
        let mut next = self.clone();
        next.populate_depth += 1;
        next
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_has_no_tenant() {
        let ctx = OperationContext::new(Capabilities::none());
        assert!(ctx.tenant_id().is_none());
        assert!(!ctx.capabilities().has("x"));
    }

    #[test]
    fn test_for_tenant() {
        let ctx = OperationContext::for_tenant("t1");
        assert_eq!(ctx.tenant_id(), Some(&TenantId::new("t1")));
        assert!(ctx.capabilities().is_all());
    }

    #[test]
    fn test_with_correlation_id() {
        let ctx = OperationContext::system().with_correlation_id("req-123");
        assert_eq!(ctx.correlation_id(), Some("req-123"));
    }

    #[test]
    fn test_nested_increments_depth_only_on_copy() {
        let ctx = OperationContext::system();
        let nested = ctx.nested().nested();
        assert_eq!(ctx.populate_depth(), 0);
        assert_eq!(nested.populate_depth(), 2);
    }

    #[test]
    fn test_meta_is_copy_on_write() {
        let base = OperationContext::system().with_meta("a", Value::from(1));
        let extended = base.clone().with_meta("b", Value::from(2));
        assert!(base.meta("b").is_none());
        assert_eq!(extended.meta("a"), Some(&Value::from(1)));
    }
}
