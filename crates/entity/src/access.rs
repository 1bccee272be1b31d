//! Field and scope authorization.
//!
//! The field engine never interprets an [`OperationContext`] itself; every
//! permission decision goes through an [`AccessPolicy`]. The default
//! [`CapabilityPolicy`] grants a field when the caller holds any of its
//! declared capability tags.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use futures::future::join_all;

use crate::field::FieldDescriptor;
use crate::params::QueryParams;
use crate::tenant::OperationContext;

/// Kind of field access being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldAccess {
    Read,
    Write,
}

/// Authorization hooks.
#[async_trait]
pub trait AccessPolicy: Send + Sync + fmt::Debug {
    /// Returns `true` if the caller may read or write the field.
    async fn check_field(
        &self,
        field: &FieldDescriptor,
        access: FieldAccess,
        ctx: &OperationContext,
    ) -> bool;

    /// Returns `true` if the caller may use the scope.
    ///
    /// `scope` is `None` when the caller asks to disable the default scopes;
    /// returning `false` then vetoes the request and the defaults stay.
    async fn check_scope(
        &self,
        scope: Option<&str>,
        ctx: &OperationContext,
        params: &QueryParams,
    ) -> bool;
}

/// Capability-tag based policy.
///
/// # Examples
///
/// ```
/// use helios_entity::access::CapabilityPolicy;
///
/// let policy = CapabilityPolicy::new()
///     .scope_requires("allTenants", ["admin"])
///     .disable_scopes_requires(["admin"]);
/// # let _ = policy;
/// ```
#[derive(Debug, Clone, Default)]
pub struct CapabilityPolicy {
    scope_tags: HashMap<String, Vec<String>>,
    disable_tags: Option<Vec<String>>,
}

impl CapabilityPolicy {
    /// Creates a policy that only gates fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires any of the tags to use the named scope.
    pub fn scope_requires<I, S>(mut self, scope: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope_tags
            .insert(scope.into(), tags.into_iter().map(Into::into).collect());
        self
    }

    /// Requires any of the tags to disable the default scopes.
    pub fn disable_scopes_requires<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disable_tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl AccessPolicy for CapabilityPolicy {
    async fn check_field(
        &self,
        field: &FieldDescriptor,
        access: FieldAccess,
        ctx: &OperationContext,
    ) -> bool {
        let tags = match access {
            FieldAccess::Read => field.read_permissions(),
            FieldAccess::Write => field.permission.as_deref(),
        };
        tags.is_none_or(|tags| ctx.capabilities().has_any(tags))
    }

    async fn check_scope(
        &self,
        scope: Option<&str>,
        ctx: &OperationContext,
        _params: &QueryParams,
    ) -> bool {
        let tags = match scope {
            Some(name) => self.scope_tags.get(name),
            None => self.disable_tags.as_ref(),
        };
        tags.is_none_or(|tags| ctx.capabilities().has_any(tags))
    }
}

/// Returns the fields the caller may access, in declaration order.
///
/// Checks run concurrently.
pub async fn authorized_fields<'a>(
    policy: &dyn AccessPolicy,
    fields: &'a [FieldDescriptor],
    access: FieldAccess,
    ctx: &OperationContext,
) -> Vec<&'a FieldDescriptor> {
    let checks = join_all(
        fields
            .iter()
            .map(|field| policy.check_field(field, access, ctx)),
    )
    .await;
    fields
        .iter()
        .zip(checks)
        .filter_map(|(field, allowed)| allowed.then_some(field))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldType;
    use crate::tenant::Capabilities;

    fn salary() -> FieldDescriptor {
        let mut field = FieldDescriptor::new("salary", FieldType::Number);
        field.permission = Some(vec!["hr".to_string()]);
        field.read_permission = Some(vec!["staff".to_string(), "hr".to_string()]);
        field
    }

    #[tokio::test]
    async fn test_field_without_tags_is_open() {
        let ctx = OperationContext::new(Capabilities::none());
        let field = FieldDescriptor::new("title", FieldType::String);
        assert!(
            CapabilityPolicy::new()
                .check_field(&field, FieldAccess::Write, &ctx)
                .await
        );
    }

    #[tokio::test]
    async fn test_read_and_write_tags() {
        let staff = OperationContext::new(Capabilities::from_tags(["staff"]));
        let policy = CapabilityPolicy::new();
        assert!(policy.check_field(&salary(), FieldAccess::Read, &staff).await);
        assert!(!policy.check_field(&salary(), FieldAccess::Write, &staff).await);

        let hr = OperationContext::new(Capabilities::from_tags(["hr"]));
        assert!(policy.check_field(&salary(), FieldAccess::Write, &hr).await);
    }

    #[tokio::test]
    async fn test_scope_tags() {
        let policy = CapabilityPolicy::new()
            .scope_requires("allTenants", ["admin"])
            .disable_scopes_requires(["admin"]);
        let user = OperationContext::new(Capabilities::none());
        let admin = OperationContext::new(Capabilities::from_tags(["admin"]));
        let params = QueryParams::new();

        assert!(policy.check_scope(Some("mine"), &user, &params).await);
        assert!(!policy.check_scope(Some("allTenants"), &user, &params).await);
        assert!(!policy.check_scope(None, &user, &params).await);
        assert!(policy.check_scope(None, &admin, &params).await);
    }

    #[tokio::test]
    async fn test_authorized_fields_keeps_order() {
        let fields = vec![
            FieldDescriptor::new("title", FieldType::String),
            salary(),
            FieldDescriptor::new("votes", FieldType::Number),
        ];
        let ctx = OperationContext::new(Capabilities::none());
        let names: Vec<&str> = authorized_fields(&CapabilityPolicy::new(), &fields, FieldAccess::Read, &ctx)
            .await
            .into_iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(names, vec!["title", "votes"]);
    }
}
