//! Scope resolver: named, permission-gated filter fragments merged into a
//! query.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::access::AccessPolicy;
use crate::error::{ConfigurationError, EntityResult};
use crate::field::Hook;
use crate::params::{QueryParams, ScopeSelection};
use crate::tenant::OperationContext;

/// Arguments handed to a function scope.
#[derive(Debug, Clone)]
pub struct ScopeArgs {
    /// The filter built so far.
    pub query: Map<String, Value>,
    pub ctx: OperationContext,
    pub params: QueryParams,
}

/// A scope definition.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeDefinition {
    /// Deep-merged into the filter.
    Filter(Map<String, Value>),
    /// Replaces the filter with its return value.
    Function(Hook<Map<String, Value>, ScopeArgs>),
}

impl ScopeDefinition {
    /// Creates a static filter scope. Non-object values yield an empty
    /// filter.
    pub fn filter(filter: Value) -> Self {
        match filter {
            Value::Object(map) => ScopeDefinition::Filter(map),
            _ => ScopeDefinition::Filter(Map::new()),
        }
    }

    /// Creates a function scope.
    pub fn function(hook: Hook<Map<String, Value>, ScopeArgs>) -> Self {
        ScopeDefinition::Function(hook)
    }
}

/// Resolves the effective scopes of a read and applies them.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use helios_entity::access::CapabilityPolicy;
/// use helios_entity::params::QueryParams;
/// use helios_entity::scope::{ScopeDefinition, ScopeResolver};
/// use helios_entity::tenant::OperationContext;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let resolver = ScopeResolver::new(Arc::new(CapabilityPolicy::new()))
///     .with_scope("onlyActive", ScopeDefinition::filter(json!({"status": "active"})))
///     .with_default_scopes(["onlyActive"])
///     .unwrap();
///
/// let params = resolver
///     .apply_scopes(QueryParams::new(), &OperationContext::system())
///     .await
///     .unwrap();
/// assert_eq!(params.query.unwrap()["status"], json!("active"));
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct ScopeResolver {
    scopes: Vec<(String, ScopeDefinition)>,
    default_scopes: Vec<String>,
    policy: Arc<dyn AccessPolicy>,
}

impl ScopeResolver {
    /// Creates a resolver without scopes.
    pub fn new(policy: Arc<dyn AccessPolicy>) -> Self {
        Self {
            scopes: Vec::new(),
            default_scopes: Vec::new(),
            policy,
        }
    }

    /// Declares a scope, replacing one with the same name.
    pub fn with_scope(mut self, name: impl Into<String>, definition: ScopeDefinition) -> Self {
        let name = name.into();
        self.scopes.retain(|(n, _)| *n != name);
        self.scopes.push((name, definition));
        self
    }

    /// Sets the default scopes. Every name must be declared.
    pub fn with_default_scopes<I, S>(mut self, names: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if let Some(unknown) = names.iter().find(|n| self.definition(n).is_none()) {
            return Err(ConfigurationError::InvalidScope {
                scope: unknown.clone(),
                message: "default scope is not declared".to_string(),
            });
        }
        self.default_scopes = names;
        Ok(self)
    }

    /// Returns the default scope names.
    pub fn default_scopes(&self) -> &[String] {
        &self.default_scopes
    }

    fn definition(&self, name: &str) -> Option<&ScopeDefinition> {
        self.scopes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, def)| def)
    }

    /// Computes the scope names to apply, before permission checks.
    async fn selected(&self, params: &QueryParams, ctx: &OperationContext) -> Vec<String> {
        let mut names = self.default_scopes.clone();
        match &params.scope {
            None | Some(ScopeSelection::Defaults) => {}
            Some(ScopeSelection::Disabled) => {
                if self.policy.check_scope(None, ctx, params).await {
                    names.clear();
                } else {
                    warn!("Disabling default scopes was vetoed");
                }
            }
            Some(ScopeSelection::Named(entries)) => {
                for entry in entries {
                    if let Some(removed) = entry.strip_prefix('-') {
                        names.retain(|n| n != removed);
                    } else if !names.contains(entry) {
                        names.push(entry.clone());
                    }
                }
            }
        }
        names
    }

    /// Merges the effective scopes into `params.query`.
    ///
    /// Undeclared scope names and scopes failing the permission check are
    /// dropped with a warning, never an error. Surviving scopes apply in order.
    pub async fn apply_scopes(
        &self,
        mut params: QueryParams,
        ctx: &OperationContext,
    ) -> EntityResult<QueryParams> {
        let mut query = params.filter();

        for name in self.selected(&params, ctx).await {
            let Some(definition) = self.definition(&name) else {
                warn!(scope = %name, "Ignoring undeclared scope");
                continue;
            };
            if !self.policy.check_scope(Some(&name), ctx, &params).await {
                warn!(scope = %name, "Scope dropped by access policy");
                continue;
            }
            query = match definition {
                ScopeDefinition::Filter(filter) => {
                    deep_merge(&mut query, filter);
                    query
                }
                ScopeDefinition::Function(hook) => {
                    hook.call(ScopeArgs {
                        query,
                        ctx: ctx.clone(),
                        params: params.clone(),
                    })
                    .await?
                }
            };
        }

        params.query = Some(query);
        Ok(params)
    }
}

/// Recursively merges `source` into `target`. Objects merge key by key;
/// anything else overwrites.
pub fn deep_merge(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
