//! Schema-per-tenant strategy.
//!
//! Tenants share the backend connection; each gets its own schema, which
//! adapters map to a namespace (a collection prefix for the memory store, a
//! table prefix for SQLite).

use serde::{Deserialize, Serialize};

use crate::adapter::AdapterConfig;
use crate::tenant::{OperationContext, TenantId};

use super::{TenantResolution, TenantResolver, tenant_name};

/// Configuration for schema-per-tenant tenancy.
///
/// # Example
///
/// ```
/// use helios_entity::strategy::SchemaPerTenantConfig;
///
/// let config = SchemaPerTenantConfig::default()
///     .with_prefix("t_")
///     .with_shared_schema("public");
/// assert_eq!(config.shared_schema.as_deref(), Some("public"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaPerTenantConfig {
    /// Prefix for tenant schema names: `{prefix}{tenant}`.
    #[serde(default = "default_schema_prefix")]
    pub schema_prefix: String,

    /// Schema used by contexts without a tenant. When unset they use the
    /// static configuration.
    #[serde(default)]
    pub shared_schema: Option<String>,

    /// Maximum schema name length. Longer tenant names are hashed.
    #[serde(default = "default_max_schema_length")]
    pub max_schema_length: usize,
}

fn default_schema_prefix() -> String {
    "tenant_".to_string()
}

fn default_max_schema_length() -> usize {
    63
}

impl Default for SchemaPerTenantConfig {
    fn default() -> Self {
        Self {
            schema_prefix: default_schema_prefix(),
            shared_schema: None,
            max_schema_length: default_max_schema_length(),
        }
    }
}

impl SchemaPerTenantConfig {
    /// Sets the schema prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.schema_prefix = prefix.into();
        self
    }

    /// Sets the schema for contexts without a tenant.
    pub fn with_shared_schema(mut self, schema: impl Into<String>) -> Self {
        self.shared_schema = Some(schema.into());
        self
    }
}

/// Routes each tenant to its own schema.
#[derive(Debug, Clone)]
pub struct SchemaPerTenantStrategy {
    config: SchemaPerTenantConfig,
}

impl SchemaPerTenantStrategy {
    /// Creates the strategy.
    pub fn new(config: SchemaPerTenantConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SchemaPerTenantConfig {
        &self.config
    }

    /// Returns the schema name for a tenant.
    pub fn tenant_to_schema(&self, tenant_id: &TenantId) -> String {
        let budget = self
            .config
            .max_schema_length
            .saturating_sub(self.config.schema_prefix.len());
        format!("{}{}", self.config.schema_prefix, tenant_name(tenant_id, budget))
    }
}

impl TenantResolver for SchemaPerTenantStrategy {
    fn resolve(&self, ctx: &OperationContext, base: &AdapterConfig) -> TenantResolution {
        let schema = match (ctx.tenant_id(), &self.config.shared_schema) {
            (Some(tenant), _) => self.tenant_to_schema(tenant),
            (None, Some(shared)) => shared.clone(),
            (None, None) => return TenantResolution::shared(base),
        };
        TenantResolution::new(format!("schema:{}", schema), base.clone().with_schema(schema))
    }
}
