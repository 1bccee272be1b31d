//! Collection-per-tenant strategy.
//!
//! Tenants share the backend connection but write to their own collection.

use serde::{Deserialize, Serialize};

use crate::adapter::AdapterConfig;
use crate::tenant::OperationContext;

use super::{TenantResolution, TenantResolver, tenant_name};

/// Configuration for collection-per-tenant tenancy.
///
/// # Example
///
/// ```
/// use helios_entity::strategy::CollectionPerTenantConfig;
///
/// let config = CollectionPerTenantConfig::default().with_template("{tenant}_{collection}");
/// assert_eq!(config.template, "{tenant}_{collection}");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionPerTenantConfig {
    /// Collection name template. Supports `{collection}` and `{tenant}`.
    #[serde(default = "default_template")]
    pub template: String,

    /// Tenant names longer than this are replaced by a hash.
    #[serde(default = "default_max_tenant_length")]
    pub max_tenant_length: usize,
}

fn default_template() -> String {
    "{collection}_{tenant}".to_string()
}

fn default_max_tenant_length() -> usize {
    48
}

impl Default for CollectionPerTenantConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            max_tenant_length: default_max_tenant_length(),
        }
    }
}

impl CollectionPerTenantConfig {
    /// Sets the collection name template.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }
}

/// Routes each tenant to its own collection.
#[derive(Debug, Clone)]
pub struct CollectionPerTenantStrategy {
    config: CollectionPerTenantConfig,
}

impl CollectionPerTenantStrategy {
    /// Creates the strategy.
    pub fn new(config: CollectionPerTenantConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CollectionPerTenantConfig {
        &self.config
    }
}

impl TenantResolver for CollectionPerTenantStrategy {
    fn resolve(&self, ctx: &OperationContext, base: &AdapterConfig) -> TenantResolution {
        let Some(tenant) = ctx.tenant_id() else {
            return TenantResolution::shared(base);
        };
        let collection = self
            .config
            .template
            .replace("{collection}", &base.collection)
            .replace("{tenant}", &tenant_name(tenant, self.config.max_tenant_length));
        TenantResolution::new(
            format!("collection:{}", collection),
            base.clone().with_collection(collection),
        )
    }
}
