//! Database-per-tenant strategy.
//!
//! Each tenant gets its own connection string, and therefore its own backend
//! connection. This is the strongest isolation and the most expensive one;
//! bound the number of live connections with the pool's `max_pool_size`.

use serde::{Deserialize, Serialize};

use crate::adapter::AdapterConfig;
use crate::tenant::{OperationContext, TenantId};

use super::{TenantResolution, TenantResolver, tenant_hash, tenant_name};

/// Configuration for database-per-tenant tenancy.
///
/// # Example
///
/// ```
/// use helios_entity::strategy::DatabasePerTenantConfig;
///
/// let config = DatabasePerTenantConfig::default()
///     .with_connection_template("/var/lib/app/{database}.db");
/// assert!(config.connection_template.contains("{database}"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabasePerTenantConfig {
    /// Connection string template.
    ///
    /// Supported placeholders:
    /// - `{connection}` - The static connection string
    /// - `{database}` - `{prefix}{tenant}{suffix}`
    /// - `{tenant}` - The sanitized tenant name, digest-suffixed unless the ID is plain lowercase alphanumeric
    /// - `{tenant_hash}` - Hash of the tenant ID
    #[serde(default = "default_connection_template")]
    pub connection_template: String,

    /// Database name prefix.
    #[serde(default = "default_database_prefix")]
    pub database_prefix: String,

    /// Database name suffix.
    #[serde(default)]
    pub database_suffix: String,

    /// Maximum length for tenant IDs in database names.
    #[serde(default = "default_max_tenant_id_length")]
    pub max_tenant_id_length: usize,
}

fn default_connection_template() -> String {
    "{database}".to_string()
}

fn default_database_prefix() -> String {
    "tenant_".to_string()
}

fn default_max_tenant_id_length() -> usize {
    32
}

impl Default for DatabasePerTenantConfig {
    fn default() -> Self {
        Self {
            connection_template: default_connection_template(),
            database_prefix: default_database_prefix(),
            database_suffix: String::new(),
            max_tenant_id_length: default_max_tenant_id_length(),
        }
    }
}

impl DatabasePerTenantConfig {
    /// Sets the connection template.
    pub fn with_connection_template(mut self, template: impl Into<String>) -> Self {
        self.connection_template = template.into();
        self
    }

    /// Sets the database prefix.
    pub fn with_database_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.database_prefix = prefix.into();
        self
    }

    /// Sets the database suffix.
    pub fn with_database_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.database_suffix = suffix.into();
        self
    }
}

/// Routes each tenant to its own database.
#[derive(Debug, Clone)]
pub struct DatabasePerTenantStrategy {
    config: DatabasePerTenantConfig,
}

impl DatabasePerTenantStrategy {
    /// Creates the strategy.
    pub fn new(config: DatabasePerTenantConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DatabasePerTenantConfig {
        &self.config
    }

    /// Generates the database name for a tenant.
    pub fn database_name(&self, tenant_id: &TenantId) -> String {
        format!(
            "{}{}{}",
            self.config.database_prefix,
            tenant_name(tenant_id, self.config.max_tenant_id_length),
            self.config.database_suffix
        )
    }

    /// Generates the connection string for a tenant.
    pub fn connection_string(&self, tenant_id: &TenantId, base: &AdapterConfig) -> String {
        self.config
            .connection_template
            .replace("{connection}", &base.connection)
            .replace("{database}", &self.database_name(tenant_id))
            .replace("{tenant_hash}", &tenant_hash(tenant_id))
            .replace(
                "{tenant}",
                &tenant_name(tenant_id, self.config.max_tenant_id_length),
            )
    }
}

impl TenantResolver for DatabasePerTenantStrategy {
    fn resolve(&self, ctx: &OperationContext, base: &AdapterConfig) -> TenantResolution {
        let Some(tenant) = ctx.tenant_id() else {
            return TenantResolution::shared(base);
        };
        let connection = self.connection_string(tenant, base);
        TenantResolution::new(
            format!("database:{}", connection),
            base.clone().with_connection(connection),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_name_generation() {
        let strategy = DatabasePerTenantStrategy::new(
            DatabasePerTenantConfig::default().with_database_suffix("_db"),
        );
        assert_eq!(strategy.database_name(&TenantId::new("acme")), "tenant_acme_db");
    }

    #[test]
    fn test_connection_string_generation() {
        let strategy = DatabasePerTenantStrategy::new(
            DatabasePerTenantConfig::default().with_connection_template("{connection}/{tenant}.db"),
        );
        let base = AdapterConfig::sqlite("/data", "posts");
        let resolution = strategy.resolve(&OperationContext::for_tenant("Acme"), &base);
        assert_eq!(resolution.config.connection, "/data/acme_37036cd8f974.db");
        assert_eq!(resolution.hash, "database:/data/acme_37036cd8f974.db");
        assert_eq!(resolution.config.collection, "posts");
    }

    #[test]
    fn test_distinct_tenants_get_distinct_signatures() {
        let strategy = DatabasePerTenantStrategy::new(DatabasePerTenantConfig::default());
        let base = AdapterConfig::memory("posts");
        let a = strategy.resolve(&OperationContext::for_tenant("a"), &base);
        let b = strategy.resolve(&OperationContext::for_tenant("b"), &base);
        assert_ne!(a.hash, b.hash);
        assert_ne!(a.config.signature(), b.config.signature());

        let dashed = strategy.resolve(&OperationContext::for_tenant("acme-corp"), &base);
        let shouted = strategy.resolve(&OperationContext::for_tenant("ACME_corp"), &base);
        assert_ne!(dashed.hash, shouted.hash);
        assert_ne!(dashed.config.connection, shouted.config.connection);
    }

    #[test]
    fn test_long_tenant_id_hashing() {
        let strategy = DatabasePerTenantStrategy::new(DatabasePerTenantConfig::default());
        let name = strategy.database_name(&TenantId::new("a-very-long-tenant-identifier-beyond-limits"));
        assert!(name.starts_with("tenant_t_"));
    }
}
