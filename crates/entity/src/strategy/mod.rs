//! Multitenancy strategies.
//!
//! A [`TenantResolver`] turns an operation context and the service's static
//! [`AdapterConfig`] into a tenant hash (the adapter pool key) and the
//! configuration the pooled adapter is built from.
//!
//! | Strategy | Isolation | Adapters |
//! |----------|-----------|----------|
//! | [`SingleStrategy`] | none | one for everybody |
//! | [`CollectionPerTenantStrategy`] | collection | one per tenant, shared connection |
//! | [`SchemaPerTenantStrategy`] | schema | one per tenant, shared connection |
//! | [`DatabasePerTenantStrategy`] | database | one per tenant, own connection |
//!
//! Contexts without a tenant always resolve to the static configuration
//! under the [`DEFAULT_TENANT_HASH`] key.
//!
//! # Example
//!
//! ```
//! use helios_entity::adapter::AdapterConfig;
//! use helios_entity::strategy::{SchemaPerTenantConfig, TenancyStrategy, TenantResolver};
//! use helios_entity::tenant::OperationContext;
//!
//! let strategy = TenancyStrategy::SchemaPerTenant(SchemaPerTenantConfig::default());
//! let resolution = strategy.resolve(
//!     &OperationContext::for_tenant("acme"),
//!     &AdapterConfig::memory("posts"),
//! );
//! assert_eq!(resolution.hash, "schema:tenant_acme");
//! assert_eq!(resolution.config.schema.as_deref(), Some("tenant_acme"));
//! ```

mod collection_per_tenant;
mod database_per_tenant;
mod schema_per_tenant;
mod single;

pub use collection_per_tenant::{CollectionPerTenantConfig, CollectionPerTenantStrategy};
pub use database_per_tenant::{DatabasePerTenantConfig, DatabasePerTenantStrategy};
pub use schema_per_tenant::{SchemaPerTenantConfig, SchemaPerTenantStrategy};
pub use single::SingleStrategy;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::adapter::AdapterConfig;
use crate::tenant::{OperationContext, TenantId};

/// Pool key used when no tenant applies.
pub const DEFAULT_TENANT_HASH: &str = "default";

/// The outcome of tenant resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantResolution {
    /// Pool key. Equal hashes share one adapter.
    pub hash: String,
    /// Configuration for the adapter behind `hash`.
    pub config: AdapterConfig,
}

impl TenantResolution {
    /// Creates a resolution.
    pub fn new(hash: impl Into<String>, config: AdapterConfig) -> Self {
        Self {
            hash: hash.into(),
            config,
        }
    }

    /// The resolution used when no tenant applies.
    pub fn shared(config: &AdapterConfig) -> Self {
        Self::new(DEFAULT_TENANT_HASH, config.clone())
    }
}

/// Routes an operation to a tenant hash and backend configuration.
pub trait TenantResolver: Send + Sync + fmt::Debug {
    /// Resolves the pool key and adapter configuration for `ctx`.
    fn resolve(&self, ctx: &OperationContext, base: &AdapterConfig) -> TenantResolution;
}

type ResolveFn = dyn Fn(&OperationContext, &AdapterConfig) -> TenantResolution + Send + Sync;

/// A resolver backed by a closure, for routing rules the built-in
/// strategies do not cover.
#[derive(Clone)]
pub struct FnResolver(Arc<ResolveFn>);

impl FnResolver {
    /// Wraps `f`.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&OperationContext, &AdapterConfig) -> TenantResolution + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for FnResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FnResolver(..)")
    }
}

impl TenantResolver for FnResolver {
    fn resolve(&self, ctx: &OperationContext, base: &AdapterConfig) -> TenantResolution {
        (self.0)(ctx, base)
    }
}

/// The tenancy strategy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TenancyStrategy {
    /// Every operation uses the same adapter.
    #[default]
    Single,

    /// Each tenant gets its own collection.
    CollectionPerTenant(CollectionPerTenantConfig),

    /// Each tenant gets its own schema.
    SchemaPerTenant(SchemaPerTenantConfig),

    /// Each tenant gets its own database connection.
    DatabasePerTenant(DatabasePerTenantConfig),
}

impl fmt::Display for TenancyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenancyStrategy::Single => write!(f, "single"),
            TenancyStrategy::CollectionPerTenant(_) => write!(f, "collection-per-tenant"),
            TenancyStrategy::SchemaPerTenant(_) => write!(f, "schema-per-tenant"),
            TenancyStrategy::DatabasePerTenant(_) => write!(f, "database-per-tenant"),
        }
    }
}

impl TenancyStrategy {
    /// Returns the isolation level of this strategy.
    pub fn isolation_level(&self) -> IsolationLevel {
        match self {
            TenancyStrategy::Single => IsolationLevel::None,
            TenancyStrategy::CollectionPerTenant(_) => IsolationLevel::Collection,
            TenancyStrategy::SchemaPerTenant(_) => IsolationLevel::Schema,
            TenancyStrategy::DatabasePerTenant(_) => IsolationLevel::Physical,
        }
    }

    /// Builds the resolver for this strategy.
    pub fn into_resolver(self) -> Arc<dyn TenantResolver> {
        match self {
            TenancyStrategy::Single => Arc::new(SingleStrategy::new()),
            TenancyStrategy::CollectionPerTenant(config) => {
                Arc::new(CollectionPerTenantStrategy::new(config))
            }
            TenancyStrategy::SchemaPerTenant(config) => Arc::new(SchemaPerTenantStrategy::new(config)),
            TenancyStrategy::DatabasePerTenant(config) => {
                Arc::new(DatabasePerTenantStrategy::new(config))
            }
        }
    }
}

impl TenantResolver for TenancyStrategy {
    fn resolve(&self, ctx: &OperationContext, base: &AdapterConfig) -> TenantResolution {
        match self {
            TenancyStrategy::Single => SingleStrategy::new().resolve(ctx, base),
            TenancyStrategy::CollectionPerTenant(config) => {
                CollectionPerTenantStrategy::new(config.clone()).resolve(ctx, base)
            }
            TenancyStrategy::SchemaPerTenant(config) => {
                SchemaPerTenantStrategy::new(config.clone()).resolve(ctx, base)
            }
            TenancyStrategy::DatabasePerTenant(config) => {
                DatabasePerTenantStrategy::new(config.clone()).resolve(ctx, base)
            }
        }
    }
}

/// Level of tenant isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Tenants share everything.
    None,
    /// Separate collections in one database.
    Collection,
    /// Separate schemas in one database.
    Schema,
    /// Separate databases.
    Physical,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::None => write!(f, "none"),
            IsolationLevel::Collection => write!(f, "collection"),
            IsolationLevel::Schema => write!(f, "schema"),
            IsolationLevel::Physical => write!(f, "physical"),
        }
    }
}

/// Hex digits of the raw-id digest appended to sanitized names.
const NAME_SUFFIX_LEN: usize = 12;

/// Backend-safe tenant name.
///
/// Ids made only of lowercase ASCII letters and digits are used as-is. Any
/// other id is sanitized and suffixed with a digest of the raw id, so ids
/// that sanitize alike (`acme-corp`, `ACME_corp`) still get distinct names.
/// Names longer than `max_len` are replaced by [`tenant_hash`].
pub(crate) fn tenant_name(tenant_id: &TenantId, max_len: usize) -> String {
    let raw = tenant_id.as_str();
    let plain = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let name = if plain {
        raw.to_string()
    } else {
        format!(
            "{}_{}",
            tenant_id.sanitized().to_lowercase(),
            &digest_hex(raw)[..NAME_SUFFIX_LEN]
        )
    };
    if name.len() > max_len {
        tenant_hash(tenant_id)
    } else {
        name
    }
}

/// SHA-256 based tenant hash; identical across builds and platforms.
pub(crate) fn tenant_hash(tenant_id: &TenantId) -> String {
    format!("t_{}", &digest_hex(tenant_id.as_str())[..16])
}

fn digest_hex(raw: &str) -> String {
    Sha256::digest(raw.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
