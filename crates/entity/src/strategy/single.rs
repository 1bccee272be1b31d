//! Single-adapter strategy.

use crate::adapter::AdapterConfig;
use crate::tenant::OperationContext;

use super::{DEFAULT_TENANT_HASH, TenantResolution, TenantResolver};

/// Every operation resolves to the static configuration under one key.
#[derive(Debug, Clone)]
pub struct SingleStrategy {
    hash: String,
}

impl SingleStrategy {
    /// Creates the strategy with the default key.
    pub fn new() -> Self {
        Self::with_hash(DEFAULT_TENANT_HASH)
    }

    /// Creates the strategy with a custom key.
    pub fn with_hash(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }
}

impl Default for SingleStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantResolver for SingleStrategy {
    fn resolve(&self, _ctx: &OperationContext, base: &AdapterConfig) -> TenantResolution {
        TenantResolution::new(self.hash.clone(), base.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_is_ignored() {
        let base = AdapterConfig::memory("posts");
        let a = SingleStrategy::new().resolve(&OperationContext::for_tenant("a"), &base);
        let b = SingleStrategy::new().resolve(&OperationContext::for_tenant("b"), &base);
        assert_eq!(a, b);
        assert_eq!(a.hash, "default");
        assert_eq!(a.config, base);
    }
}
