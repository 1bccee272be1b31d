//! Tenant identifier type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque tenant identifier.
///
/// The field engine never interprets tenant ids itself. They are consumed by
/// the tenancy strategies in [`crate::strategy`], which turn them into a pool
/// key and a backend configuration.
///
/// # Examples
///
/// ```
/// use helios_entity::tenant::TenantId;
///
/// let tenant = TenantId::new("acme-corp");
/// assert_eq!(tenant.as_str(), "acme-corp");
/// assert_eq!(tenant.sanitized(), "acme_corp");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a new tenant ID from the given string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the id with every character that is not ASCII alphanumeric
    /// replaced by `_`, suitable for collection, schema and database names.
    pub fn sanitized(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        TenantId::new(s)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        TenantId::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_raw_id() {
        assert_eq!(TenantId::new("acme-corp").to_string(), "acme-corp");
    }

    #[test]
    fn test_sanitized() {
        assert_eq!(TenantId::new("acme/research-1").sanitized(), "acme_research_1");
        assert_eq!(TenantId::new("plain").sanitized(), "plain");
    }

    #[test]
    fn test_serde_roundtrip() {
        let tenant = TenantId::new("acme");
        let json = serde_json::to_string(&tenant).unwrap();
        assert_eq!(json, "\"acme\"");

        let parsed: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, tenant);
    }

    #[test]
    fn test_conversions_agree() {
        let borrowed: TenantId = "globex".into();
        let owned: TenantId = String::from("globex").into();
        assert_eq!(borrowed, owned);
    }
}
