//! Service and pool settings.
//!
//! Both structs deserialize from JSON (or any serde format) with every field
//! optional, and report all problems at once through `validate()`.
//!
//! ```
//! use helios_entity::config::{PoolSettings, ServiceSettings};
//! use std::time::Duration;
//!
//! let pool: PoolSettings = serde_json::from_value(serde_json::json!({
//!     "max_pool_size": 5,
//!     "reconnect_delay": "250ms"
//! }))
//! .unwrap();
//! assert_eq!(pool.reconnect_delay, Duration::from_millis(250));
//! assert!(pool.auto_reconnect);
//!
//! let service = ServiceSettings::default().with_default_page_size(25);
//! assert!(service.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::field::{CompileOptions, DEFAULT_PRIMARY_KEY, DEFAULT_PRIMARY_KEY_COLUMN, Strictness};

/// Default event type published after every mutation.
pub const DEFAULT_ENTITY_CHANGED_EVENT: &str = "entity.changed";

/// Settings of one entity service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Name of the synthesized primary key.
    #[serde(default = "default_primary_key_name")]
    pub primary_key_name: String,

    /// Backend column of the synthesized primary key.
    #[serde(default = "default_primary_key_column")]
    pub primary_key_column: String,

    /// Scopes applied to every read unless disabled.
    #[serde(default)]
    pub default_scopes: Vec<String>,

    /// Fields populated when the caller does not ask for any.
    #[serde(default)]
    pub default_populates: Vec<String>,

    /// Page size for `list` when the caller does not pass one.
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    /// Upper bound for `limit` and `page_size`.
    #[serde(default)]
    pub max_limit: Option<usize>,

    /// Handling of undeclared properties.
    #[serde(default)]
    pub strictness: Strictness,

    /// Whether the root schema coerces values to their declared type.
    #[serde(default = "default_true")]
    pub convert: bool,

    /// Optional bound on populate recursion. Unbounded when unset.
    #[serde(default)]
    pub populate_max_depth: Option<usize>,

    /// Event type used for change notifications.
    #[serde(default = "default_entity_changed_event_type")]
    pub entity_changed_event_type: String,
}

fn default_primary_key_name() -> String {
    DEFAULT_PRIMARY_KEY.to_string()
}

fn default_primary_key_column() -> String {
    DEFAULT_PRIMARY_KEY_COLUMN.to_string()
}

fn default_page_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_entity_changed_event_type() -> String {
    DEFAULT_ENTITY_CHANGED_EVENT.to_string()
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            primary_key_name: default_primary_key_name(),
            primary_key_column: default_primary_key_column(),
            default_scopes: Vec::new(),
            default_populates: Vec::new(),
            default_page_size: default_page_size(),
            max_limit: None,
            strictness: Strictness::default(),
            convert: true,
            populate_max_depth: None,
            entity_changed_event_type: default_entity_changed_event_type(),
        }
    }
}

impl ServiceSettings {
    /// Creates default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default scopes.
    pub fn with_default_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the default populated fields.
    pub fn with_default_populates<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_populates = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the default page size.
    pub fn with_default_page_size(mut self, size: usize) -> Self {
        self.default_page_size = size;
        self
    }

    /// Sets the maximum limit.
    pub fn with_max_limit(mut self, max: usize) -> Self {
        self.max_limit = Some(max);
        self
    }

    /// Sets the strictness for undeclared properties.
    pub fn with_strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    /// Enables or disables type conversion.
    pub fn with_convert(mut self, convert: bool) -> Self {
        self.convert = convert;
        self
    }

    /// Bounds populate recursion.
    pub fn with_populate_max_depth(mut self, depth: usize) -> Self {
        self.populate_max_depth = Some(depth);
        self
    }

    /// Sets the primary key synthesized when none is declared.
    pub fn with_primary_key(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.primary_key_name = name.into();
        self.primary_key_column = column.into();
        self
    }

    /// Returns the field compiler options.
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            primary_key_name: self.primary_key_name.clone(),
            primary_key_column: self.primary_key_column.clone(),
        }
    }

    /// Validates the settings and returns every error found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.primary_key_name.is_empty() {
            errors.push("Primary key name cannot be empty".to_string());
        }

        if self.primary_key_column.is_empty() {
            errors.push("Primary key column cannot be empty".to_string());
        }

        if self.default_page_size == 0 {
            errors.push("Default page size cannot be 0".to_string());
        }

        if let Some(max) = self.max_limit {
            if max == 0 {
                errors.push("Max limit cannot be 0".to_string());
            } else if self.default_page_size > max {
                errors.push("Default page size cannot exceed max limit".to_string());
            }
        }

        if self.populate_max_depth == Some(0) {
            errors.push("Populate max depth cannot be 0".to_string());
        }

        if self.entity_changed_event_type.is_empty() {
            errors.push("Entity changed event type cannot be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Settings of the adapter pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum number of pooled adapters. Unbounded when unset.
    #[serde(default)]
    pub max_pool_size: Option<usize>,

    /// Retry failed connects forever instead of failing the caller.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Delay between connect attempts.
    #[serde(with = "humantime_serde", default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_pool_size: None,
            auto_reconnect: true,
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl PoolSettings {
    /// Creates default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the pool.
    pub fn with_max_pool_size(mut self, max: usize) -> Self {
        self.max_pool_size = Some(max);
        self
    }

    /// Enables or disables reconnect retries.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Sets the delay between connect attempts.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Validates the settings and returns every error found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_pool_size == Some(0) {
            errors.push("Max pool size must be at least 1".to_string());
        }

        if self.auto_reconnect && self.reconnect_delay.is_zero() {
            errors.push("Reconnect delay cannot be 0 when auto reconnect is enabled".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Converts a `validate()` result into a configuration error.
pub(crate) fn check(result: Result<(), Vec<String>>) -> Result<(), ConfigurationError> {
    result.map_err(|errors| ConfigurationError::InvalidSettings { errors })
}

/// Serde module for Duration with humantime format.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
