//! Error types for the entity layer.
//!
//! Errors are grouped by where they originate: caller input (validation and
//! lookup errors), backend adapters, static configuration, and user-supplied
//! hooks. Only the first group is meant to reach a client as structured
//! detail; see [`EntityError::is_client_error`].

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The primary error type for all entity operations.
#[derive(Error, Debug)]
pub enum EntityError {
    /// Caller input failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Entity lookup errors
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Backend adapter errors
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Invalid static configuration
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// A user-supplied hook failed
    #[error(transparent)]
    Hook(#[from] HookError),
}

impl EntityError {
    /// Returns `true` if this error should be surfaced to the caller as a
    /// structured client error carrying field or id detail.
    ///
    /// Everything else is an opaque server-side failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EntityError::Validation(_)
                | EntityError::Resource(ResourceError::NotFound { .. })
                | EntityError::Resource(ResourceError::MissingId { .. })
                | EntityError::Resource(ResourceError::InvalidId { .. })
        )
    }

    /// Shortcut for a hook failure on the given field.
    pub fn hook(field: impl Into<String>, message: impl Into<String>) -> Self {
        EntityError::Hook(HookError {
            field: field.into(),
            message: message.into(),
        })
    }

    /// Returns the validation error, if this is one.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            EntityError::Validation(err) => Some(err),
            _ => None,
        }
    }
}

/// Kind of a single validation violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationKind {
    /// A required value is missing or null.
    Required,
    /// The value has the wrong type and could not be converted.
    Type,
    /// The value is below the minimum (length, items or magnitude).
    Min,
    /// The value is above the maximum (length, items or magnitude).
    Max,
    /// The value is not one of the allowed values.
    Enum,
    /// The value does not match the declared pattern or format.
    Pattern,
    /// The property is not declared and the schema is strict.
    UnknownProperty,
    /// A custom validator rejected the value.
    Custom,
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationKind::Required => "required",
            ValidationKind::Type => "type",
            ValidationKind::Min => "min",
            ValidationKind::Max => "max",
            ValidationKind::Enum => "enum",
            ValidationKind::Pattern => "pattern",
            ValidationKind::UnknownProperty => "unknown-property",
            ValidationKind::Custom => "custom",
        };
        write!(f, "{}", name)
    }
}

/// One violation found while validating an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationDetail {
    /// Dotted path of the offending field.
    pub field: String,
    /// What kind of rule failed.
    pub kind: ValidationKind,
    /// A human-readable error message.
    pub message: String,
    /// The offending value, if there was one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
}

impl ValidationDetail {
    /// Creates a detail without an offending value.
    pub fn new(field: impl Into<String>, kind: ValidationKind, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind,
            message: message.into(),
            actual: None,
        }
    }

    /// Attaches the offending value.
    pub fn with_actual(mut self, actual: Value) -> Self {
        self.actual = Some(actual);
        self
    }

    /// Shortcut for a missing required field.
    pub fn required(field: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("the '{}' field is required", field);
        Self::new(field, ValidationKind::Required, message)
    }
}

/// Input validation failure.
///
/// Root schema checks aggregate every violation into one error; custom
/// validators and the per-field required check fail with a single detail.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    pub details: Vec<ValidationDetail>,
}

impl ValidationError {
    /// Builds an aggregated error from every collected violation.
    pub fn aggregate(details: Vec<ValidationDetail>) -> Self {
        let fields: Vec<&str> = details.iter().map(|d| d.field.as_str()).collect();
        Self {
            message: format!("parameters validation error on: {}", fields.join(", ")),
            details,
        }
    }

    /// Builds an error carrying a single violation.
    pub fn single(detail: ValidationDetail) -> Self {
        Self {
            message: detail.message.clone(),
            details: vec![detail],
        }
    }

    /// Shortcut for a custom validator rejection.
    pub fn custom(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::single(ValidationDetail::new(field, ValidationKind::Custom, message))
    }

    /// Returns `true` if a detail with the given field and kind is present.
    pub fn has(&self, field: &str, kind: ValidationKind) -> bool {
        self.details
            .iter()
            .any(|d| d.field == field && d.kind == kind)
    }

    /// Returns the offending field paths.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.details.iter().map(|d| d.field.as_str())
    }
}

/// Errors related to entity lookup.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// A strict resolve found no match; carries the requested ids.
    #[error("entity not found: {entity} {}", format_ids(.ids))]
    NotFound { entity: String, ids: Vec<Value> },

    /// The id was absent from a mutate or resolve request.
    #[error("missing id for {entity}")]
    MissingId { entity: String },

    /// A caller-supplied secure id could not be decoded.
    #[error("invalid id '{id}'")]
    InvalidId { id: String },
}

fn format_ids(ids: &[Value]) -> String {
    ids.iter()
        .map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors originating from a backend adapter.
#[derive(Error, Debug)]
pub enum BackendError {
    /// `connect()` failed.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// The adapter has been disconnected and cannot serve requests.
    #[error("backend {backend_name} is not connected")]
    NotConnected { backend_name: String },

    /// Write acknowledgement failure from an insert.
    #[error("write failed in {backend_name}: {message}")]
    WriteFailed {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The requested capability is not supported by this adapter.
    #[error("capability '{capability}' not supported by {backend_name}")]
    UnsupportedCapability {
        backend_name: String,
        capability: String,
    },

    /// Internal adapter error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query could not be understood by the adapter.
    #[error("query execution failed: {message}")]
    QueryError { message: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

/// Invalid declarations or settings. Fatal at compile/start time.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// A populate rule is neither a resolver nor a lookup descriptor.
    #[error("invalid populate rule on field '{field}': {message}")]
    InvalidPopulate { field: String, message: String },

    /// A scope definition is unusable.
    #[error("invalid scope '{scope}': {message}")]
    InvalidScope { scope: String, message: String },

    /// A field declaration is unusable.
    #[error("invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    /// Two fields on the same level share a name.
    #[error("duplicate field '{field}'")]
    DuplicateField { field: String },

    /// More than one field claims to be the primary key.
    #[error("multiple primary keys declared: {first}, {second}")]
    MultiplePrimaryKeys { first: String, second: String },

    /// The adapter kind has no registered factory.
    #[error("unknown adapter kind '{kind}'")]
    UnknownAdapterKind { kind: String },

    /// Settings failed validation.
    #[error("invalid settings: {}", .errors.join("; "))]
    InvalidSettings { errors: Vec<String> },

    /// A lookup action names no registered service method.
    #[error("unknown lookup action '{action}'")]
    UnknownAction { action: String },

    /// Population recursed deeper than the configured guard.
    #[error("populate depth {depth} exceeded on field '{field}'")]
    PopulateDepthExceeded { field: String, depth: usize },
}

/// A user-supplied hook returned an error.
#[derive(Error, Debug)]
#[error("hook failed on field '{field}': {message}")]
pub struct HookError {
    pub field: String,
    pub message: String,
}

/// Result type alias for entity operations.
pub type EntityResult<T> = Result<T, EntityError>;

impl From<serde_json::Error> for EntityError {
    fn from(err: serde_json::Error) -> Self {
        EntityError::Backend(BackendError::SerializationError {
            message: err.to_string(),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for EntityError {
    fn from(err: rusqlite::Error) -> Self {
        EntityError::Backend(BackendError::Internal {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<r2d2::Error> for EntityError {
    fn from(err: r2d2::Error) -> Self {
        EntityError::Backend(BackendError::ConnectionFailed {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_not_found_display_lists_ids() {
        let err = EntityError::Resource(ResourceError::NotFound {
            entity: "posts".to_string(),
            ids: vec![json!("a1"), json!(7)],
        });
        assert_eq!(err.to_string(), "entity not found: posts a1, 7");
    }

    #[test]
    fn test_aggregate_message_names_every_field() {
        let err = ValidationError::aggregate(vec![
            ValidationDetail::required("title"),
            ValidationDetail::new("votes", ValidationKind::Type, "must be a number"),
        ]);
        assert!(err.message.contains("title"));
        assert!(err.message.contains("votes"));
        assert!(err.has("title", ValidationKind::Required));
        assert!(!err.has("votes", ValidationKind::Required));
    }

    #[test]
    fn test_client_error_classification() {
        let validation: EntityError = ValidationError::custom("name", "bad").into();
        assert!(validation.is_client_error());

        let missing: EntityError = ResourceError::MissingId {
            entity: "posts".to_string(),
        }
        .into();
        assert!(missing.is_client_error());

        let backend: EntityError = BackendError::QueryError {
            message: "boom".to_string(),
        }
        .into();
        assert!(!backend.is_client_error());

        let config: EntityError = ConfigurationError::UnknownAdapterKind {
            kind: "redis".to_string(),
        }
        .into();
        assert!(!config.is_client_error());
    }

    #[test]
    fn test_validation_kind_display() {
        assert_eq!(ValidationKind::Required.to_string(), "required");
        assert_eq!(ValidationKind::UnknownProperty.to_string(), "unknown-property");
    }

    #[test]
    fn test_serde_error_becomes_backend_error() {
        let err: EntityError = serde_json::from_str::<Value>("{").unwrap_err().into();
        assert!(matches!(
            err,
            EntityError::Backend(BackendError::SerializationError { .. })
        ));
    }
}
