//! Primitive vocabulary of field declarations.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Semantic type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Any JSON value; never type-checked.
    #[default]
    Any,
    String,
    Number,
    Integer,
    Boolean,
    /// RFC 3339 string or epoch milliseconds.
    Date,
    Email,
    Url,
    Uuid,
    /// One of the declared `values`.
    Enum,
    Object,
    Array,
}

impl FieldType {
    /// Parses a type name as used in shorthand declarations.
    pub fn parse(name: &str) -> Option<Self> {
        let ty = match name {
            "any" => FieldType::Any,
            "string" => FieldType::String,
            "number" => FieldType::Number,
            "integer" | "int" => FieldType::Integer,
            "boolean" | "bool" => FieldType::Boolean,
            "date" => FieldType::Date,
            "email" => FieldType::Email,
            "url" => FieldType::Url,
            "uuid" => FieldType::Uuid,
            "enum" => FieldType::Enum,
            "object" => FieldType::Object,
            "array" => FieldType::Array,
            _ => return None,
        };
        Some(ty)
    }

    /// Returns `true` for object and array fields, which need string
    /// encoding on backends without native structured-value support.
    pub fn is_structured(&self) -> bool {
        matches!(self, FieldType::Object | FieldType::Array)
    }

    /// Returns the shorthand name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Any => "any",
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Email => "email",
            FieldType::Url => "url",
            FieldType::Uuid => "uuid",
            FieldType::Enum => "enum",
            FieldType::Object => "object",
            FieldType::Array => "array",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Read-path visibility of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Hidden {
    /// Always returned (subject to read permission).
    #[default]
    Never,
    /// Never returned.
    Always,
    /// Returned only when the caller's explicit `fields` list names it.
    UnlessRequested,
}

/// Who generates primary key values on create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyGeneration {
    /// The backend assigns ids; callers cannot supply one on create.
    #[default]
    Backend,
    /// Callers must supply the id on create.
    User,
}

/// The write operation a payload is being validated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Replace,
    Remove,
}

impl Operation {
    /// Returns `true` for create and replace, where required fields and
    /// defaults apply.
    pub fn is_full_write(&self) -> bool {
        matches!(self, Operation::Create | Operation::Replace)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Replace => write!(f, "replace"),
            Operation::Remove => write!(f, "remove"),
        }
    }
}

/// What the root schema does with properties nobody declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Strip them silently.
    #[default]
    Remove,
    /// Reject the payload.
    Error,
    /// Keep them.
    Allow,
}

/// Value constraints checked by the root schema.
///
/// `min`/`max` apply to string length, array length or numeric magnitude
/// depending on the field type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
}

impl Constraints {
    /// Returns `true` if no constraint is set.
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none() && self.pattern.is_none() && self.values.is_none()
    }
}
