//! Per-operation validator schemas.
//!
//! A [`ValidatorSchema`] is the root-level shape check run before the
//! per-field pipeline. It converts loosely typed input (when conversion is
//! enabled), enforces constraints, strips or rejects undeclared properties
//! and collects every violation before failing once.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::error::{ConfigurationError, ValidationDetail, ValidationError, ValidationKind};

use super::descriptor::FieldDescriptor;
use super::types::{Constraints, FieldType, KeyGeneration, Operation, Strictness};

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex")
});

static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://[^\s/?#]+[^\s]*$").expect("url regex")
});

/// Whether a property must be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
}

/// The rule for one declared property.
#[derive(Debug, Clone)]
pub struct PropertyRule {
    /// Field name.
    pub name: String,
    pub field_type: FieldType,
    pub presence: Presence,
    pub nullable: bool,
    /// Literal default filled in when the property is absent.
    pub default: Option<Value>,
    pub constraints: Constraints,
    pattern: Option<Regex>,
    /// Rules of an object field's children.
    pub properties: Option<ObjectSchema>,
    /// Rule applied to each array item.
    pub items: Option<Box<PropertyRule>>,
}

/// The rules of one object level.
#[derive(Debug, Clone)]
pub struct ObjectSchema {
    /// Declared properties checked at this level.
    pub rules: Vec<PropertyRule>,
    /// Declared but unchecked properties (readonly, virtual, backend keys),
    /// copied through unchanged instead of being treated as unknown.
    pub passthrough: HashSet<String>,
    /// Handling of undeclared properties.
    pub strictness: Strictness,
}

/// Root validator schema for one operation.
#[derive(Debug, Clone)]
pub struct ValidatorSchema {
    operation: Operation,
    convert: bool,
    root: ObjectSchema,
}

/// Generates the validator schema for an operation.
///
/// - create: a field is required if declared so and its value is not
///   derivable (no `set` hook, lifecycle hook or default). Readonly and
///   virtual fields are left out; so is a backend-generated primary key,
///   while a user-generated one is required. Literal defaults are
///   attached.
/// - update: every field is optional except the primary key. No defaults.
/// - replace: as create, with the primary key always required.
/// - remove: as update.
///
/// Object and array fields recurse with the same rules, each level applying
/// `strictness` on its own.
pub fn generate_validator_schema(
    fields: &[FieldDescriptor],
    operation: Operation,
    strictness: Strictness,
    convert: bool,
) -> Result<ValidatorSchema, ConfigurationError> {
    Ok(ValidatorSchema {
        operation,
        convert,
        root: object_schema(fields, operation, strictness)?,
    })
}

fn object_schema(
    fields: &[FieldDescriptor],
    operation: Operation,
    strictness: Strictness,
) -> Result<ObjectSchema, ConfigurationError> {
    let mut rules = Vec::new();
    let mut passthrough = HashSet::new();

    for field in fields {
        let excluded = match operation {
            Operation::Create => {
                field.virtual_field
                    || (field.primary_key && field.generated == KeyGeneration::Backend)
                    || (!field.primary_key && field.readonly)
            }
            Operation::Replace => field.virtual_field || (!field.primary_key && field.readonly),
            Operation::Update | Operation::Remove => {
                field.virtual_field || (!field.primary_key && field.readonly)
            }
        };
        if excluded {
            passthrough.insert(field.name.clone());
            continue;
        }
        rules.push(property_rule(field, operation, strictness)?);
    }

    Ok(ObjectSchema {
        rules,
        passthrough,
        strictness,
    })
}

fn property_rule(
    field: &FieldDescriptor,
    operation: Operation,
    strictness: Strictness,
) -> Result<PropertyRule, ConfigurationError> {
    let derivable = field.set.is_some() || field.has_lifecycle_hook() || field.default.is_some();
    let presence = if field.primary_key {
        // Excluded above when the backend generates it on create.
        Presence::Required
    } else if operation.is_full_write() && field.required && !derivable {
        Presence::Required
    } else {
        Presence::Optional
    };

    let default = if operation.is_full_write() {
        field
            .default
            .as_ref()
            .and_then(|d| d.literal())
            .cloned()
    } else {
        None
    };

    let pattern = field
        .constraints
        .pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| ConfigurationError::InvalidField {
            field: field.name.clone(),
            message: format!("invalid pattern: {}", e),
        })?;

    let properties = match &field.properties {
        Some(children) => Some(object_schema(children, operation, strictness)?),
        None => None,
    };
    let items = match &field.items {
        Some(item) => Some(Box::new(property_rule(item, operation, strictness)?)),
        None => None,
    };

    Ok(PropertyRule {
        name: field.name.clone(),
        field_type: field.field_type,
        presence,
        nullable: field.nullable,
        default,
        constraints: field.constraints.clone(),
        pattern,
        properties,
        items,
    })
}

impl ValidatorSchema {
    /// Returns the operation this schema validates.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Returns the root level.
    pub fn root(&self) -> &ObjectSchema {
        &self.root
    }

    /// Returns the root rule of a field, or `None` if the field is not
    /// checked for this operation.
    pub fn rule(&self, name: &str) -> Option<&PropertyRule> {
        self.root.rules.iter().find(|r| r.name == name)
    }

    /// Checks and normalizes an input payload.
    ///
    /// Returns the converted payload, or one error listing every violation.
    pub fn check(&self, input: &Map<String, Value>) -> Result<Map<String, Value>, ValidationError> {
        let mut details = Vec::new();
        let output = self.root.check(input, "", self.convert, &mut details);
        if details.is_empty() {
            Ok(output)
        } else {
            Err(ValidationError::aggregate(details))
        }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

impl ObjectSchema {
    fn check(
        &self,
        input: &Map<String, Value>,
        prefix: &str,
        convert: bool,
        details: &mut Vec<ValidationDetail>,
    ) -> Map<String, Value> {
        let mut output = Map::new();

        for rule in &self.rules {
            let path = join_path(prefix, &rule.name);
            match input.get(&rule.name) {
                None => {
                    if let Some(default) = &rule.default {
                        output.insert(rule.name.clone(), default.clone());
                    } else if rule.presence == Presence::Required {
                        details.push(ValidationDetail::required(path));
                    }
                }
                Some(Value::Null) => {
                    if rule.presence == Presence::Required && !rule.nullable {
                        details.push(ValidationDetail::required(path));
                    } else {
                        output.insert(rule.name.clone(), Value::Null);
                    }
                }
                Some(value) => {
                    if let Some(value) = rule.check(value, &path, convert, details) {
                        output.insert(rule.name.clone(), value);
                    }
                }
            }
        }

        for (key, value) in input {
            if self.rules.iter().any(|r| &r.name == key) {
                continue;
            }
            if self.passthrough.contains(key) {
                output.insert(key.clone(), value.clone());
                continue;
            }
            match self.strictness {
                Strictness::Remove => {}
                Strictness::Allow => {
                    output.insert(key.clone(), value.clone());
                }
                Strictness::Error => {
                    let path = join_path(prefix, key);
                    details.push(
                        ValidationDetail::new(
                            path.clone(),
                            ValidationKind::UnknownProperty,
                            format!("the '{}' property is not allowed", path),
                        )
                        .with_actual(value.clone()),
                    );
                }
            }
        }

        output
    }
}

impl PropertyRule {
    fn check(
        &self,
        value: &Value,
        path: &str,
        convert: bool,
        details: &mut Vec<ValidationDetail>,
    ) -> Option<Value> {
        let converted = match coerce(self.field_type, value, convert) {
            Ok(v) => v,
            Err((kind, message)) => {
                details.push(
                    ValidationDetail::new(path, kind, format!("the '{}' field {}", path, message))
                        .with_actual(value.clone()),
                );
                return None;
            }
        };

        let before = details.len();
        self.check_constraints(&converted, path, details);
        if details.len() > before {
            return None;
        }

        match (&converted, &self.properties, &self.items) {
            (Value::Object(map), Some(schema), _) => {
                Some(Value::Object(schema.check(map, path, convert, details)))
            }
            (Value::Array(items), _, Some(item_rule)) => {
                let mut out = Vec::with_capacity(items.len());
                for (idx, item) in items.iter().enumerate() {
                    let item_path = format!("{}[{}]", path, idx);
                    if item.is_null() {
                        if item_rule.nullable || item_rule.field_type == FieldType::Any {
                            out.push(Value::Null);
                        } else {
                            details.push(ValidationDetail::required(item_path));
                        }
                        continue;
                    }
                    if let Some(v) = item_rule.check(item, &item_path, convert, details) {
                        out.push(v);
                    }
                }
                Some(Value::Array(out))
            }
            _ => Some(converted),
        }
    }

    fn check_constraints(&self, value: &Value, path: &str, details: &mut Vec<ValidationDetail>) {
        let c = &self.constraints;
        let (size, unit) = match value {
            Value::String(s) => (Some(s.chars().count() as f64), "characters"),
            Value::Array(a) => (Some(a.len() as f64), "items"),
            Value::Number(n) => (n.as_f64(), ""),
            _ => (None, ""),
        };

        if let Some(size) = size {
            if let Some(min) = c.min.filter(|min| size < *min) {
                details.push(
                    ValidationDetail::new(
                        path,
                        ValidationKind::Min,
                        format!("the '{}' field must be at least {} {}", path, min, unit).trim_end().to_string(),
                    )
                    .with_actual(value.clone()),
                );
            }
            if let Some(max) = c.max.filter(|max| size > *max) {
                details.push(
                    ValidationDetail::new(
                        path,
                        ValidationKind::Max,
                        format!("the '{}' field must be at most {} {}", path, max, unit).trim_end().to_string(),
                    )
                    .with_actual(value.clone()),
                );
            }
        }

        if let Some(values) = &c.values {
            if !values.contains(value) {
                details.push(
                    ValidationDetail::new(
                        path,
                        ValidationKind::Enum,
                        format!("the '{}' field must be one of the allowed values", path),
                    )
                    .with_actual(value.clone()),
                );
            }
        }

        if let (Some(pattern), Value::String(s)) = (&self.pattern, value) {
            if !pattern.is_match(s) {
                details.push(
                    ValidationDetail::new(
                        path,
                        ValidationKind::Pattern,
                        format!("the '{}' field does not match the required pattern", path),
                    )
                    .with_actual(value.clone()),
                );
            }
        }
    }
}

type Coerced = Result<Value, (ValidationKind, &'static str)>;

fn type_error(message: &'static str) -> Coerced {
    Err((ValidationKind::Type, message))
}

/// Converts a value to the declared type, or explains why it cannot.
fn coerce(field_type: FieldType, value: &Value, convert: bool) -> Coerced {
    match field_type {
        FieldType::Any | FieldType::Enum => Ok(value.clone()),
        FieldType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) if convert => Ok(Value::String(n.to_string())),
            Value::Bool(b) if convert => Ok(Value::String(b.to_string())),
            _ => type_error("must be a string"),
        },
        FieldType::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) if convert => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(number)
                .map_or_else(|| type_error("must be a number"), Ok),
            Value::Bool(b) if convert => Ok(Value::from(u8::from(*b))),
            _ => type_error("must be a number"),
        },
        FieldType::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) if convert => n
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| Value::from(f as i64))
                .map_or_else(|| type_error("must be an integer"), Ok),
            Value::String(s) if convert => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_or_else(|_| type_error("must be an integer"), Ok),
            _ => type_error("must be an integer"),
        },
        FieldType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) if convert => match s.trim() {
                "true" | "1" | "on" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "off" | "no" => Ok(Value::Bool(false)),
                _ => type_error("must be a boolean"),
            },
            Value::Number(n) if convert => match n.as_f64() {
                Some(f) if f == 1.0 => Ok(Value::Bool(true)),
                Some(f) if f == 0.0 => Ok(Value::Bool(false)),
                _ => type_error("must be a boolean"),
            },
            _ => type_error("must be a boolean"),
        },
        FieldType::Date => match value {
            Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(dt) if convert => Ok(Value::String(
                    dt.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true),
                )),
                Ok(_) => Ok(value.clone()),
                Err(_) => type_error("must be an RFC 3339 date"),
            },
            Value::Number(n) if convert => n
                .as_i64()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)))
                .map_or_else(|| type_error("must be a date"), Ok),
            _ => type_error("must be a date"),
        },
        FieldType::Email => match value {
            Value::String(s) if EMAIL.is_match(s) => Ok(value.clone()),
            Value::String(_) => Err((ValidationKind::Pattern, "must be a valid email address")),
            _ => type_error("must be an email string"),
        },
        FieldType::Url => match value {
            Value::String(s) if URL.is_match(s) => Ok(value.clone()),
            Value::String(_) => Err((ValidationKind::Pattern, "must be a valid URL")),
            _ => type_error("must be a URL string"),
        },
        FieldType::Uuid => match value {
            Value::String(s) => match uuid::Uuid::parse_str(s) {
                Ok(id) if convert => Ok(Value::String(id.hyphenated().to_string())),
                Ok(_) => Ok(value.clone()),
                Err(_) => Err((ValidationKind::Pattern, "must be a valid UUID")),
            },
            _ => type_error("must be a UUID string"),
        },
        FieldType::Object => match value {
            Value::Object(_) => Ok(value.clone()),
            Value::String(s) if convert => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => Ok(parsed),
                _ => type_error("must be an object"),
            },
            _ => type_error("must be an object"),
        },
        FieldType::Array => match value {
            Value::Array(_) => Ok(value.clone()),
            Value::String(s) if convert && s.trim_start().starts_with('[') => {
                match serde_json::from_str::<Value>(s) {
                    Ok(parsed @ Value::Array(_)) => Ok(parsed),
                    _ => type_error("must be an array"),
                }
            }
            other if convert => Ok(Value::Array(vec![other.clone()])),
            _ => type_error("must be an array"),
        },
    }
}

fn number(f: f64) -> Option<Value> {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(Value::from(f as i64))
    } else {
        Number::from_f64(f).map(Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::field::{Declarations, FieldSpec, compile};

    fn schema(decls: Declarations, op: Operation) -> ValidatorSchema {
        compile(&decls)
            .unwrap()
            .schema(op, Strictness::Remove, true)
            .unwrap()
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_create_requires_declared_fields() {
        let s = schema(Declarations::new().field("title", "string|required"), Operation::Create);
        let err = s.check(&Map::new()).unwrap_err();
        assert!(err.has("title", ValidationKind::Required));
    }

    #[test]
    fn test_update_makes_fields_optional() {
        let s = schema(Declarations::new().field("title", "string|required"), Operation::Update);
        assert_eq!(s.rule("title").unwrap().presence, Presence::Optional);
        assert_eq!(s.rule("id").unwrap().presence, Presence::Required);
    }

    #[test]
    fn test_primary_key_presence_is_exclusive() {
        let backend = schema(Declarations::new().field("title", "string"), Operation::Create);
        assert!(backend.rule("id").is_none());

        let user = schema(
            Declarations::new().field("code", FieldSpec::new(FieldType::String).primary_key().user_generated()),
            Operation::Create,
        );
        assert_eq!(user.rule("code").unwrap().presence, Presence::Required);

        let replace = schema(Declarations::new().field("title", "string"), Operation::Replace);
        assert_eq!(replace.rule("id").unwrap().presence, Presence::Required);
    }

    #[test]
    fn test_derivable_fields_are_optional_on_create() {
        let s = schema(
            Declarations::new()
                .field("status", FieldSpec::new(FieldType::String).required().default_value(json!("draft")))
                .field("slug", FieldSpec::new(FieldType::String).required().set(crate::field::Hook::sync(|_| Ok(json!("s"))))),
            Operation::Create,
        );
        assert_eq!(s.rule("status").unwrap().presence, Presence::Optional);
        assert_eq!(s.rule("status").unwrap().default, Some(json!("draft")));
        assert_eq!(s.rule("slug").unwrap().presence, Presence::Optional);

        let out = s.check(&Map::new()).unwrap();
        assert_eq!(out["status"], json!("draft"));
    }

    #[test]
    fn test_update_never_attaches_defaults() {
        let s = schema(
            Declarations::new().field("status", FieldSpec::new(FieldType::String).default_value(json!("draft"))),
            Operation::Update,
        );
        assert!(s.rule("status").unwrap().default.is_none());
        let out = s.check(&obj(json!({"id": "a"}))).unwrap();
        assert!(!out.contains_key("status"));
    }

    #[test]
    fn test_readonly_and_virtual_pass_through() {
        let s = schema(
            Declarations::new()
                .field("createdAt", "date|readonly")
                .field("fullName", "string|virtual"),
            Operation::Create,
        );
        assert!(s.rule("createdAt").is_none());
        let out = s
            .check(&obj(json!({"createdAt": "x", "fullName": "y", "junk": 1})))
            .unwrap();
        assert_eq!(out.get("createdAt"), Some(&json!("x")));
        assert!(!out.contains_key("junk"));
    }

    #[test]
    fn test_aggregates_every_violation() {
        let s = schema(
            Declarations::new()
                .field("title", "string|required|min:3")
                .field("votes", "integer|min:0")
                .field("email", "email"),
            Operation::Create,
        );
        let err = s
            .check(&obj(json!({"title": "ab", "votes": -1, "email": "nope"})))
            .unwrap_err();
        assert!(err.has("title", ValidationKind::Min));
        assert!(err.has("votes", ValidationKind::Min));
        assert!(err.has("email", ValidationKind::Pattern));
        assert_eq!(err.details.len(), 3);
    }

    #[test]
    fn test_conversion() {
        let s = schema(
            Declarations::new()
                .field("votes", "number")
                .field("count", "integer")
                .field("active", "boolean")
                .field("label", "string")
                .field("tags", "array")
                .field("meta", "object"),
            Operation::Create,
        );
        let out = s
            .check(&obj(json!({
                "votes": "2.5",
                "count": "7",
                "active": "true",
                "label": 12,
                "tags": "solo",
                "meta": "{\"a\":1}"
            })))
            .unwrap();
        assert_eq!(out["votes"], json!(2.5));
        assert_eq!(out["count"], json!(7));
        assert_eq!(out["active"], json!(true));
        assert_eq!(out["label"], json!("12"));
        assert_eq!(out["tags"], json!(["solo"]));
        assert_eq!(out["meta"], json!({"a": 1}));
    }

    #[test]
    fn test_no_conversion_rejects_loose_types() {
        let s = compile(&Declarations::new().field("votes", "number"))
            .unwrap()
            .schema(Operation::Create, Strictness::Remove, false)
            .unwrap();
        let err = s.check(&obj(json!({"votes": "2"}))).unwrap_err();
        assert!(err.has("votes", ValidationKind::Type));
    }

    #[test]
    fn test_date_normalization() {
        let s = schema(Declarations::new().field("at", "date"), Operation::Create);
        let out = s.check(&obj(json!({"at": 0}))).unwrap();
        assert_eq!(out["at"], json!("1970-01-01T00:00:00.000Z"));
        let err = s.check(&obj(json!({"at": "yesterday"}))).unwrap_err();
        assert!(err.has("at", ValidationKind::Type));
    }

    #[test]
    fn test_enum_and_pattern() {
        let s = schema(
            Declarations::new()
                .field("status", "enum|values:draft,published")
                .field("code", "string|pattern:^[A-Z]{3}$"),
            Operation::Create,
        );
        let err = s
            .check(&obj(json!({"status": "gone", "code": "abc"})))
            .unwrap_err();
        assert!(err.has("status", ValidationKind::Enum));
        assert!(err.has("code", ValidationKind::Pattern));
    }

    #[test]
    fn test_strict_error_rejects_unknown() {
        let s = compile(&Declarations::new().field("title", "string"))
            .unwrap()
            .schema(Operation::Create, Strictness::Error, true)
            .unwrap();
        let err = s.check(&obj(json!({"title": "a", "extra": 1}))).unwrap_err();
        assert!(err.has("extra", ValidationKind::UnknownProperty));
    }

    #[test]
    fn test_nested_paths() {
        let s = schema(
            Declarations::new()
                .field(
                    "address",
                    FieldSpec::new(FieldType::Object)
                        .property("city", "string|required")
                        .property("zip", "string|max:5"),
                )
                .field("scores", FieldSpec::new(FieldType::Array).items("integer|max:10")),
            Operation::Create,
        );
        let err = s
            .check(&obj(json!({
                "address": {"zip": "123456", "junk": true},
                "scores": [1, 11]
            })))
            .unwrap_err();
        assert!(err.has("address.city", ValidationKind::Required));
        assert!(err.has("address.zip", ValidationKind::Max));
        assert!(err.has("scores[1]", ValidationKind::Max));

        let out = s
            .check(&obj(json!({"address": {"city": "Oslo", "junk": true}, "scores": ["3"]})))
            .unwrap();
        assert_eq!(out["address"], json!({"city": "Oslo"}));
        assert_eq!(out["scores"], json!([3]));
    }

    #[test]
    fn test_null_handling() {
        let s = schema(
            Declarations::new()
                .field("a", "string|required")
                .field("b", "string|required|nullable")
                .field("c", "string"),
            Operation::Create,
        );
        let err = s
            .check(&obj(json!({"a": null, "b": null, "c": null})))
            .unwrap_err();
        assert!(err.has("a", ValidationKind::Required));
        assert_eq!(err.details.len(), 1);
    }
}
