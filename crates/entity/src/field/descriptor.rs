//! Compiled field metadata.

use serde_json::{Map, Value};

use crate::error::ConfigurationError;
use crate::tenant::OperationContext;

use super::hook::{Hook, Resolvable};
use super::types::{Constraints, FieldType, Hidden, KeyGeneration, Operation};

/// Compiled metadata for one entity attribute.
///
/// Descriptors are produced by [`compile`](super::compile) once at service
/// start and never change afterwards. Nested object and array fields carry
/// their own child descriptors.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    /// Name used by callers.
    pub name: String,
    /// Name used by the backend. Defaults to `name`.
    pub column_name: String,
    /// Semantic type.
    pub field_type: FieldType,
    /// Enforced on create and replace only.
    pub required: bool,
    /// Whether an explicit `null` passes the required check.
    pub nullable: bool,
    /// Callers cannot write this field outside permissive mode.
    pub readonly: bool,
    /// Once set, the stored value cannot change.
    pub immutable: bool,
    /// Read-path visibility.
    pub hidden: Hidden,
    /// Whether this is the primary key.
    pub primary_key: bool,
    /// Who generates primary key values. Only meaningful on the primary key.
    pub generated: KeyGeneration,
    /// Whether the stored id is re-encoded on the way out.
    pub secure: bool,
    /// Output-only field, never written.
    pub virtual_field: bool,
    /// Capability tags required to write the field.
    pub permission: Option<Vec<String>>,
    /// Capability tags required to read the field. Falls back to
    /// `permission` when unset.
    pub read_permission: Option<Vec<String>>,
    /// Value used on create/replace when the caller supplied none.
    pub default: Option<Resolvable>,
    /// Write-path transformer.
    pub set: Option<Hook>,
    /// Read-path transformer.
    pub get: Option<Hook>,
    /// Custom validator; an error aborts the whole operation.
    pub validate: Option<Hook<()>>,
    pub on_create: Option<Resolvable>,
    pub on_update: Option<Resolvable>,
    pub on_replace: Option<Resolvable>,
    /// Presence of any `on_remove` hook turns removal into a soft delete.
    pub on_remove: Option<Resolvable>,
    /// Cross-entity population rule.
    pub populate: Option<PopulateRule>,
    /// Child descriptors of an object field.
    pub properties: Option<Vec<FieldDescriptor>>,
    /// Item descriptor of an array field.
    pub items: Option<Box<FieldDescriptor>>,
    /// Root schema constraints.
    pub constraints: Constraints,
}

impl FieldDescriptor {
    /// Creates a descriptor with every option off.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        Self {
            column_name: name.clone(),
            name,
            field_type,
            required: false,
            nullable: false,
            readonly: false,
            immutable: false,
            hidden: Hidden::Never,
            primary_key: false,
            generated: KeyGeneration::Backend,
            secure: false,
            virtual_field: false,
            permission: None,
            read_permission: None,
            default: None,
            set: None,
            get: None,
            validate: None,
            on_create: None,
            on_update: None,
            on_replace: None,
            on_remove: None,
            populate: None,
            properties: None,
            items: None,
            constraints: Constraints::default(),
        }
    }

    /// Returns the lifecycle hook matching the operation, if declared.
    pub fn lifecycle_hook(&self, operation: Operation) -> Option<&Resolvable> {
        match operation {
            Operation::Create => self.on_create.as_ref(),
            Operation::Update => self.on_update.as_ref(),
            Operation::Replace => self.on_replace.as_ref(),
            Operation::Remove => self.on_remove.as_ref(),
        }
    }

    /// Returns `true` if any lifecycle hook is declared.
    pub fn has_lifecycle_hook(&self) -> bool {
        self.on_create.is_some()
            || self.on_update.is_some()
            || self.on_replace.is_some()
            || self.on_remove.is_some()
    }

    /// Returns the tags gating reads.
    pub fn read_permissions(&self) -> Option<&[String]> {
        self.read_permission
            .as_deref()
            .or(self.permission.as_deref())
    }

    /// Returns `true` if the field declares any read or write permission.
    pub fn needs_authorization(&self) -> bool {
        self.permission.is_some() || self.read_permission.is_some()
    }

    /// Returns `true` for a primary key whose values the backend assigns.
    pub fn is_backend_key(&self) -> bool {
        self.primary_key && self.generated == KeyGeneration::Backend
    }
}

/// Arguments handed to a custom populate resolver.
#[derive(Debug, Clone)]
pub struct PopulateArgs {
    /// The field being populated.
    pub field: String,
    /// Distinct, non-null key values collected across all documents.
    pub keys: Vec<Value>,
    /// Field selection requested for the resolved values.
    pub fields: Option<Vec<String>>,
    /// Nested populate list requested for the resolved values.
    pub populate: Option<Vec<String>>,
    /// The caller context, one level deeper than the read.
    pub ctx: OperationContext,
}

/// Where populated values come from.
#[derive(Debug, Clone, PartialEq)]
pub enum PopulateSource {
    /// A custom async resolver returning a key → value map. Keys are the
    /// string form of the looked-up ids.
    Resolver(Hook<Map<String, Value>, PopulateArgs>),
    /// An id-keyed call through the service's lookup transport.
    Lookup(LookupRule),
}

/// An external lookup descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupRule {
    /// Target action, e.g. `users.resolve`.
    pub action: String,
    /// Extra parameters merged into every lookup call.
    pub params: Map<String, Value>,
}

/// Declaration that a field's stored id(s) should be replaced by looked-up
/// target data on read.
#[derive(Debug, Clone, PartialEq)]
pub struct PopulateRule {
    /// Resolver or lookup.
    pub source: PopulateSource,
    /// Alternate field holding the key, when not the field itself.
    pub key_field: Option<String>,
    /// Field selection for the resolved values.
    pub fields: Option<Vec<String>>,
    /// Nested populate list for the resolved values.
    pub populate: Option<Vec<String>>,
}

impl PopulateRule {
    /// Creates a rule backed by a lookup action.
    pub fn lookup(action: impl Into<String>) -> Self {
        Self::from_source(PopulateSource::Lookup(LookupRule {
            action: action.into(),
            params: Map::new(),
        }))
    }

    /// Creates a rule backed by a custom resolver.
    pub fn resolver(hook: Hook<Map<String, Value>, PopulateArgs>) -> Self {
        Self::from_source(PopulateSource::Resolver(hook))
    }

    fn from_source(source: PopulateSource) -> Self {
        Self {
            source,
            key_field: None,
            fields: None,
            populate: None,
        }
    }

    /// Reads the key from another field.
    pub fn with_key_field(mut self, key_field: impl Into<String>) -> Self {
        self.key_field = Some(key_field.into());
        self
    }

    /// Restricts the fields of the resolved values.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Requests nested population on the resolved values.
    pub fn with_populate<I, S>(mut self, populate: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.populate = Some(populate.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a lookup parameter. Ignored for resolver rules.
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        if let PopulateSource::Lookup(lookup) = &mut self.source {
            lookup.params.insert(key.into(), value);
        }
        self
    }

    /// Parses a JSON populate declaration.
    ///
    /// Accepts an action name (`"users.resolve"`) or an object with an
    /// `action` plus optional `params`, `fields`, `populate` and `field`
    /// (the alternate key field).
    pub fn from_json(field: &str, value: &Value) -> Result<Self, ConfigurationError> {
        let invalid = |message: &str| ConfigurationError::InvalidPopulate {
            field: field.to_string(),
            message: message.to_string(),
        };

        match value {
            Value::String(action) => {
                let rule = Self::lookup(action.as_str());
                rule.check(field)?;
                Ok(rule)
            }
            Value::Object(obj) => {
                let action = obj
                    .get("action")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("expected an 'action' string"))?;
                let mut rule = Self::lookup(action);
                if let Some(params) = obj.get("params") {
                    let params = params
                        .as_object()
                        .ok_or_else(|| invalid("'params' must be an object"))?;
                    if let PopulateSource::Lookup(lookup) = &mut rule.source {
                        lookup.params = params.clone();
                    }
                }
                rule.key_field = match obj.get("field") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(_) => return Err(invalid("'field' must be a string")),
                };
                rule.fields = string_list(obj.get("fields")).map_err(|m| invalid(m))?;
                rule.populate = string_list(obj.get("populate")).map_err(|m| invalid(m))?;
                rule.check(field)?;
                Ok(rule)
            }
            _ => Err(invalid(
                "expected a resolver or a lookup descriptor (action name or object)",
            )),
        }
    }

    /// Rejects unusable rules.
    pub(crate) fn check(&self, field: &str) -> Result<(), ConfigurationError> {
        if let PopulateSource::Lookup(lookup) = &self.source {
            if lookup.action.trim().is_empty() {
                return Err(ConfigurationError::InvalidPopulate {
                    field: field.to_string(),
                    message: "lookup action is empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn string_list(value: Option<&Value>) -> Result<Option<Vec<String>>, &'static str> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(
            s.split(|c: char| c == ',' || c.is_whitespace())
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        )),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or("list entries must be strings"))
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err("expected a string or a list of strings"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_new_defaults_column_to_name() {
        let field = FieldDescriptor::new("title", FieldType::String);
        assert_eq!(field.column_name, "title");
        assert!(!field.required);
        assert_eq!(field.hidden, Hidden::Never);
    }

    #[test]
    fn test_read_permission_falls_back_to_write() {
        let mut field = FieldDescriptor::new("salary", FieldType::Number);
        field.permission = Some(vec!["hr".to_string()]);
        assert_eq!(field.read_permissions(), Some(&["hr".to_string()][..]));

        field.read_permission = Some(vec!["staff".to_string()]);
        assert_eq!(field.read_permissions(), Some(&["staff".to_string()][..]));
    }

    #[test]
    fn test_populate_from_action_string() {
        let rule = PopulateRule::from_json("author", &json!("users.resolve")).unwrap();
        assert!(matches!(rule.source, PopulateSource::Lookup(ref l) if l.action == "users.resolve"));
    }

    #[test]
    fn test_populate_from_object() {
        let rule = PopulateRule::from_json(
            "author",
            &json!({
                "action": "users.resolve",
                "params": {"scope": false},
                "fields": "name email",
                "field": "authorId"
            }),
        )
        .unwrap();
        assert_eq!(rule.key_field.as_deref(), Some("authorId"));
        assert_eq!(
            rule.fields,
            Some(vec!["name".to_string(), "email".to_string()])
        );
        match rule.source {
            PopulateSource::Lookup(lookup) => assert_eq!(lookup.params["scope"], json!(false)),
            PopulateSource::Resolver(_) => panic!("expected lookup"),
        }
    }

    #[test]
    fn test_invalid_populate_declarations() {
        assert!(PopulateRule::from_json("author", &json!(42)).is_err());
        assert!(PopulateRule::from_json("author", &json!({"params": {}})).is_err());
        assert!(PopulateRule::from_json("author", &json!("  ")).is_err());
    }
}
