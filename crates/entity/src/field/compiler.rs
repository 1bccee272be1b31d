//! Field compiler: declarations in, immutable descriptors out.

use std::collections::HashSet;

use tracing::debug;

use crate::error::ConfigurationError;

use super::declaration::{Declarations, FieldDeclaration, FieldSpec, PendingPopulate};
use super::descriptor::{FieldDescriptor, PopulateRule};
use super::schema::{ValidatorSchema, generate_validator_schema};
use super::shorthand::parse_shorthand;
use super::types::{FieldType, KeyGeneration, Operation, Strictness};

/// Default name of a synthesized primary key.
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// Default column of a synthesized primary key.
pub const DEFAULT_PRIMARY_KEY_COLUMN: &str = "_id";

/// Options controlling compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Name of the primary key synthesized when none is declared.
    pub primary_key_name: String,
    /// Column of the synthesized primary key.
    pub primary_key_column: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            primary_key_name: DEFAULT_PRIMARY_KEY.to_string(),
            primary_key_column: DEFAULT_PRIMARY_KEY_COLUMN.to_string(),
        }
    }
}

/// The compiled field list of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFields {
    fields: Vec<FieldDescriptor>,
    primary: usize,
    soft_delete: bool,
    needs_authorization: bool,
}

impl CompiledFields {
    /// Returns every top-level descriptor, primary key included.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Returns the primary key descriptor.
    pub fn primary(&self) -> &FieldDescriptor {
        &self.fields[self.primary]
    }

    /// Returns `true` if removal is a soft delete (some field declares an
    /// `on_remove` hook).
    pub fn soft_delete(&self) -> bool {
        self.soft_delete
    }

    /// Returns `true` if any field declares a read or write permission.
    pub fn needs_authorization(&self) -> bool {
        self.needs_authorization
    }

    /// Looks up a descriptor by field name.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Looks up a descriptor by backend column name.
    pub fn by_column(&self, column: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.column_name == column)
    }

    /// Generates the validator schema for an operation.
    pub fn schema(
        &self,
        operation: Operation,
        strictness: Strictness,
        convert: bool,
    ) -> Result<ValidatorSchema, ConfigurationError> {
        generate_validator_schema(&self.fields, operation, strictness, convert)
    }
}

/// Compiles declarations with the default primary key naming.
///
/// # Examples
///
/// ```
/// use helios_entity::field::{compile, Declarations};
///
/// let fields = compile(&Declarations::new().field("title", "string|required")).unwrap();
/// assert_eq!(fields.primary().name, "id");
/// assert_eq!(fields.primary().column_name, "_id");
/// assert!(!fields.soft_delete());
/// ```
pub fn compile(declarations: &Declarations) -> Result<CompiledFields, ConfigurationError> {
    compile_with(declarations, &CompileOptions::default())
}

/// Compiles declarations.
///
/// Fails on duplicate names, more than one primary key, unknown shorthand
/// tokens, invalid patterns, enum fields without values and invalid
/// populate declarations.
pub fn compile_with(
    declarations: &Declarations,
    options: &CompileOptions,
) -> Result<CompiledFields, ConfigurationError> {
    let mut fields = compile_level(declarations.iter())?;

    let mut primary = None;
    for (idx, field) in fields.iter().enumerate() {
        if !field.primary_key {
            continue;
        }
        if let Some(first) = primary {
            let first: &FieldDescriptor = &fields[first];
            return Err(ConfigurationError::MultiplePrimaryKeys {
                first: first.name.clone(),
                second: field.name.clone(),
            });
        }
        primary = Some(idx);
    }

    let primary = match primary {
        Some(idx) => idx,
        None => match fields
            .iter()
            .position(|f| f.name == options.primary_key_name)
        {
            // A field already named like the primary key becomes it.
            Some(idx) => {
                fields[idx].primary_key = true;
                idx
            }
            None => {
                let mut key = FieldDescriptor::new(&options.primary_key_name, FieldType::Any);
                key.column_name = options.primary_key_column.clone();
                key.primary_key = true;
                key.generated = KeyGeneration::Backend;
                fields.insert(0, key);
                0
            }
        },
    };

    let soft_delete = fields.iter().any(|f| f.on_remove.is_some());
    let needs_authorization = fields.iter().any(needs_authorization);

    debug!(
        fields = fields.len(),
        primary_key = %fields[primary].name,
        soft_delete,
        needs_authorization,
        "Compiled entity fields"
    );

    Ok(CompiledFields {
        fields,
        primary,
        soft_delete,
        needs_authorization,
    })
}

fn needs_authorization(field: &FieldDescriptor) -> bool {
    field.needs_authorization()
        || field
            .properties
            .as_ref()
            .is_some_and(|props| props.iter().any(needs_authorization))
        || field.items.as_deref().is_some_and(needs_authorization)
}

fn compile_level<'a>(
    declarations: impl Iterator<Item = (&'a str, &'a FieldDeclaration)>,
) -> Result<Vec<FieldDescriptor>, ConfigurationError> {
    let mut seen = HashSet::new();
    let mut fields = Vec::new();
    for (name, declaration) in declarations {
        let Some(field) = compile_field(name, declaration)? else {
            continue;
        };
        if !seen.insert(field.name.clone()) {
            return Err(ConfigurationError::DuplicateField { field: field.name });
        }
        fields.push(field);
    }
    Ok(fields)
}

fn compile_field(
    name: &str,
    declaration: &FieldDeclaration,
) -> Result<Option<FieldDescriptor>, ConfigurationError> {
    match declaration {
        FieldDeclaration::Disabled => Ok(None),
        FieldDeclaration::Any => Ok(Some(FieldDescriptor::new(name, FieldType::Any))),
        FieldDeclaration::Shorthand(shorthand) => {
            let spec = parse_shorthand(name, shorthand)?;
            finish_spec(name, &spec).map(Some)
        }
        FieldDeclaration::Spec(spec) => finish_spec(name, spec).map(Some),
    }
}

fn finish_spec(name: &str, spec: &FieldSpec) -> Result<FieldDescriptor, ConfigurationError> {
    let invalid = |message: &str| ConfigurationError::InvalidField {
        field: name.to_string(),
        message: message.to_string(),
    };

    let mut field = spec.descriptor.clone();
    field.name = name.to_string();
    field.column_name = spec.column.clone().unwrap_or_else(|| name.to_string());

    if let Some(pattern) = &field.constraints.pattern {
        regex::Regex::new(pattern).map_err(|e| invalid(&format!("invalid pattern: {}", e)))?;
    }
    if field.field_type == FieldType::Enum
        && field.constraints.values.as_ref().is_none_or(Vec::is_empty)
    {
        return Err(invalid("enum fields need at least one value"));
    }
    if field.virtual_field && field.primary_key {
        return Err(invalid("the primary key cannot be virtual"));
    }

    field.populate = match &spec.populate {
        None => None,
        Some(PendingPopulate::Rule(rule)) => {
            rule.check(name)?;
            Some(rule.clone())
        }
        Some(PendingPopulate::Json(value)) => Some(PopulateRule::from_json(name, value)?),
    };

    if !spec.properties.is_empty() {
        if field.field_type != FieldType::Object {
            return Err(invalid("only object fields can declare properties"));
        }
        let children = compile_level(spec.properties.iter().map(|(n, d)| (n.as_str(), d)))?;
        if let Some(child) = children.iter().find(|c| c.primary_key) {
            return Err(ConfigurationError::InvalidField {
                field: format!("{}.{}", name, child.name),
                message: "nested fields cannot be primary keys".to_string(),
            });
        }
        field.properties = Some(children);
    }

    if let Some(items) = &spec.items {
        if field.field_type != FieldType::Array {
            return Err(invalid("only array fields can declare items"));
        }
        field.items = compile_field(name, items)?.map(Box::new);
    }

    Ok(field)
}
