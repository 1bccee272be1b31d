//! Static field declarations, as written by service authors.
//!
//! A declaration is one of:
//!
//! - `true`: an any-typed field with no constraints,
//! - `false`: the field is ignored,
//! - a shorthand string such as `"string|required|min:3"` (see
//!   [`parse_shorthand`](super::shorthand::parse_shorthand)),
//! - a [`FieldSpec`] built in code.
//!
//! [`compile`](super::compile) turns a [`Declarations`] list into descriptors.

use serde_json::{Map, Value};

use super::descriptor::{FieldDescriptor, PopulateArgs, PopulateRule};
use super::hook::{Hook, Resolvable};
use super::types::{FieldType, Hidden, KeyGeneration};

/// One field declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDeclaration {
    /// `true`: an any-typed field.
    Any,
    /// `false`: skipped by the compiler.
    Disabled,
    /// A shorthand string.
    Shorthand(String),
    /// A fully specified field.
    Spec(FieldSpec),
}

impl From<bool> for FieldDeclaration {
    fn from(enabled: bool) -> Self {
        if enabled {
            FieldDeclaration::Any
        } else {
            FieldDeclaration::Disabled
        }
    }
}

impl From<&str> for FieldDeclaration {
    fn from(shorthand: &str) -> Self {
        FieldDeclaration::Shorthand(shorthand.to_string())
    }
}

impl From<String> for FieldDeclaration {
    fn from(shorthand: String) -> Self {
        FieldDeclaration::Shorthand(shorthand)
    }
}

impl From<FieldSpec> for FieldDeclaration {
    fn from(spec: FieldSpec) -> Self {
        FieldDeclaration::Spec(spec)
    }
}

impl From<FieldType> for FieldDeclaration {
    fn from(field_type: FieldType) -> Self {
        FieldDeclaration::Spec(FieldSpec::new(field_type))
    }
}

/// Populate declaration awaiting compilation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingPopulate {
    Rule(PopulateRule),
    Json(Value),
}

/// Builder for a fully specified field.
///
/// # Examples
///
/// ```
/// use helios_entity::field::{FieldSpec, FieldType, Hidden};
/// use serde_json::json;
///
/// let status = FieldSpec::new(FieldType::Enum)
///     .values([json!("draft"), json!("published")])
///     .default_value(json!("draft"));
///
/// let password = FieldSpec::new(FieldType::String)
///     .required()
///     .min(8.0)
///     .hidden(Hidden::Always);
/// # let _ = (status, password);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub(crate) descriptor: FieldDescriptor,
    pub(crate) column: Option<String>,
    pub(crate) properties: Vec<(String, FieldDeclaration)>,
    pub(crate) items: Option<Box<FieldDeclaration>>,
    pub(crate) populate: Option<PendingPopulate>,
}

impl FieldSpec {
    /// Starts a field of the given type.
    pub fn new(field_type: FieldType) -> Self {
        Self {
            descriptor: FieldDescriptor::new(String::new(), field_type),
            column: None,
            properties: Vec::new(),
            items: None,
            populate: None,
        }
    }

    /// Returns the declared type.
    pub fn field_type(&self) -> FieldType {
        self.descriptor.field_type
    }

    /// Marks the field required on create and replace.
    pub fn required(mut self) -> Self {
        self.descriptor.required = true;
        self
    }

    /// Clears the required flag.
    pub fn optional(mut self) -> Self {
        self.descriptor.required = false;
        self
    }

    /// Lets an explicit `null` pass the required check.
    pub fn nullable(mut self) -> Self {
        self.descriptor.nullable = true;
        self
    }

    pub fn readonly(mut self) -> Self {
        self.descriptor.readonly = true;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.descriptor.immutable = true;
        self
    }

    /// Sets read-path visibility.
    pub fn hidden(mut self, hidden: Hidden) -> Self {
        self.descriptor.hidden = hidden;
        self
    }

    /// Marks the field as the primary key.
    pub fn primary_key(mut self) -> Self {
        self.descriptor.primary_key = true;
        self
    }

    /// Marks the primary key as supplied by callers instead of the backend.
    pub fn user_generated(mut self) -> Self {
        self.descriptor.generated = KeyGeneration::User;
        self
    }

    /// Re-encodes stored ids on the way out.
    pub fn secure(mut self) -> Self {
        self.descriptor.secure = true;
        self
    }

    /// Marks the field output-only.
    pub fn virtual_field(mut self) -> Self {
        self.descriptor.virtual_field = true;
        self
    }

    /// Sets the backend column name.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Requires any of the given capability tags to write (and, absent a
    /// read permission, to read).
    pub fn permission<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.permission = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Requires any of the given capability tags to read.
    pub fn read_permission<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.read_permission = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Sets a literal default.
    pub fn default_value(mut self, value: Value) -> Self {
        self.descriptor.default = Some(Resolvable::Literal(value));
        self
    }

    /// Sets a default computed at request time.
    pub fn default_with(mut self, hook: Hook) -> Self {
        self.descriptor.default = Some(Resolvable::Computed(hook));
        self
    }

    pub fn set(mut self, hook: Hook) -> Self {
        self.descriptor.set = Some(hook);
        self
    }

    pub fn get(mut self, hook: Hook) -> Self {
        self.descriptor.get = Some(hook);
        self
    }

    pub fn validate(mut self, hook: Hook<()>) -> Self {
        self.descriptor.validate = Some(hook);
        self
    }

    pub fn on_create(mut self, value: impl Into<Resolvable>) -> Self {
        self.descriptor.on_create = Some(value.into());
        self
    }

    pub fn on_update(mut self, value: impl Into<Resolvable>) -> Self {
        self.descriptor.on_update = Some(value.into());
        self
    }

    pub fn on_replace(mut self, value: impl Into<Resolvable>) -> Self {
        self.descriptor.on_replace = Some(value.into());
        self
    }

    pub fn on_remove(mut self, value: impl Into<Resolvable>) -> Self {
        self.descriptor.on_remove = Some(value.into());
        self
    }

    /// Attaches a populate rule.
    pub fn populate(mut self, rule: PopulateRule) -> Self {
        self.populate = Some(PendingPopulate::Rule(rule));
        self
    }

    /// Attaches a custom populate resolver.
    pub fn populate_with(self, hook: Hook<Map<String, Value>, PopulateArgs>) -> Self {
        self.populate(PopulateRule::resolver(hook))
    }

    /// Attaches a JSON populate declaration, checked at compile time.
    pub fn populate_json(mut self, declaration: Value) -> Self {
        self.populate = Some(PendingPopulate::Json(declaration));
        self
    }

    /// Minimum length, item count or magnitude.
    pub fn min(mut self, min: f64) -> Self {
        self.descriptor.constraints.min = Some(min);
        self
    }

    /// Maximum length, item count or magnitude.
    pub fn max(mut self, max: f64) -> Self {
        self.descriptor.constraints.max = Some(max);
        self
    }

    /// Regular expression string values must match.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.descriptor.constraints.pattern = Some(pattern.into());
        self
    }

    /// Allowed values.
    pub fn values<I>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.descriptor.constraints.values = Some(values.into_iter().collect());
        self
    }

    /// Declares a child property of an object field.
    pub fn property(mut self, name: impl Into<String>, declaration: impl Into<FieldDeclaration>) -> Self {
        self.properties.push((name.into(), declaration.into()));
        self
    }

    /// Declares the item shape of an array field.
    pub fn items(mut self, declaration: impl Into<FieldDeclaration>) -> Self {
        self.items = Some(Box::new(declaration.into()));
        self
    }
}

/// An ordered list of named field declarations.
///
/// # Examples
///
/// ```
/// use helios_entity::field::{Declarations, FieldSpec, FieldType};
///
/// let fields = Declarations::new()
///     .field("title", "string|required|min:3")
///     .field("votes", FieldSpec::new(FieldType::Integer).min(0.0))
///     .field("meta", true);
/// assert_eq!(fields.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Declarations {
    entries: Vec<(String, FieldDeclaration)>,
}

impl Declarations {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field.
    pub fn field(mut self, name: impl Into<String>, declaration: impl Into<FieldDeclaration>) -> Self {
        self.entries.push((name.into(), declaration.into()));
        self
    }

    /// Returns the number of declarations, disabled ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is declared.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the declarations in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldDeclaration)> {
        self.entries.iter().map(|(name, decl)| (name.as_str(), decl))
    }
}

impl<S, D> FromIterator<(S, D)> for Declarations
where
    S: Into<String>,
    D: Into<FieldDeclaration>,
{
    fn from_iter<T: IntoIterator<Item = (S, D)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(name, decl)| (name.into(), decl.into()))
                .collect(),
        }
    }
}
