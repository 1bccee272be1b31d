//! Field compiler.
//!
//! Service authors declare entity attributes once as [`Declarations`]; the
//! compiler expands shorthand forms, synthesizes the primary key when none is
//! declared and produces immutable [`FieldDescriptor`]s. Per-operation
//! [`ValidatorSchema`]s are generated from the descriptors.
//!
//! # Examples
//!
//! ```
//! use helios_entity::field::{compile, Declarations, FieldSpec, FieldType, Operation, Strictness};
//! use serde_json::json;
//!
//! let fields = compile(
//!     &Declarations::new()
//!         .field("title", "string|required|min:3")
//!         .field("votes", FieldSpec::new(FieldType::Integer).default_value(json!(0))),
//! )
//! .unwrap();
//!
//! let create = fields.schema(Operation::Create, Strictness::Remove, true).unwrap();
//! let checked = create
//!     .check(json!({"title": "Hello"}).as_object().unwrap())
//!     .unwrap();
//! assert_eq!(checked["votes"], json!(0));
//! ```

mod compiler;
mod declaration;
mod descriptor;
mod hook;
mod schema;
mod shorthand;
mod types;

pub use compiler::{
    CompileOptions, CompiledFields, DEFAULT_PRIMARY_KEY, DEFAULT_PRIMARY_KEY_COLUMN, compile,
    compile_with,
};
pub use declaration::{Declarations, FieldDeclaration, FieldSpec};
pub use descriptor::{FieldDescriptor, LookupRule, PopulateArgs, PopulateRule, PopulateSource};
pub use hook::{Hook, HookArgs, Resolvable};
pub use schema::{ObjectSchema, Presence, PropertyRule, ValidatorSchema, generate_validator_schema};
pub use shorthand::parse_shorthand;
pub use types::{Constraints, FieldType, Hidden, KeyGeneration, Operation, Strictness};
