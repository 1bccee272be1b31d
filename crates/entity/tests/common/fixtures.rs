//! Field declarations and caller contexts used across the tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};

use helios_entity::field::{Declarations, FieldSpec, FieldType, Hidden, Hook, PopulateRule};
use helios_entity::tenant::{Capabilities, OperationContext};

/// Blog post declarations.
///
/// `slug` is immutable and its validator bumps `validations`, so tests can
/// tell whether the validator ran at all.
pub fn post_declarations(validations: Arc<AtomicUsize>) -> Declarations {
    Declarations::new()
        .field("title", "string|required|min:3")
        .field("body", "string")
        .field(
            "slug",
            FieldSpec::new(FieldType::String)
                .immutable()
                .validate(Hook::sync(move |_args| {
                    validations.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
        )
        .field(
            "status",
            FieldSpec::new(FieldType::Enum)
                .values([json!("draft"), json!("published")])
                .default_value(json!("draft")),
        )
        .field("votes", FieldSpec::new(FieldType::Integer).default_value(json!(0)))
        .field("tags", FieldSpec::new(FieldType::Array).items("string"))
}

/// Post declarations without a validation counter.
pub fn posts() -> Declarations {
    post_declarations(Arc::new(AtomicUsize::new(0)))
}

/// User declarations with a hidden password and an admin-only note.
pub fn users() -> Declarations {
    Declarations::new()
        .field("name", "string|required")
        .field("email", "email")
        .field("password", FieldSpec::new(FieldType::String).hidden(Hidden::Always))
        .field("note", FieldSpec::new(FieldType::String).permission(["admin"]))
        .field(
            "active",
            FieldSpec::new(FieldType::Boolean).default_value(json!(true)),
        )
}

/// Comment declarations whose `author` resolves through `users.resolve`.
pub fn comments() -> Declarations {
    Declarations::new()
        .field("text", "string|required")
        .field(
            "author",
            FieldSpec::new(FieldType::String).populate(PopulateRule::lookup("users.resolve")),
        )
}

/// A regular caller of the given tenant.
pub fn tenant(name: &str) -> OperationContext {
    OperationContext::new(Capabilities::none()).with_tenant(name)
}

/// A tenant caller holding the given capability tags.
pub fn tenant_with(name: &str, tags: &[&str]) -> OperationContext {
    OperationContext::new(Capabilities::from_tags(tags.iter().copied())).with_tenant(name)
}

/// A trusted caller without a tenant.
pub fn system() -> OperationContext {
    OperationContext::system()
}

/// Returns the string id of an entity.
pub fn id_of(entity: &Value) -> String {
    entity["id"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| entity["id"].to_string())
}
