//! Validation and sanitization of writes.
//!
//! [`Validator::validate`] turns a caller payload into the changes handed to
//! the backend. For create, update and replace:
//!
//! 1. The root [`ValidatorSchema`] converts and checks the payload, failing
//!    once with every violation.
//! 2. Fields the caller may not write are dropped (skipped in permissive
//!    mode, and when no field declares a permission).
//! 3. Every remaining field is resolved concurrently. First match wins:
//!    virtual fields are skipped, a `set` hook replaces the value, a
//!    lifecycle hook for the operation supplies it, a default fills an
//!    absent value on full writes, readonly fields are dropped, immutable
//!    fields that already hold a value are dropped (update) or restored
//!    (replace). Otherwise the supplied value is kept.
//! 4. Resolved values run through the `validate` hook, nested object and
//!    array item validation and the required/nullable check.
//!
//! The output is keyed by column name. Removal yields the soft delete
//! tombstone, or nothing when the entity has no `on_remove` hooks.
//!
//! Sibling fields resolve with no defined order: a `set` hook reading
//! another field sees the payload, not that field's resolved value.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use serde_json::{Map, Value};
use tracing::debug;

use crate::access::{AccessPolicy, FieldAccess, authorized_fields};
use crate::adapter::Document;
use crate::error::{ConfigurationError, EntityError, EntityResult, ValidationDetail, ValidationError};
use crate::field::{CompiledFields, FieldDescriptor, HookArgs, Operation, Strictness, ValidatorSchema};
use crate::tenant::OperationContext;

/// Per-call options of a write.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Bypass readonly, immutable and authorization rules.
    pub permissive: bool,
    /// The stored entity, keyed by field name (update, replace, remove).
    pub previous: Option<Map<String, Value>>,
    /// Whether the target backend stores objects and arrays natively.
    pub native_structured: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            permissive: false,
            previous: None,
            native_structured: true,
        }
    }
}

impl WriteOptions {
    /// Creates options for a non-permissive write to a native backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables permissive mode.
    pub fn permissive(mut self) -> Self {
        self.permissive = true;
        self
    }

    /// Sets the stored entity.
    pub fn with_previous(mut self, previous: Map<String, Value>) -> Self {
        self.previous = Some(previous);
        self
    }

    /// Sets the backend capability.
    pub fn with_native_structured(mut self, native: bool) -> Self {
        self.native_structured = native;
        self
    }
}

/// Validates writes of one entity.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use helios_entity::access::CapabilityPolicy;
/// use helios_entity::field::{compile, Declarations, Operation, Strictness};
/// use helios_entity::tenant::OperationContext;
/// use helios_entity::validation::{Validator, WriteOptions};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let fields = compile(&Declarations::new()
///     .field("title", "string|required")
///     .field("votes", "integer")).unwrap();
/// let validator = Validator::new(
///     Arc::new(fields),
///     Arc::new(CapabilityPolicy::new()),
///     Strictness::Remove,
///     true,
/// ).unwrap();
///
/// let input = json!({"title": "Hello", "votes": "3", "extra": 1});
/// let changes = validator
///     .validate(Operation::Create, input.as_object().unwrap(), &OperationContext::system(), &WriteOptions::new())
///     .await
///     .unwrap();
/// assert_eq!(serde_json::Value::Object(changes), json!({"title": "Hello", "votes": 3}));
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct Validator {
    fields: Arc<CompiledFields>,
    policy: Arc<dyn AccessPolicy>,
    create: ValidatorSchema,
    update: ValidatorSchema,
    replace: ValidatorSchema,
}

impl Validator {
    /// Builds the per-operation schemas.
    pub fn new(
        fields: Arc<CompiledFields>,
        policy: Arc<dyn AccessPolicy>,
        strictness: Strictness,
        convert: bool,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            create: fields.schema(Operation::Create, strictness, convert)?,
            update: fields.schema(Operation::Update, strictness, convert)?,
            replace: fields.schema(Operation::Replace, strictness, convert)?,
            fields,
            policy,
        })
    }

    /// Returns the compiled fields.
    pub fn fields(&self) -> &CompiledFields {
        &self.fields
    }

    /// Returns the root schema of a write operation. Removal has none.
    pub fn schema(&self, operation: Operation) -> Option<&ValidatorSchema> {
        match operation {
            Operation::Create => Some(&self.create),
            Operation::Update => Some(&self.update),
            Operation::Replace => Some(&self.replace),
            Operation::Remove => None,
        }
    }

    /// Validates `input` for `operation` and returns the backend changes,
    /// keyed by column name.
    ///
    /// The primary key is never part of update or replace changes.
    pub async fn validate(
        &self,
        operation: Operation,
        input: &Map<String, Value>,
        ctx: &OperationContext,
        options: &WriteOptions,
    ) -> EntityResult<Document> {
        let Some(schema) = self.schema(operation) else {
            return self.tombstone(ctx, options).await;
        };

        let checked = schema.check(input)?;

        let declared = self.fields.fields();
        let writable: Vec<&FieldDescriptor> = if options.permissive || !self.fields.needs_authorization() {
            declared.iter().collect()
        } else {
            authorized_fields(self.policy.as_ref(), declared, FieldAccess::Write, ctx).await
        };
        if writable.len() < declared.len() {
            debug!(
                operation = %operation,
                dropped = declared.len() - writable.len(),
                "Dropped fields the caller may not write"
            );
        }

        let mut output = self
            .validate_level(
                writable,
                declared,
                &checked,
                operation,
                options.previous.as_ref(),
                ctx,
                options,
            )
            .await?;

        if matches!(operation, Operation::Update | Operation::Replace) {
            output.remove(&self.fields.primary().column_name);
        }
        if !options.native_structured {
            serialize_structured(declared, &mut output)?;
        }

        debug!(operation = %operation, columns = output.len(), "Validated entity");
        Ok(output)
    }

    /// Soft delete changes: the resolved `on_remove` hooks.
    async fn tombstone(&self, ctx: &OperationContext, options: &WriteOptions) -> EntityResult<Document> {
        if !self.fields.soft_delete() {
            return Ok(Document::new());
        }
        let entity = options.previous.clone().unwrap_or_default();

        let pairs = try_join_all(self.fields.fields().iter().filter_map(|field| {
            let hook = field.on_remove.as_ref()?;
            let args = HookArgs::new(&field.name, ctx.clone())
                .with_value(entity.get(&field.name).cloned())
                .with_entity(entity.clone())
                .with_operation(Operation::Remove)
                .with_previous(options.previous.clone());
            Some(async move {
                let value = hook.resolve(args).await?;
                Ok::<_, EntityError>((field.column_name.clone(), value))
            })
        }))
        .await?;

        let mut output: Document = pairs.into_iter().collect();
        if !options.native_structured {
            serialize_structured(self.fields.fields(), &mut output)?;
        }
        Ok(output)
    }

    /// Resolves one object level. `fields` are the descriptors to process,
    /// `declared` every descriptor of the level.
    #[allow(clippy::too_many_arguments)]
    fn validate_level<'a>(
        &'a self,
        fields: Vec<&'a FieldDescriptor>,
        declared: &'a [FieldDescriptor],
        input: &'a Map<String, Value>,
        operation: Operation,
        previous: Option<&'a Map<String, Value>>,
        ctx: &'a OperationContext,
        options: &'a WriteOptions,
    ) -> BoxFuture<'a, EntityResult<Document>> {
        async move {
            let resolved = try_join_all(fields.iter().map(|field| async move {
                let value = self
                    .resolve_field(field, input, operation, previous, ctx, options)
                    .await?;
                Ok::<_, EntityError>(value.map(|v| (field.column_name.clone(), v)))
            }))
            .await?;

            let mut output: Document = resolved.into_iter().flatten().collect();

            // Undeclared keys only survive the root schema when it allows them.
            for (key, value) in input {
                if !declared.iter().any(|f| &f.name == key) {
                    output.insert(key.clone(), value.clone());
                }
            }
            Ok(output)
        }
        .boxed()
    }

    async fn resolve_field(
        &self,
        field: &FieldDescriptor,
        input: &Map<String, Value>,
        operation: Operation,
        previous: Option<&Map<String, Value>>,
        ctx: &OperationContext,
        options: &WriteOptions,
    ) -> EntityResult<Option<Value>> {
        if field.virtual_field {
            return Ok(None);
        }

        let value = input.get(&field.name).cloned();
        let stored = previous
            .and_then(|p| p.get(&field.name))
            .filter(|v| !v.is_null());
        let args = HookArgs::new(&field.name, ctx.clone())
            .with_value(value.clone())
            .with_entity(input.clone())
            .with_operation(operation)
            .with_previous(previous.cloned());

        let restricted = !options.permissive
            && ((field.readonly && !field.primary_key)
                || (operation == Operation::Create && field.is_backend_key()));

        let resolved = if let Some(set) = &field.set {
            let out = set.call(args).await?;
            // A setter returning null for an absent value leaves it unset.
            (value.is_some() || !out.is_null()).then_some(out)
        } else if let Some(hook) = field.lifecycle_hook(operation) {
            Some(hook.resolve(args).await?)
        } else if let (true, None, Some(default)) =
            (operation.is_full_write(), &value, &field.default)
        {
            Some(default.resolve(args).await?)
        } else if restricted {
            None
        } else if !options.permissive && field.immutable && stored.is_some() {
            match operation {
                Operation::Replace => stored.cloned(),
                Operation::Update => None,
                _ => value,
            }
        } else {
            value
        };

        let Some(value) = resolved else {
            if operation.is_full_write() && field.required && !restricted {
                return Err(ValidationError::single(ValidationDetail::required(&field.name)).into());
            }
            return Ok(None);
        };

        self.finish_value(field, value, field.name.clone(), input, operation, previous, ctx, options)
            .await
            .map(Some)
    }

    /// Custom validation, nested validation and the required check of a
    /// resolved value.
    #[allow(clippy::too_many_arguments)]
    fn finish_value<'a>(
        &'a self,
        field: &'a FieldDescriptor,
        value: Value,
        path: String,
        entity: &'a Map<String, Value>,
        operation: Operation,
        previous: Option<&'a Map<String, Value>>,
        ctx: &'a OperationContext,
        options: &'a WriteOptions,
    ) -> BoxFuture<'a, EntityResult<Value>> {
        async move {
            if let Some(validate) = &field.validate {
                let args = HookArgs::new(path.clone(), ctx.clone())
                    .with_value(Some(value.clone()))
                    .with_entity(entity.clone())
                    .with_operation(operation)
                    .with_previous(previous.cloned());
                validate.call(args).await?;
            }

            let value = match value {
                Value::Object(map) if field.properties.is_some() => {
                    let children = field.properties.as_deref().unwrap_or_default();
                    let nested_previous = previous
                        .and_then(|p| p.get(&field.name))
                        .and_then(Value::as_object);
                    let nested = self
                        .validate_level(
                            children.iter().collect(),
                            children,
                            &map,
                            operation,
                            nested_previous,
                            ctx,
                            options,
                        )
                        .await?;
                    Value::Object(nested)
                }
                Value::Array(items) if field.items.is_some() => {
                    let mut out = Vec::with_capacity(items.len());
                    if let Some(item) = field.items.as_deref() {
                        for (idx, v) in items.into_iter().enumerate() {
                            if v.is_null() {
                                out.push(v);
                                continue;
                            }
                            let item_path = format!("{}[{}]", path, idx);
                            out.push(
                                self.finish_value(item, v, item_path, entity, operation, None, ctx, options)
                                    .await?,
                            );
                        }
                    }
                    Value::Array(out)
                }
                other => other,
            };

            if operation.is_full_write() && value.is_null() && field.required && !field.nullable {
                return Err(ValidationError::single(ValidationDetail::required(path)).into());
            }
            Ok(value)
        }
        .boxed()
    }
}

/// Replaces object and array values of structured fields by their JSON text.
fn serialize_structured(fields: &[FieldDescriptor], output: &mut Document) -> EntityResult<()> {
    for field in fields.iter().filter(|f| f.field_type.is_structured()) {
        if let Some(value) = output.get_mut(&field.column_name) {
            if value.is_object() || value.is_array() {
                *value = Value::String(serde_json::to_string(value)?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::access::CapabilityPolicy;
    use crate::error::ValidationKind;
    use crate::field::{Declarations, FieldSpec, FieldType, Hook, compile};
    use crate::tenant::Capabilities;

    fn validator(declarations: Declarations) -> Validator {
        Validator::new(
            Arc::new(compile(&declarations).unwrap()),
            Arc::new(CapabilityPolicy::new()),
            Strictness::Remove,
            true,
        )
        .unwrap()
    }

    async fn run(
        validator: &Validator,
        operation: Operation,
        input: Value,
        options: &WriteOptions,
    ) -> EntityResult<Value> {
        validator
            .validate(operation, input.as_object().unwrap(), &OperationContext::system(), options)
            .await
            .map(Value::Object)
    }

    #[tokio::test]
    async fn test_create_missing_required_fails_aggregated() {
        let v = validator(
            Declarations::new()
                .field("title", "string|required")
                .field("author", "string|required")
                .field("votes", "integer"),
        );
        let err = run(&v, Operation::Create, json!({"votes": 1}), &WriteOptions::new())
            .await
            .unwrap_err();
        let validation = err.as_validation().unwrap();
        assert!(validation.has("title", ValidationKind::Required));
        assert!(validation.has("author", ValidationKind::Required));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_update_with_only_id_is_noop() {
        let v = validator(
            Declarations::new()
                .field("title", "string|required")
                .field("votes", "integer"),
        );
        let out = run(&v, Operation::Update, json!({"id": "abc"}), &WriteOptions::new())
            .await
            .unwrap();
        assert_eq!(out, json!({}));
    }

    #[tokio::test]
    async fn test_set_hook_wins_over_lifecycle_and_default() {
        let upper: Hook = Hook::sync(|args: HookArgs| {
            let s = args.value.as_ref().and_then(Value::as_str).unwrap_or("none");
            Ok(json!(s.to_uppercase()))
        });
        let v = validator(
            Declarations::new().field(
                "code",
                FieldSpec::new(FieldType::String)
                    .set(upper)
                    .on_create(json!("ignored"))
                    .default_value(json!("also ignored")),
            ),
        );
        let out = run(&v, Operation::Create, json!({"code": "ab"}), &WriteOptions::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"code": "AB"}));
    }

    #[tokio::test]
    async fn test_lifecycle_hooks_and_computed_defaults() {
        let stamp: Hook = Hook::sync(|args: HookArgs| Ok(json!(format!("{}-at", args.operation.map(|o| o.to_string()).unwrap_or_default()))));
        let computed: Hook = Hook::sync(|_| Ok(json!(42)));
        let v = validator(
            Declarations::new()
                .field("createdAt", FieldSpec::new(FieldType::String).readonly().on_create(stamp.clone()))
                .field("updatedAt", FieldSpec::new(FieldType::String).readonly().on_update(stamp))
                .field("score", FieldSpec::new(FieldType::Integer).default_with(computed))
                .field("status", FieldSpec::new(FieldType::String).default_value(json!("draft"))),
        );

        let out = run(&v, Operation::Create, json!({}), &WriteOptions::new()).await.unwrap();
        assert_eq!(out, json!({"createdAt": "create-at", "score": 42, "status": "draft"}));

        let out = run(&v, Operation::Update, json!({"id": 1, "createdAt": "x"}), &WriteOptions::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"updatedAt": "update-at"}));
    }

    #[tokio::test]
    async fn test_readonly_dropped_unless_permissive() {
        let v = validator(Declarations::new().field("rank", "integer|readonly").field("name", "string"));
        let out = run(&v, Operation::Create, json!({"rank": 5, "name": "n"}), &WriteOptions::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"name": "n"}));

        let out = run(
            &v,
            Operation::Create,
            json!({"rank": 5, "name": "n"}),
            &WriteOptions::new().permissive(),
        )
        .await
        .unwrap();
        assert_eq!(out, json!({"rank": 5, "name": "n"}));
    }

    #[tokio::test]
    async fn test_backend_key_dropped_on_create() {
        let v = validator(Declarations::new().field("name", "string"));
        let out = run(&v, Operation::Create, json!({"id": "mine", "name": "n"}), &WriteOptions::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"name": "n"}));

        let out = run(
            &v,
            Operation::Create,
            json!({"id": "mine", "name": "n"}),
            &WriteOptions::new().permissive(),
        )
        .await
        .unwrap();
        assert_eq!(out, json!({"_id": "mine", "name": "n"}));
    }

    #[tokio::test]
    async fn test_immutable_update_and_replace() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let check: Hook<()> = Hook::sync(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let v = validator(
            Declarations::new()
                .field("owner", FieldSpec::new(FieldType::String).immutable().validate(check))
                .field("title", "string"),
        );
        let previous = json!({"id": "1", "owner": "alice", "title": "old"});
        let options = WriteOptions::new().with_previous(previous.as_object().cloned().unwrap());

        let out = run(&v, Operation::Update, json!({"id": "1", "owner": "alice", "title": "new"}), &options)
            .await
            .unwrap();
        assert_eq!(out, json!({"title": "new"}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let out = run(&v, Operation::Replace, json!({"id": "1", "owner": "mallory"}), &options)
            .await
            .unwrap();
        assert_eq!(out, json!({"owner": "alice"}));
    }

    #[tokio::test]
    async fn test_custom_validator_aborts() {
        let positive: Hook<()> = Hook::sync(|args: HookArgs| {
            match args.value.as_ref().and_then(Value::as_i64) {
                Some(n) if n > 0 => Ok(()),
                _ => Err(ValidationError::custom(args.field, "must be positive").into()),
            }
        });
        let v = validator(Declarations::new().field("qty", FieldSpec::new(FieldType::Integer).validate(positive)));
        let err = run(&v, Operation::Create, json!({"qty": -1}), &WriteOptions::new())
            .await
            .unwrap_err();
        assert!(err.as_validation().unwrap().has("qty", ValidationKind::Custom));
    }

    #[tokio::test]
    async fn test_null_required_rejected_unless_nullable() {
        let v = validator(
            Declarations::new()
                .field("a", "string|required")
                .field("b", "string|required|nullable"),
        );
        let err = run(&v, Operation::Create, json!({"a": null, "b": null}), &WriteOptions::new())
            .await
            .unwrap_err();
        let validation = err.as_validation().unwrap();
        assert!(validation.has("a", ValidationKind::Required));
        assert!(!validation.has("b", ValidationKind::Required));
    }

    #[tokio::test]
    async fn test_nested_object_and_array_items() {
        let slug: Hook = Hook::sync(|args: HookArgs| {
            let s = args.value.as_ref().and_then(Value::as_str).unwrap_or_default();
            Ok(json!(s.to_lowercase().replace(' ', "-")))
        });
        let v = validator(
            Declarations::new()
                .field(
                    "meta",
                    FieldSpec::new(FieldType::Object)
                        .property("slug", FieldSpec::new(FieldType::String).set(slug).column("s"))
                        .property("views", "integer"),
                )
                .field("tags", FieldSpec::new(FieldType::Array).items("string|max:3")),
        );
        let out = run(
            &v,
            Operation::Create,
            json!({"meta": {"slug": "Hello World", "views": "7", "junk": 1}, "tags": ["a", "bc"]}),
            &WriteOptions::new(),
        )
        .await
        .unwrap();
        assert_eq!(
            out,
            json!({"meta": {"s": "hello-world", "views": 7}, "tags": ["a", "bc"]})
        );

        let err = run(&v, Operation::Create, json!({"tags": ["toolong"]}), &WriteOptions::new())
            .await
            .unwrap_err();
        assert!(err.as_validation().unwrap().has("tags[0]", ValidationKind::Max));
    }

    #[tokio::test]
    async fn test_structured_values_serialized_for_plain_backends() {
        let v = validator(Declarations::new().field("meta", "object").field("tags", "array"));
        let out = run(
            &v,
            Operation::Create,
            json!({"meta": {"a": 1}, "tags": [1, 2]}),
            &WriteOptions::new().with_native_structured(false),
        )
        .await
        .unwrap();
        assert_eq!(out, json!({"meta": "{\"a\":1}", "tags": "[1,2]"}));
    }

    #[tokio::test]
    async fn test_unauthorized_fields_dropped() {
        let v = validator(
            Declarations::new()
                .field("salary", FieldSpec::new(FieldType::Number).permission(["hr"]))
                .field("name", "string"),
        );
        let ctx = OperationContext::new(Capabilities::none());
        let input = json!({"salary": 10, "name": "n"});
        let out = v
            .validate(Operation::Create, input.as_object().unwrap(), &ctx, &WriteOptions::new())
            .await
            .unwrap();
        assert_eq!(Value::Object(out), json!({"name": "n"}));

        let ctx = OperationContext::new(Capabilities::from_tags(["hr"]));
        let out = v
            .validate(Operation::Create, input.as_object().unwrap(), &ctx, &WriteOptions::new())
            .await
            .unwrap();
        assert_eq!(Value::Object(out), json!({"salary": 10, "name": "n"}));
    }

    #[tokio::test]
    async fn test_remove_tombstone() {
        let plain = validator(Declarations::new().field("name", "string"));
        let out = run(&plain, Operation::Remove, json!({}), &WriteOptions::new()).await.unwrap();
        assert_eq!(out, json!({}));

        let deleted_by: Hook = Hook::sync(|args: HookArgs| Ok(json!(args.ctx.user_id().unwrap_or("system"))));
        let soft = validator(
            Declarations::new()
                .field("name", "string")
                .field("deleted", FieldSpec::new(FieldType::Boolean).on_remove(json!(true)))
                .field("deletedBy", FieldSpec::new(FieldType::String).column("deleted_by").on_remove(deleted_by)),
        );
        let out = run(&soft, Operation::Remove, json!({}), &WriteOptions::new()).await.unwrap();
        assert_eq!(out, json!({"deleted": true, "deleted_by": "system"}));
    }

    #[tokio::test]
    async fn test_virtual_fields_never_written() {
        let full: Hook = Hook::sync(|_| Ok(json!("x")));
        let v = validator(
            Declarations::new()
                .field("name", "string")
                .field("fullName", FieldSpec::new(FieldType::String).virtual_field().get(full)),
        );
        let out = run(
            &v,
            Operation::Create,
            json!({"name": "n", "fullName": "y"}),
            &WriteOptions::new().permissive(),
        )
        .await
        .unwrap();
        assert_eq!(out, json!({"name": "n"}));
    }
}
