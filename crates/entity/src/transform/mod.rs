//! Read-path transformation.
//!
//! [`Transformer::transform_result`] turns backend documents into the
//! entities returned to callers:
//!
//! 1. the adapter normalizes each document ([`Adapter::entity_to_json`]);
//! 2. columns are mapped back to field names, and object/array fields
//!    stored as JSON text are parsed when the backend lacks native
//!    structured values;
//! 3. only readable fields are kept: the read permission gate, then the
//!    caller's `fields` selection, then visibility (`hidden`);
//! 4. `get` hooks run;
//! 5. populate rules replace ids by the entities they point at;
//! 6. secure primary keys are encoded.

mod codec;
mod populate;

pub use codec::{Base64IdCodec, IdCodec, IdentityCodec};
pub use populate::{LookupRequest, LookupTransport};

use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::{Map, Value};
use tracing::debug;

use crate::access::{AccessPolicy, FieldAccess, authorized_fields};
use crate::adapter::{Adapter, Document};
use crate::error::{ConfigurationError, EntityError, EntityResult};
use crate::field::{CompiledFields, FieldDescriptor, Hidden, HookArgs, PopulateRule};
use crate::params::QueryParams;
use crate::tenant::OperationContext;

/// Turns backend documents into caller-facing entities.
#[derive(Debug, Clone)]
pub struct Transformer {
    fields: Arc<CompiledFields>,
    policy: Arc<dyn AccessPolicy>,
    codec: Arc<dyn IdCodec>,
    transport: Option<Arc<dyn LookupTransport>>,
    default_populates: Vec<String>,
    populate_max_depth: Option<usize>,
}

impl Transformer {
    /// Creates a transformer with the identity codec and no lookup
    /// transport.
    pub fn new(fields: Arc<CompiledFields>, policy: Arc<dyn AccessPolicy>) -> Self {
        Self {
            fields,
            policy,
            codec: Arc::new(IdentityCodec),
            transport: None,
            default_populates: Vec::new(),
            populate_max_depth: None,
        }
    }

    /// Sets the secure id codec.
    pub fn with_codec(mut self, codec: Arc<dyn IdCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the transport used by lookup populate rules.
    pub fn with_transport(mut self, transport: Arc<dyn LookupTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the fields populated when the caller asks for none.
    pub fn with_default_populates(mut self, fields: Vec<String>) -> Self {
        self.default_populates = fields;
        self
    }

    /// Bounds populate recursion.
    pub fn with_populate_max_depth(mut self, depth: Option<usize>) -> Self {
        self.populate_max_depth = depth;
        self
    }

    /// Returns the secure id codec.
    pub fn codec(&self) -> &dyn IdCodec {
        self.codec.as_ref()
    }

    /// Returns the fields a read returns, in declaration order.
    pub async fn readable_fields(
        &self,
        params: &QueryParams,
        ctx: &OperationContext,
    ) -> Vec<&FieldDescriptor> {
        let fields = self.fields.fields();
        let permitted = if self.fields.needs_authorization() {
            authorized_fields(self.policy.as_ref(), fields, FieldAccess::Read, ctx).await
        } else {
            fields.iter().collect()
        };

        let requested = params.field_list();
        let named = |field: &FieldDescriptor| {
            requested.is_some_and(|list| {
                list.iter().any(|name| {
                    name == &field.name
                        || name
                            .strip_prefix(field.name.as_str())
                            .is_some_and(|rest| rest.starts_with('.'))
                })
            })
        };

        permitted
            .into_iter()
            .filter(|field| match field.hidden {
                Hidden::Always => false,
                Hidden::UnlessRequested => named(field),
                Hidden::Never => requested.is_none() || named(field),
            })
            .collect()
    }

    /// Maps a stored document to field names, parsing structured values
    /// stored as text. Every declared field is kept; undeclared columns are
    /// dropped.
    pub fn decode_document(&self, doc: &Document, native_structured: bool) -> Map<String, Value> {
        decode_map(self.fields.fields(), doc, native_structured)
    }

    /// Transforms backend documents into entities.
    pub async fn transform_result(
        &self,
        adapter: &dyn Adapter,
        docs: Vec<Document>,
        params: &QueryParams,
        ctx: &OperationContext,
    ) -> EntityResult<Vec<Value>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let native = adapter.has_native_structured_fields();
        let readable = self.readable_fields(params, ctx).await;

        let sources: Vec<Map<String, Value>> = docs
            .into_iter()
            .map(|doc| self.decode_document(&adapter.entity_to_json(doc), native))
            .collect();

        let mut outputs: Vec<Map<String, Value>> = sources
            .iter()
            .map(|source| {
                readable
                    .iter()
                    .filter_map(|f| source.get(&f.name).map(|v| (f.name.clone(), v.clone())))
                    .collect()
            })
            .collect();

        self.apply_getters(&readable, &sources, &mut outputs, ctx).await?;
        self.populate(&readable, &sources, &mut outputs, params, ctx).await?;

        let primary = self.fields.primary();
        if primary.secure {
            for out in &mut outputs {
                if let Some(id) = out.get_mut(&primary.name) {
                    *id = self.codec.encode(id)?;
                }
            }
        }

        Ok(outputs.into_iter().map(Value::Object).collect())
    }

    async fn apply_getters(
        &self,
        readable: &[&FieldDescriptor],
        sources: &[Map<String, Value>],
        outputs: &mut [Map<String, Value>],
        ctx: &OperationContext,
    ) -> EntityResult<()> {
        let getters: Vec<&FieldDescriptor> = readable.iter().copied().filter(|f| f.get.is_some()).collect();
        if getters.is_empty() {
            return Ok(());
        }

        try_join_all(sources.iter().zip(outputs.iter_mut()).map(|(source, out)| {
            let getters = &getters;
            async move {
                for field in getters {
                    let Some(get) = &field.get else { continue };
                    let args = HookArgs::new(&field.name, ctx.clone())
                        .with_value(source.get(&field.name).cloned())
                        .with_entity(source.clone());
                    out.insert(field.name.clone(), get.call(args).await?);
                }
                Ok::<_, EntityError>(())
            }
        }))
        .await?;
        Ok(())
    }

    async fn populate(
        &self,
        readable: &[&FieldDescriptor],
        sources: &[Map<String, Value>],
        outputs: &mut [Map<String, Value>],
        params: &QueryParams,
        ctx: &OperationContext,
    ) -> EntityResult<()> {
        let requested = match &params.populate {
            Some(list) if !list.is_empty() => list,
            _ => &self.default_populates,
        };

        let mut targets: Vec<(&FieldDescriptor, &PopulateRule, &str, Vec<Value>)> = Vec::new();
        for name in requested {
            match readable.iter().find(|f| &f.name == name) {
                Some(field) => match &field.populate {
                    Some(rule) => {
                        let key_field = rule.key_field.as_deref().unwrap_or(&field.name);
                        let keys = populate::collect_keys(sources, key_field);
                        if !keys.is_empty() {
                            targets.push((*field, rule, key_field, keys));
                        }
                    }
                    None => debug!(field = %name, "Field has no populate rule"),
                },
                None => debug!(field = %name, "Ignoring populate of unreadable field"),
            }
        }
        if targets.is_empty() {
            return Ok(());
        }

        let depth = ctx.populate_depth();
        if let Some(max) = self.populate_max_depth {
            if depth >= max {
                return Err(ConfigurationError::PopulateDepthExceeded {
                    field: targets[0].0.name.clone(),
                    depth: depth + 1,
                }
                .into());
            }
        }

        let transport = self.transport.as_deref();
        let resolved = try_join_all(targets.iter().map(|(field, rule, _, keys)| {
            populate::resolve(&field.name, rule, keys.clone(), transport, ctx)
        }))
        .await?;

        for ((field, _, key_field, _), resolved) in targets.iter().zip(resolved) {
            populate::apply(sources, outputs, key_field, &field.name, &resolved);
        }
        Ok(())
    }
}

fn decode_map(fields: &[FieldDescriptor], doc: &Map<String, Value>, native: bool) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|field| {
            doc.get(&field.column_name)
                .map(|value| (field.name.clone(), decode_value(field, value, native)))
        })
        .collect()
}

fn decode_value(field: &FieldDescriptor, value: &Value, native: bool) -> Value {
    let value = match value {
        Value::String(text) if !native && field.field_type.is_structured() => {
            serde_json::from_str(text).unwrap_or_else(|_| value.clone())
        }
        other => other.clone(),
    };

    // Nested levels were parsed along with their parent.
    match (value, &field.properties, &field.items) {
        (Value::Object(map), Some(children), _) => Value::Object(decode_map(children, &map, true)),
        (Value::Array(items), _, Some(item)) => Value::Array(
            items
                .iter()
                .map(|v| decode_value(item, v, true))
                .collect(),
        ),
        (value, _, _) => value,
    }
}
