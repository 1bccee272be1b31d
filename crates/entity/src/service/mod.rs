//! Orchestration layer.
//!
//! [`EntityService`] sequences the other components for every operation:
//!
//! - reads lease an adapter from the pool, apply scopes, translate field
//!   names to columns, query the backend and transform the result;
//! - writes lease an adapter, load and scope-check the stored entity
//!   (update, replace, remove), validate the payload for the operation,
//!   write, transform and publish a change event.
//!
//! The check-then-write window is not transactional. An entity removed by a
//! concurrent call between the two steps surfaces as a not-found error.
//!
//! # Examples
//!
//! ```
//! use helios_entity::field::Declarations;
//! use helios_entity::params::QueryParams;
//! use helios_entity::service::EntityService;
//! use helios_entity::tenant::OperationContext;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let posts = EntityService::builder(
//!     "posts",
//!     Declarations::new()
//!         .field("title", "string|required")
//!         .field("votes", "integer"),
//! )
//! .build()
//! .unwrap();
//!
//! let ctx = OperationContext::system();
//! let created = posts.create(json!({"title": "Hello", "votes": 2}), &ctx).await.unwrap();
//! assert_eq!(created["title"], json!("Hello"));
//!
//! let found = posts
//!     .find(QueryParams::new().with_query(json!({"votes": {"$gte": 1}})), &ctx)
//!     .await
//!     .unwrap();
//! assert_eq!(found, vec![created]);
//! # });
//! ```

mod builder;
mod registry;

pub use builder::EntityServiceBuilder;
pub use registry::ServiceRegistry;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};

use crate::adapter::{Adapter, Document, FindParams, IndexDefinition, InsertManyResult, id_key};
use crate::config::ServiceSettings;
use crate::error::{
    BackendError, EntityError, EntityResult, ResourceError, ValidationDetail, ValidationError,
    ValidationKind,
};
use crate::events::{ChangeEvent, ChangeNotifier, ChangeOperation, ChangeOptions};
use crate::field::{CompiledFields, Declarations, FieldDescriptor, Operation};
use crate::params::{QueryParams, ScopeSelection};
use crate::pool::AdapterPool;
use crate::scope::ScopeResolver;
use crate::tenant::OperationContext;
use crate::transform::Transformer;
use crate::validation::{Validator, WriteOptions};

/// One page of a [`list`](EntityService::list) call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResult {
    pub rows: Vec<Value>,
    /// Number of entities matching the query across all pages.
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: u64,
}

/// Parameters of [`resolve`](EntityService::resolve).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveParams {
    /// A single id, or an array of ids.
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub populate: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeSelection>,
    /// Return an object keyed by the requested ids.
    #[serde(default)]
    pub mapping: bool,
    /// Fail with [`ResourceError::NotFound`] if any id has no match.
    #[serde(default)]
    pub throw_if_not_found: bool,
}

impl ResolveParams {
    /// Resolves the given id or id array.
    pub fn new(id: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_populate<I, S>(mut self, populate: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.populate = Some(populate.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<ScopeSelection>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Returns an id-keyed object instead of a list.
    pub fn mapping(mut self) -> Self {
        self.mapping = true;
        self
    }

    /// Fails when an id has no match.
    pub fn throw_if_not_found(mut self) -> Self {
        self.throw_if_not_found = true;
        self
    }
}

/// Per-call options of create, update and replace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutateOptions {
    /// Bypass readonly, immutable and write-permission rules.
    pub permissive: bool,
}

impl MutateOptions {
    /// Options of a permissive write.
    pub fn permissive() -> Self {
        Self { permissive: true }
    }
}

/// An entity service: declared fields bound to a pooled backend.
#[derive(Debug)]
pub struct EntityService {
    name: String,
    settings: ServiceSettings,
    fields: Arc<CompiledFields>,
    validator: Validator,
    scopes: ScopeResolver,
    pool: AdapterPool,
    transformer: Transformer,
    notifier: Arc<dyn ChangeNotifier>,
}

impl EntityService {
    /// Starts building a service.
    pub fn builder(name: impl Into<String>, declarations: Declarations) -> EntityServiceBuilder {
        EntityServiceBuilder::new(name, declarations)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Returns the compiled field descriptors.
    pub fn fields(&self) -> &CompiledFields {
        &self.fields
    }

    /// Returns the adapter pool.
    pub fn pool(&self) -> &AdapterPool {
        &self.pool
    }

    /// Disconnects every pooled adapter.
    pub async fn shutdown(&self) -> EntityResult<()> {
        self.pool.shutdown().await
    }

    // ---- reads ----

    /// Finds entities matching `params`.
    #[instrument(skip_all, fields(service = %self.name))]
    pub async fn find(&self, params: QueryParams, ctx: &OperationContext) -> EntityResult<Vec<Value>> {
        let adapter = self.pool.get_adapter(ctx).await?;
        let params = self.scoped(params.clamp_limit(self.settings.max_limit), ctx).await?;
        let docs = adapter.find(&self.find_params(&params)).await?;
        debug!(found = docs.len(), "Found entities");
        self.transformer
            .transform_result(adapter.as_ref(), docs, &params, ctx)
            .await
    }

    /// Finds the first entity matching `params`.
    #[instrument(skip_all, fields(service = %self.name))]
    pub async fn find_one(&self, params: QueryParams, ctx: &OperationContext) -> EntityResult<Option<Value>> {
        let adapter = self.pool.get_adapter(ctx).await?;
        let params = self.scoped(params, ctx).await?;
        let Some(doc) = adapter.find_one(&self.find_params(&params)).await? else {
            return Ok(None);
        };
        let entities = self
            .transformer
            .transform_result(adapter.as_ref(), vec![doc], &params, ctx)
            .await?;
        Ok(entities.into_iter().next())
    }

    /// Counts entities matching `params`. Limit and offset are ignored.
    #[instrument(skip_all, fields(service = %self.name))]
    pub async fn count(&self, mut params: QueryParams, ctx: &OperationContext) -> EntityResult<u64> {
        params.limit = None;
        params.offset = None;
        let adapter = self.pool.get_adapter(ctx).await?;
        let params = self.scoped(params, ctx).await?;
        adapter.count(&self.find_params(&params)).await
    }

    /// Returns one page of entities and the total count, fetched
    /// concurrently.
    #[instrument(skip_all, fields(service = %self.name))]
    pub async fn list(&self, mut params: QueryParams, ctx: &OperationContext) -> EntityResult<ListResult> {
        let (page, page_size) =
            params.paginate(self.settings.default_page_size, self.settings.max_limit);
        let (rows, total) = tokio::try_join!(self.find(params.clone(), ctx), self.count(params, ctx))?;
        Ok(ListResult {
            rows,
            total,
            page,
            page_size,
            total_pages: total.div_ceil(page_size as u64),
        })
    }

    /// Resolves entities by id.
    ///
    /// Returns the entity (or `null`) for a single id, the found entities
    /// in request order for an id array, or an object keyed by the
    /// requested ids with [`ResolveParams::mapping`].
    #[instrument(skip_all, fields(service = %self.name))]
    pub async fn resolve(&self, params: ResolveParams, ctx: &OperationContext) -> EntityResult<Value> {
        let ResolveParams {
            id,
            fields,
            populate,
            scope,
            mapping,
            throw_if_not_found,
        } = params;

        let multi = id.is_array();
        let requested = match id {
            Value::Array(ids) => ids,
            Value::Null => return Err(self.missing_id()),
            id => vec![id],
        };
        let decoded = requested
            .iter()
            .map(|id| self.decode_id(id))
            .collect::<EntityResult<Vec<_>>>()?;

        let adapter = self.pool.get_adapter(ctx).await?;
        let query = QueryParams {
            fields,
            populate,
            scope,
            ..QueryParams::default()
        };
        let (params, found) = self.fetch_by_ids(adapter.as_ref(), &decoded, query, ctx).await?;

        if throw_if_not_found {
            let missing: Vec<Value> = requested
                .iter()
                .zip(&found)
                .filter(|(_, doc)| doc.is_none())
                .map(|(id, _)| id.clone())
                .collect();
            if !missing.is_empty() {
                return Err(ResourceError::NotFound {
                    entity: self.name.clone(),
                    ids: missing,
                }
                .into());
            }
        }

        let docs: Vec<Document> = found.iter().flatten().cloned().collect();
        let mut entities = self
            .transformer
            .transform_result(adapter.as_ref(), docs, &params, ctx)
            .await?
            .into_iter();
        let pairs: Vec<(&Value, Value)> = requested
            .iter()
            .zip(&found)
            .filter(|(_, doc)| doc.is_some())
            .filter_map(|(id, _)| entities.next().map(|entity| (id, entity)))
            .collect();

        Ok(if mapping {
            Value::Object(pairs.into_iter().map(|(id, entity)| (id_key(id), entity)).collect())
        } else if multi {
            Value::Array(pairs.into_iter().map(|(_, entity)| entity).collect())
        } else {
            pairs.into_iter().next().map_or(Value::Null, |(_, entity)| entity)
        })
    }

    // ---- writes ----

    /// Creates an entity.
    pub async fn create(&self, params: Value, ctx: &OperationContext) -> EntityResult<Value> {
        self.create_with(params, MutateOptions::default(), ctx).await
    }

    /// Creates an entity with explicit options.
    #[instrument(skip_all, fields(service = %self.name))]
    pub async fn create_with(
        &self,
        params: Value,
        options: MutateOptions,
        ctx: &OperationContext,
    ) -> EntityResult<Value> {
        let mut input = into_object(params)?;
        self.decode_input_id(&mut input)?;
        let adapter = self.pool.get_adapter(ctx).await?;

        let write = self.write_options(adapter.as_ref(), None, options);
        let changes = self.validator.validate(Operation::Create, &input, ctx, &write).await?;
        let stored = adapter
            .insert(changes)
            .await
            .map_err(|err| write_failed(adapter.name(), err))?;

        let entity = self.transform_one(adapter.as_ref(), stored, ctx).await?;
        self.notify(Operation::Create, entity.clone(), None, ChangeOptions::default(), ctx)
            .await;
        Ok(entity)
    }

    /// Creates several entities.
    ///
    /// Every payload is validated before anything is written. Returns the
    /// created entities, or only their ids when `return_entities` is false.
    #[instrument(skip_all, fields(service = %self.name, count = params.len()))]
    pub async fn create_many(
        &self,
        params: Vec<Value>,
        return_entities: bool,
        ctx: &OperationContext,
    ) -> EntityResult<Vec<Value>> {
        let mut inputs = params
            .into_iter()
            .map(into_object)
            .collect::<EntityResult<Vec<_>>>()?;
        for input in &mut inputs {
            self.decode_input_id(input)?;
        }
        let adapter = self.pool.get_adapter(ctx).await?;

        let write = self.write_options(adapter.as_ref(), None, MutateOptions::default());
        let changes = try_join_all(
            inputs
                .iter()
                .map(|input| self.validator.validate(Operation::Create, input, ctx, &write)),
        )
        .await?;

        let inserted = adapter
            .insert_many(changes, return_entities)
            .await
            .map_err(|err| write_failed(adapter.name(), err))?;
        let created = match inserted {
            InsertManyResult::Entities(docs) => {
                self.transformer
                    .transform_result(adapter.as_ref(), docs, &QueryParams::new(), ctx)
                    .await?
            }
            InsertManyResult::Ids(ids) => ids
                .iter()
                .map(|id| self.encode_id(id))
                .collect::<EntityResult<Vec<_>>>()?,
        };

        self.notify(
            Operation::Create,
            Value::Array(created.clone()),
            None,
            ChangeOptions::batch(),
            ctx,
        )
        .await;
        Ok(created)
    }

    /// Updates the entity named by the primary key in `params`.
    pub async fn update(&self, params: Value, ctx: &OperationContext) -> EntityResult<Value> {
        self.update_with(params, MutateOptions::default(), ctx).await
    }

    /// Updates an entity with explicit options.
    #[instrument(skip_all, fields(service = %self.name))]
    pub async fn update_with(
        &self,
        params: Value,
        options: MutateOptions,
        ctx: &OperationContext,
    ) -> EntityResult<Value> {
        let mut input = into_object(params)?;
        let (requested, id) = self.take_id(&mut input)?;
        let adapter = self.pool.get_adapter(ctx).await?;
        let existing = self.load_existing(adapter.as_ref(), &requested, &id, ctx).await?;

        let (entity, old) = self
            .update_document(adapter.as_ref(), existing, input, options, ctx)
            .await?;
        self.notify(Operation::Update, entity.clone(), Some(old), ChangeOptions::default(), ctx)
            .await;
        Ok(entity)
    }

    /// Applies `changes` to every entity matching `query` (scopes apply).
    ///
    /// Each entity goes through the update pipeline on its own. Returns the
    /// updated entities.
    #[instrument(skip_all, fields(service = %self.name))]
    pub async fn update_many(
        &self,
        query: Value,
        changes: Value,
        ctx: &OperationContext,
    ) -> EntityResult<Vec<Value>> {
        let changes = into_object(changes)?;
        let adapter = self.pool.get_adapter(ctx).await?;
        let docs = self.find_documents(adapter.as_ref(), query, ctx).await?;

        let results = try_join_all(docs.into_iter().map(|doc| {
            self.update_document(adapter.as_ref(), doc, changes.clone(), MutateOptions::default(), ctx)
        }))
        .await?;
        let updated: Vec<Value> = results.into_iter().map(|(entity, _)| entity).collect();

        self.notify(
            Operation::Update,
            Value::Array(updated.clone()),
            None,
            ChangeOptions::batch(),
            ctx,
        )
        .await;
        Ok(updated)
    }

    /// Passes update operators (`$set`, `$unset`, `$inc`) straight to the
    /// backend for every entity matching `query`. No validation runs.
    /// Returns the number of updated entities.
    #[instrument(skip_all, fields(service = %self.name))]
    pub async fn update_many_raw(
        &self,
        query: Value,
        changes: Value,
        ctx: &OperationContext,
    ) -> EntityResult<u64> {
        let changes = into_object(changes)?;
        let adapter = self.pool.get_adapter(ctx).await?;
        let params = self
            .scoped(QueryParams::new().with_query(Value::Object(into_object(query)?)), ctx)
            .await?;
        let updated = adapter
            .update_many(&self.find_params(&params).filter, changes, true)
            .await?;

        let options = ChangeOptions {
            batch: true,
            raw: true,
            ..ChangeOptions::default()
        };
        self.notify(Operation::Update, json!(updated), None, options, ctx)
            .await;
        Ok(updated)
    }

    /// Replaces the entity named by the primary key in `params`.
    pub async fn replace(&self, params: Value, ctx: &OperationContext) -> EntityResult<Value> {
        self.replace_with(params, MutateOptions::default(), ctx).await
    }

    /// Replaces an entity with explicit options.
    #[instrument(skip_all, fields(service = %self.name))]
    pub async fn replace_with(
        &self,
        params: Value,
        options: MutateOptions,
        ctx: &OperationContext,
    ) -> EntityResult<Value> {
        let mut input = into_object(params)?;
        let (requested, id) = self.take_id(&mut input)?;
        let adapter = self.pool.get_adapter(ctx).await?;
        let existing = self.load_existing(adapter.as_ref(), &requested, &id, ctx).await?;

        let write = self.write_options(adapter.as_ref(), Some(&existing), options);
        let mut doc = self.validator.validate(Operation::Replace, &input, ctx, &write).await?;
        doc.insert(self.fields.primary().column_name.clone(), id.clone());
        let stored = adapter
            .replace_by_id(&id, doc)
            .await?
            .ok_or_else(|| self.not_found(&requested))?;

        let (entity, old) = tokio::try_join!(
            self.transform_one(adapter.as_ref(), stored, ctx),
            self.transform_one(adapter.as_ref(), existing, ctx),
        )?;
        self.notify(Operation::Replace, entity.clone(), Some(old), ChangeOptions::default(), ctx)
            .await;
        Ok(entity)
    }

    /// Removes the entity named by the primary key in `params`.
    ///
    /// With soft delete the tombstone changes are written instead and the
    /// updated entity is returned; otherwise the removed entity is.
    #[instrument(skip_all, fields(service = %self.name))]
    pub async fn remove(&self, params: Value, ctx: &OperationContext) -> EntityResult<Value> {
        let mut input = into_object(params)?;
        let (requested, id) = self.take_id(&mut input)?;
        let adapter = self.pool.get_adapter(ctx).await?;
        let existing = self.load_existing(adapter.as_ref(), &requested, &id, ctx).await?;

        let soft_delete = self.fields.soft_delete();
        let entity = self
            .remove_document(adapter.as_ref(), existing, &input, ctx)
            .await?;
        let options = ChangeOptions {
            soft_delete,
            ..ChangeOptions::default()
        };
        self.notify(Operation::Remove, entity.clone(), None, options, ctx)
            .await;
        Ok(entity)
    }

    /// Removes every entity matching `query` (scopes apply) and returns
    /// them.
    #[instrument(skip_all, fields(service = %self.name))]
    pub async fn remove_many(&self, query: Value, ctx: &OperationContext) -> EntityResult<Vec<Value>> {
        let adapter = self.pool.get_adapter(ctx).await?;
        let docs = self.find_documents(adapter.as_ref(), query, ctx).await?;
        let soft_delete = self.fields.soft_delete();

        let removed = if soft_delete {
            let input = Map::new();
            try_join_all(
                docs.into_iter()
                    .map(|doc| self.remove_document(adapter.as_ref(), doc, &input, ctx)),
            )
            .await?
        } else {
            let column = &self.fields.primary().column_name;
            let ids: Vec<Value> = docs.iter().filter_map(|doc| doc.get(column).cloned()).collect();
            let entities = self
                .transformer
                .transform_result(adapter.as_ref(), docs, &QueryParams::new(), ctx)
                .await?;
            if !ids.is_empty() {
                let mut filter = Map::new();
                filter.insert(column.clone(), json!({ "$in": ids }));
                let count = adapter.remove_many(&filter).await?;
                debug!(count, "Removed entities");
            }
            entities
        };

        let options = ChangeOptions {
            batch: true,
            soft_delete,
            ..ChangeOptions::default()
        };
        self.notify(Operation::Remove, Value::Array(removed.clone()), None, options, ctx)
            .await;
        Ok(removed)
    }

    /// Removes every entity of the tenant's collection, bypassing scopes
    /// and soft delete. Returns how many there were.
    #[instrument(skip_all, fields(service = %self.name))]
    pub async fn clear(&self, ctx: &OperationContext) -> EntityResult<u64> {
        let adapter = self.pool.get_adapter(ctx).await?;
        let count = adapter.clear().await?;
        self.notify(ChangeOperation::Clear, json!(count), None, ChangeOptions::batch(), ctx)
            .await;
        Ok(count)
    }

    /// Creates an index. Field names are translated to columns.
    pub async fn create_index(&self, definition: IndexDefinition, ctx: &OperationContext) -> EntityResult<()> {
        let adapter = self.pool.get_adapter(ctx).await?;
        adapter.create_index(&self.index_to_columns(definition)).await
    }

    /// Removes an index. Field names are translated to columns.
    pub async fn remove_index(&self, definition: IndexDefinition, ctx: &OperationContext) -> EntityResult<()> {
        let adapter = self.pool.get_adapter(ctx).await?;
        adapter.remove_index(&self.index_to_columns(definition)).await
    }

    // ---- pipeline steps ----

    async fn scoped(&self, params: QueryParams, ctx: &OperationContext) -> EntityResult<QueryParams> {
        self.scopes.apply_scopes(params, ctx).await
    }

    /// Scoped raw documents matching a caller filter.
    async fn find_documents(
        &self,
        adapter: &dyn Adapter,
        query: Value,
        ctx: &OperationContext,
    ) -> EntityResult<Vec<Document>> {
        let params = self
            .scoped(QueryParams::new().with_query(Value::Object(into_object(query)?)), ctx)
            .await?;
        adapter.find(&self.find_params(&params)).await
    }

    /// Scoped lookup by decoded ids. The result is aligned with `ids`.
    async fn fetch_by_ids(
        &self,
        adapter: &dyn Adapter,
        ids: &[Value],
        params: QueryParams,
        ctx: &OperationContext,
    ) -> EntityResult<(QueryParams, Vec<Option<Document>>)> {
        if ids.is_empty() {
            return Ok((params, Vec::new()));
        }
        let primary = self.fields.primary();
        let mut filter = Map::new();
        filter.insert(primary.name.clone(), json!({ "$in": ids }));
        let params = self.scoped(params.with_query(Value::Object(filter)), ctx).await?;

        let docs = adapter.find(&self.find_params(&params)).await?;
        let by_id: HashMap<String, Document> = docs
            .into_iter()
            .filter_map(|doc| Some((id_key(doc.get(&primary.column_name)?), doc)))
            .collect();
        let found = ids.iter().map(|id| by_id.get(&id_key(id)).cloned()).collect();
        Ok((params, found))
    }

    async fn load_existing(
        &self,
        adapter: &dyn Adapter,
        requested: &Value,
        id: &Value,
        ctx: &OperationContext,
    ) -> EntityResult<Document> {
        let (_, found) = self
            .fetch_by_ids(adapter, std::slice::from_ref(id), QueryParams::new(), ctx)
            .await?;
        found
            .into_iter()
            .flatten()
            .next()
            .ok_or_else(|| self.not_found(requested))
    }

    /// Validates and writes `input` as changes to `existing`. Returns the
    /// updated and the previous entity.
    async fn update_document(
        &self,
        adapter: &dyn Adapter,
        existing: Document,
        mut input: Map<String, Value>,
        options: MutateOptions,
        ctx: &OperationContext,
    ) -> EntityResult<(Value, Value)> {
        let primary = self.fields.primary();
        let id = existing
            .get(&primary.column_name)
            .cloned()
            .ok_or_else(|| self.missing_id())?;
        input.insert(primary.name.clone(), id.clone());

        let write = self.write_options(adapter, Some(&existing), options);
        let changes = self.validator.validate(Operation::Update, &input, ctx, &write).await?;
        let stored = if changes.is_empty() {
            debug!(id = %id_key(&id), "Update has no changes");
            existing.clone()
        } else {
            adapter
                .update_by_id(&id, changes, false)
                .await?
                .ok_or_else(|| self.not_found(&id))?
        };

        tokio::try_join!(
            self.transform_one(adapter, stored, ctx),
            self.transform_one(adapter, existing, ctx),
        )
    }

    async fn remove_document(
        &self,
        adapter: &dyn Adapter,
        existing: Document,
        input: &Map<String, Value>,
        ctx: &OperationContext,
    ) -> EntityResult<Value> {
        let id = existing
            .get(&self.fields.primary().column_name)
            .cloned()
            .ok_or_else(|| self.missing_id())?;

        if !self.fields.soft_delete() {
            let entity = self.transform_one(adapter, existing, ctx).await?;
            adapter
                .remove_by_id(&id)
                .await?
                .ok_or_else(|| self.not_found(&id))?;
            return Ok(entity);
        }

        let write = self.write_options(adapter, Some(&existing), MutateOptions::default());
        let tombstone = self.validator.validate(Operation::Remove, input, ctx, &write).await?;
        let stored = adapter
            .update_by_id(&id, tombstone, false)
            .await?
            .ok_or_else(|| self.not_found(&id))?;
        self.transform_one(adapter, stored, ctx).await
    }

    async fn transform_one(
        &self,
        adapter: &dyn Adapter,
        doc: Document,
        ctx: &OperationContext,
    ) -> EntityResult<Value> {
        let entities = self
            .transformer
            .transform_result(adapter, vec![doc], &QueryParams::new(), ctx)
            .await?;
        Ok(entities.into_iter().next().unwrap_or(Value::Null))
    }

    fn write_options(
        &self,
        adapter: &dyn Adapter,
        previous: Option<&Document>,
        options: MutateOptions,
    ) -> WriteOptions {
        let native = adapter.has_native_structured_fields();
        let mut write = WriteOptions::new().with_native_structured(native);
        write.permissive = options.permissive;
        if let Some(doc) = previous {
            let stored = adapter.entity_to_json(doc.clone());
            write = write.with_previous(self.transformer.decode_document(&stored, native));
        }
        write
    }

    async fn notify(
        &self,
        operation: impl Into<ChangeOperation>,
        new_data: Value,
        old_data: Option<Value>,
        options: ChangeOptions,
        ctx: &OperationContext,
    ) {
        let event = ChangeEvent::new(
            self.settings.entity_changed_event_type.as_str(),
            self.name.as_str(),
            operation,
            new_data,
        )
        .with_old_data(old_data)
        .with_options(options)
        .with_tenant(ctx.tenant_id().map(|t| t.as_str().to_string()));
        self.notifier.notify(event).await;
    }

    // ---- ids ----

    fn decode_id(&self, id: &Value) -> EntityResult<Value> {
        if self.fields.primary().secure {
            self.transformer.codec().decode(id)
        } else {
            Ok(id.clone())
        }
    }

    fn encode_id(&self, id: &Value) -> EntityResult<Value> {
        if self.fields.primary().secure {
            self.transformer.codec().encode(id)
        } else {
            Ok(id.clone())
        }
    }

    /// Decodes a caller-supplied primary key in place, if present.
    fn decode_input_id(&self, input: &mut Map<String, Value>) -> EntityResult<()> {
        let name = &self.fields.primary().name;
        if let Some(id) = input.get(name).filter(|id| !id.is_null()) {
            let decoded = self.decode_id(id)?;
            input.insert(name.clone(), decoded);
        }
        Ok(())
    }

    /// Returns the requested and the decoded primary key of a payload.
    fn take_id(&self, input: &mut Map<String, Value>) -> EntityResult<(Value, Value)> {
        let name = &self.fields.primary().name;
        let requested = match input.get(name) {
            Some(id) if !id.is_null() => id.clone(),
            _ => return Err(self.missing_id()),
        };
        let decoded = self.decode_id(&requested)?;
        input.insert(name.clone(), decoded.clone());
        Ok((requested, decoded))
    }

    fn missing_id(&self) -> EntityError {
        ResourceError::MissingId {
            entity: self.name.clone(),
        }
        .into()
    }

    fn not_found(&self, id: &Value) -> EntityError {
        ResourceError::NotFound {
            entity: self.name.clone(),
            ids: vec![id.clone()],
        }
        .into()
    }

    // ---- field names to columns ----

    fn find_params(&self, params: &QueryParams) -> FindParams {
        let mut find = FindParams::from(params);
        find.filter = self.filter_to_columns(&find.filter);
        find.sort = find
            .sort
            .iter()
            .map(|key| match key.strip_prefix('-') {
                Some(path) => format!("-{}", self.column_path(path)),
                None => self.column_path(key),
            })
            .collect();
        find.search_fields = find
            .search_fields
            .iter()
            .map(|path| self.column_path(path))
            .collect();
        find
    }

    fn filter_to_columns(&self, filter: &Map<String, Value>) -> Map<String, Value> {
        filter
            .iter()
            .map(|(key, value)| {
                if let Some(operator) = key.strip_prefix('$') {
                    let value = match (operator, value) {
                        ("and" | "or", Value::Array(parts)) => Value::Array(
                            parts
                                .iter()
                                .map(|part| match part {
                                    Value::Object(map) => Value::Object(self.filter_to_columns(map)),
                                    other => other.clone(),
                                })
                                .collect(),
                        ),
                        _ => value.clone(),
                    };
                    (key.clone(), value)
                } else {
                    (self.column_path(key), value.clone())
                }
            })
            .collect()
    }

    fn column_path(&self, path: &str) -> String {
        column_path(self.fields.fields(), path)
    }

    fn index_to_columns(&self, mut definition: IndexDefinition) -> IndexDefinition {
        definition.fields = definition
            .fields
            .iter()
            .map(|path| self.column_path(path))
            .collect();
        definition
    }
}

/// Maps a dotted field path to its column path. Unknown segments pass
/// through unchanged.
fn column_path(fields: &[FieldDescriptor], path: &str) -> String {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let Some(field) = fields.iter().find(|f| f.name == head) else {
        return path.to_string();
    };
    match rest {
        None => field.column_name.clone(),
        Some(rest) => {
            let children = field
                .properties
                .as_deref()
                .or_else(|| field.items.as_ref().and_then(|item| item.properties.as_deref()))
                .unwrap_or_default();
            format!("{}.{}", field.column_name, column_path(children, rest))
        }
    }
}

fn into_object(value: Value) -> EntityResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ValidationError::single(
            ValidationDetail::new("params", ValidationKind::Type, "expected an object")
                .with_actual(other),
        )
        .into()),
    }
}

/// Insert failures surface as write errors.
fn write_failed(backend: &str, err: EntityError) -> EntityError {
    match err {
        EntityError::Backend(BackendError::WriteFailed { .. }) => err,
        other => BackendError::WriteFailed {
            backend_name: backend.to_string(),
            message: other.to_string(),
            source: Some(Box::new(other)),
        }
        .into(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::field::{FieldSpec, FieldType};

    fn fields() -> Vec<FieldDescriptor> {
        let declarations = Declarations::new()
            .field("title", FieldSpec::new(FieldType::String).column("post_title"))
            .field(
                "meta",
                FieldSpec::new(FieldType::Object).column("m").property("views", FieldSpec::new(FieldType::Integer).column("v")),
            );
        crate::field::compile(&declarations).unwrap().fields().to_vec()
    }

    #[test]
    fn test_column_path() {
        let fields = fields();
        assert_eq!(column_path(&fields, "title"), "post_title");
        assert_eq!(column_path(&fields, "meta.views"), "m.v");
        assert_eq!(column_path(&fields, "meta.other"), "m.other");
        assert_eq!(column_path(&fields, "id"), "_id");
        assert_eq!(column_path(&fields, "unknown.x"), "unknown.x");
    }

    #[tokio::test]
    async fn test_filter_sort_and_index_translation() {
        let service = EntityService::builder(
            "posts",
            Declarations::new().field("title", FieldSpec::new(FieldType::String).column("post_title")),
        )
        .build()
        .unwrap();

        let params = QueryParams::new()
            .with_query(json!({"title": "a", "$or": [{"id": 1}, {"votes": 2}]}))
            .with_sort(["-title", "id"])
            .with_search_fields(["title"]);
        let find = service.find_params(&params);
        assert_eq!(
            Value::Object(find.filter),
            json!({"post_title": "a", "$or": [{"_id": 1}, {"votes": 2}]})
        );
        assert_eq!(find.sort, vec!["-post_title", "_id"]);
        assert_eq!(find.search_fields, vec!["post_title"]);

        let index = service.index_to_columns(IndexDefinition::new(["title"]));
        assert_eq!(index.fields, vec!["post_title"]);
    }

    #[test]
    fn test_insert_errors_wrapped() {
        let err = write_failed(
            "memory",
            BackendError::Internal {
                backend_name: "memory".to_string(),
                message: "disk full".to_string(),
                source: None,
            }
            .into(),
        );
        assert!(matches!(err, EntityError::Backend(BackendError::WriteFailed { .. })));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_non_object_params_rejected() {
        let err = into_object(json!([1])).unwrap_err();
        assert!(err.as_validation().unwrap().has("params", ValidationKind::Type));
    }

    #[test]
    fn test_resolve_params_from_json() {
        let params: ResolveParams =
            serde_json::from_value(json!({"id": [1, 2], "mapping": true, "scope": false})).unwrap();
        assert_eq!(params.id, json!([1, 2]));
        assert!(params.mapping);
        assert_eq!(params.scope, Some(ScopeSelection::Disabled));
        assert!(!params.throw_if_not_found);
    }
}
