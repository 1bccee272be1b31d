//! In-process document adapter.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

use crate::error::{BackendError, EntityResult};

use super::filter::{apply_changes, matches_filter, select};
use super::{
    Adapter, AdapterConfig, AdapterKind, Document, FindParams, IndexDefinition, InsertManyResult,
    id_key,
};

#[derive(Debug, Default)]
struct Collection {
    /// Documents in insertion order.
    docs: Vec<Document>,
    indexes: HashMap<String, IndexDefinition>,
}

impl Collection {
    fn position(&self, id_column: &str, id: &Value) -> Option<usize> {
        let key = id_key(id);
        self.docs
            .iter()
            .position(|doc| doc.get(id_column).is_some_and(|v| id_key(v) == key))
    }

    /// Rejects a document violating a unique index. `skip` is the position
    /// of the document being replaced.
    fn check_unique(&self, doc: &Document, skip: Option<usize>) -> EntityResult<()> {
        for index in self.indexes.values().filter(|i| i.unique) {
            let key: Vec<Option<&Value>> = index.fields.iter().map(|f| doc.get(f)).collect();
            let clash = self.docs.iter().enumerate().any(|(pos, other)| {
                Some(pos) != skip
                    && index
                        .fields
                        .iter()
                        .zip(&key)
                        .all(|(f, v)| other.get(f) == *v)
            });
            if clash {
                return Err(BackendError::WriteFailed {
                    backend_name: "memory".to_string(),
                    message: format!("duplicate key for unique index {}", index.index_name()),
                    source: None,
                }
                .into());
            }
        }
        Ok(())
    }
}

/// One shared in-process database: collections by name.
#[derive(Debug, Default)]
struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

/// Hands out shared in-process stores keyed by connection signature.
///
/// The registry only holds weak references: a store lives as long as some
/// connected adapter holds it and is dropped with the last one.
#[derive(Default)]
pub struct MemoryStoreRegistry {
    stores: Mutex<HashMap<String, Weak<MemoryStore>>>,
}

impl fmt::Debug for MemoryStoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStoreRegistry")
            .field("live_stores", &self.live_stores())
            .finish()
    }
}

impl MemoryStoreRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the store for a signature, creating it if needed.
    fn acquire(&self, signature: &str) -> Arc<MemoryStore> {
        let mut stores = self.stores.lock();
        stores.retain(|_, weak| weak.strong_count() > 0);
        if let Some(store) = stores.get(signature).and_then(Weak::upgrade) {
            return store;
        }
        let store = Arc::new(MemoryStore::default());
        stores.insert(signature.to_string(), Arc::downgrade(&store));
        debug!(signature = %signature, "Created memory store");
        store
    }

    /// Returns the number of stores still referenced by an adapter.
    pub fn live_stores(&self) -> usize {
        self.stores
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// In-process document adapter.
///
/// Ids are generated as UUID v4 strings when a document arrives without one.
/// Structured values are stored natively.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use helios_entity::adapter::{Adapter, AdapterConfig, MemoryAdapter, MemoryStoreRegistry};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let adapter = MemoryAdapter::new(AdapterConfig::memory("posts"), Arc::new(MemoryStoreRegistry::new()));
/// adapter.connect().await.unwrap();
///
/// let doc = adapter
///     .insert(json!({"title": "Hello"}).as_object().unwrap().clone())
///     .await
///     .unwrap();
/// let id = doc["_id"].clone();
/// assert!(adapter.find_by_id(&id).await.unwrap().is_some());
/// # });
/// ```
pub struct MemoryAdapter {
    config: AdapterConfig,
    registry: Arc<MemoryStoreRegistry>,
    store: RwLock<Option<Arc<MemoryStore>>>,
}

impl fmt::Debug for MemoryAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAdapter")
            .field("collection", &self.config.collection)
            .field("signature", &self.config.signature())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl MemoryAdapter {
    /// Creates an unconnected adapter.
    pub fn new(config: AdapterConfig, registry: Arc<MemoryStoreRegistry>) -> Self {
        Self {
            config,
            registry,
            store: RwLock::new(None),
        }
    }

    /// Returns the adapter configuration.
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    fn store(&self) -> EntityResult<Arc<MemoryStore>> {
        self.store.read().clone().ok_or_else(|| {
            BackendError::NotConnected {
                backend_name: "memory".to_string(),
            }
            .into()
        })
    }

    /// Collection name, namespaced by schema when one is set.
    fn collection_name(&self) -> String {
        match &self.config.schema {
            Some(schema) => format!("{}.{}", schema, self.config.collection),
            None => self.config.collection.clone(),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Collection) -> R) -> EntityResult<R> {
        let store = self.store()?;
        let collections = store.collections.read();
        let empty = Collection::default();
        let collection = collections.get(&self.collection_name()).unwrap_or(&empty);
        Ok(f(collection))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Collection) -> EntityResult<R>) -> EntityResult<R> {
        let store = self.store()?;
        let mut collections = store.collections.write();
        let collection = collections.entry(self.collection_name()).or_default();
        f(collection)
    }

    fn with_id(&self, mut doc: Document) -> Document {
        let missing = doc.get(&self.config.id_column).is_none_or(Value::is_null);
        if missing {
            doc.insert(
                self.config.id_column.clone(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
        doc
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn name(&self) -> &str {
        "memory"
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Memory
    }

    fn has_native_structured_fields(&self) -> bool {
        true
    }

    async fn connect(&self) -> EntityResult<()> {
        let store = self.registry.acquire(&self.config.signature());
        *self.store.write() = Some(store);
        Ok(())
    }

    async fn disconnect(&self) -> EntityResult<()> {
        self.store.write().take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.store.read().is_some()
    }

    async fn find(&self, params: &FindParams) -> EntityResult<Vec<Document>> {
        self.read(|c| select(&c.docs, params))
    }

    async fn find_by_id(&self, id: &Value) -> EntityResult<Option<Document>> {
        let id_column = &self.config.id_column;
        self.read(|c| c.position(id_column, id).map(|pos| c.docs[pos].clone()))
    }

    async fn find_by_ids(&self, ids: &[Value]) -> EntityResult<Vec<Document>> {
        let keys: Vec<String> = ids.iter().map(id_key).collect();
        let id_column = &self.config.id_column;
        self.read(|c| {
            c.docs
                .iter()
                .filter(|doc| doc.get(id_column).is_some_and(|v| keys.contains(&id_key(v))))
                .cloned()
                .collect()
        })
    }

    async fn count(&self, params: &FindParams) -> EntityResult<u64> {
        let mut params = params.clone();
        params.limit = None;
        params.offset = None;
        params.sort.clear();
        self.read(|c| select(&c.docs, &params).len() as u64)
    }

    async fn insert(&self, entity: Document) -> EntityResult<Document> {
        let doc = self.with_id(entity);
        let id_column = self.config.id_column.clone();
        self.write(|c| {
            if let Some(id) = doc.get(&id_column) {
                if c.position(&id_column, id).is_some() {
                    return Err(BackendError::WriteFailed {
                        backend_name: "memory".to_string(),
                        message: format!("duplicate id {}", id_key(id)),
                        source: None,
                    }
                    .into());
                }
            }
            c.check_unique(&doc, None)?;
            c.docs.push(doc.clone());
            Ok(doc)
        })
    }

    async fn insert_many(
        &self,
        entities: Vec<Document>,
        return_entities: bool,
    ) -> EntityResult<InsertManyResult> {
        let mut stored = Vec::with_capacity(entities.len());
        for entity in entities {
            stored.push(self.insert(entity).await?);
        }
        if return_entities {
            Ok(InsertManyResult::Entities(stored))
        } else {
            let ids = stored
                .into_iter()
                .filter_map(|mut doc| doc.remove(&self.config.id_column))
                .collect();
            Ok(InsertManyResult::Ids(ids))
        }
    }

    async fn update_by_id(
        &self,
        id: &Value,
        changes: Document,
        raw: bool,
    ) -> EntityResult<Option<Document>> {
        let id_column = self.config.id_column.clone();
        self.write(|c| {
            let Some(pos) = c.position(&id_column, id) else {
                return Ok(None);
            };
            let mut doc = c.docs[pos].clone();
            apply_changes(&mut doc, changes, raw)?;
            c.check_unique(&doc, Some(pos))?;
            c.docs[pos] = doc.clone();
            Ok(Some(doc))
        })
    }

    async fn update_many(
        &self,
        filter: &Document,
        changes: Document,
        raw: bool,
    ) -> EntityResult<u64> {
        self.write(|c| {
            let mut updated = 0;
            for doc in c.docs.iter_mut().filter(|doc| matches_filter(doc, filter)) {
                apply_changes(doc, changes.clone(), raw)?;
                updated += 1;
            }
            Ok(updated)
        })
    }

    async fn replace_by_id(&self, id: &Value, entity: Document) -> EntityResult<Option<Document>> {
        let id_column = self.config.id_column.clone();
        self.write(|c| {
            let Some(pos) = c.position(&id_column, id) else {
                return Ok(None);
            };
            let mut doc = entity;
            doc.insert(id_column.clone(), id.clone());
            c.check_unique(&doc, Some(pos))?;
            c.docs[pos] = doc.clone();
            Ok(Some(doc))
        })
    }

    async fn remove_by_id(&self, id: &Value) -> EntityResult<Option<Value>> {
        let id_column = self.config.id_column.clone();
        self.write(|c| {
            Ok(c.position(&id_column, id).map(|pos| {
                c.docs.remove(pos);
                id.clone()
            }))
        })
    }

    async fn remove_many(&self, filter: &Document) -> EntityResult<u64> {
        self.write(|c| {
            let before = c.docs.len();
            c.docs.retain(|doc| !matches_filter(doc, filter));
            Ok((before - c.docs.len()) as u64)
        })
    }

    async fn clear(&self) -> EntityResult<u64> {
        self.write(|c| {
            let count = c.docs.len() as u64;
            c.docs.clear();
            Ok(count)
        })
    }

    async fn create_index(&self, definition: &IndexDefinition) -> EntityResult<()> {
        self.write(|c| {
            c.indexes
                .insert(definition.index_name(), definition.clone());
            Ok(())
        })
    }

    async fn remove_index(&self, definition: &IndexDefinition) -> EntityResult<()> {
        self.write(|c| {
            c.indexes.remove(&definition.index_name());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn connected(registry: &Arc<MemoryStoreRegistry>, config: AdapterConfig) -> MemoryAdapter {
        let adapter = MemoryAdapter::new(config, Arc::clone(registry));
        adapter.connect().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_crud_roundtrip() {
        let registry = Arc::new(MemoryStoreRegistry::new());
        let adapter = connected(&registry, AdapterConfig::memory("posts")).await;

        let stored = adapter.insert(doc(json!({"title": "a", "votes": 1}))).await.unwrap();
        let id = stored["_id"].clone();
        assert!(id.is_string());

        let updated = adapter
            .update_by_id(&id, doc(json!({"votes": 2})), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated["votes"], json!(2));
        assert_eq!(updated["title"], json!("a"));

        let replaced = adapter
            .replace_by_id(&id, doc(json!({"title": "b"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replaced, doc(json!({"_id": id.clone(), "title": "b"})));

        assert_eq!(adapter.remove_by_id(&id).await.unwrap(), Some(id.clone()));
        assert!(adapter.find_by_id(&id).await.unwrap().is_none());
        assert_eq!(adapter.remove_by_id(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let adapter = MemoryAdapter::new(AdapterConfig::memory("posts"), Arc::new(MemoryStoreRegistry::new()));
        let err = adapter.find(&FindParams::new()).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::EntityError::Backend(BackendError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_same_signature_shares_store() {
        let registry = Arc::new(MemoryStoreRegistry::new());
        let a = connected(&registry, AdapterConfig::memory("posts").with_connection("db")).await;
        let b = connected(&registry, AdapterConfig::memory("posts").with_connection("db")).await;
        let other = connected(&registry, AdapterConfig::memory("posts").with_connection("db2")).await;

        a.insert(doc(json!({"title": "shared"}))).await.unwrap();
        assert_eq!(b.count(&FindParams::new()).await.unwrap(), 1);
        assert_eq!(other.count(&FindParams::new()).await.unwrap(), 0);
        assert_eq!(registry.live_stores(), 2);

        a.disconnect().await.unwrap();
        b.disconnect().await.unwrap();
        assert_eq!(registry.live_stores(), 1);
    }

    #[tokio::test]
    async fn test_schema_namespaces_collections() {
        let registry = Arc::new(MemoryStoreRegistry::new());
        let a = connected(&registry, AdapterConfig::memory("posts").with_schema("t1")).await;
        let b = connected(&registry, AdapterConfig::memory("posts").with_schema("t2")).await;
        a.insert(doc(json!({"x": 1}))).await.unwrap();
        assert_eq!(b.count(&FindParams::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bulk_operations() {
        let registry = Arc::new(MemoryStoreRegistry::new());
        let adapter = connected(&registry, AdapterConfig::memory("posts")).await;
        let ids = match adapter
            .insert_many(
                vec![
                    doc(json!({"status": "draft", "votes": 1})),
                    doc(json!({"status": "draft", "votes": 2})),
                    doc(json!({"status": "live", "votes": 3})),
                ],
                false,
            )
            .await
            .unwrap()
        {
            InsertManyResult::Ids(ids) => ids,
            InsertManyResult::Entities(_) => panic!("expected ids"),
        };
        assert_eq!(ids.len(), 3);
        assert_eq!(adapter.find_by_ids(&ids[..2]).await.unwrap().len(), 2);

        let filter = doc(json!({"status": "draft"}));
        let n = adapter
            .update_many(&filter, doc(json!({"$inc": {"votes": 10}})), true)
            .await
            .unwrap();
        assert_eq!(n, 2);
        let high = FindParams::filter(doc(json!({"votes": {"$gte": 11}})));
        assert_eq!(adapter.count(&high).await.unwrap(), 2);

        assert_eq!(adapter.remove_many(&filter).await.unwrap(), 2);
        assert_eq!(adapter.clear().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unique_index() {
        let registry = Arc::new(MemoryStoreRegistry::new());
        let adapter = connected(&registry, AdapterConfig::memory("users")).await;
        adapter
            .create_index(&IndexDefinition::new(["email"]).unique())
            .await
            .unwrap();
        adapter.insert(doc(json!({"email": "a@x.io"}))).await.unwrap();
        assert!(adapter.insert(doc(json!({"email": "a@x.io"}))).await.is_err());

        adapter
            .remove_index(&IndexDefinition::new(["email"]))
            .await
            .unwrap();
        assert!(adapter.insert(doc(json!({"email": "a@x.io"}))).await.is_ok());
    }
}
