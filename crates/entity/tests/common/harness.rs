//! Test doubles: a capturing notifier, a counting pool listener, an adapter
//! whose first connects fail, and a canned lookup transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use helios_entity::adapter::{
    Adapter, AdapterConfig, AdapterKind, DefaultAdapterFactory, Document, FindParams,
    IndexDefinition, InsertManyResult, MemoryAdapter, MemoryStoreRegistry,
};
use helios_entity::error::{BackendError, EntityResult};
use helios_entity::events::{ChangeEvent, ChangeNotifier};
use helios_entity::pool::LifecycleListener;
use helios_entity::tenant::OperationContext;
use helios_entity::transform::{LookupRequest, LookupTransport};

/// Records every published event.
#[derive(Debug, Default)]
pub struct CapturingNotifier {
    events: Mutex<Vec<ChangeEvent>>,
}

impl CapturingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the events published so far.
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl ChangeNotifier for CapturingNotifier {
    async fn notify(&self, event: ChangeEvent) {
        self.events.lock().push(event);
    }
}

/// Counts adapter lifecycle callbacks.
#[derive(Debug, Default)]
pub struct CountingListener {
    pub connected: AtomicUsize,
    pub disconnected: Mutex<Vec<String>>,
}

impl CountingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    /// Hashes of disconnected adapters, in order.
    pub fn disconnected(&self) -> Vec<String> {
        self.disconnected.lock().clone()
    }
}

#[async_trait]
impl LifecycleListener for CountingListener {
    async fn adapter_connected(&self, _adapter: &Arc<dyn Adapter>, _hash: &str, _config: &AdapterConfig) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn adapter_disconnected(&self, _adapter: &Arc<dyn Adapter>, hash: &str) {
        self.disconnected.lock().push(hash.to_string());
    }
}

/// Connect attempts shared by every adapter a flaky factory creates.
#[derive(Debug, Default)]
pub struct ConnectAttempts {
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
}

impl ConnectAttempts {
    /// Fails the next `failures` connects.
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(failures),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn next_fails(&self) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

/// A memory adapter whose connects fail while [`ConnectAttempts`] says so.
#[derive(Debug)]
pub struct FlakyAdapter {
    inner: MemoryAdapter,
    attempts: Arc<ConnectAttempts>,
}

/// A factory serving the `flaky` kind on top of the built-in adapters.
pub fn flaky_factory(attempts: Arc<ConnectAttempts>) -> Arc<DefaultAdapterFactory> {
    let registry = Arc::new(MemoryStoreRegistry::new());
    let stores = Arc::clone(&registry);
    Arc::new(
        DefaultAdapterFactory::with_memory_registry(registry).register("flaky", move |config| {
            Ok(Arc::new(FlakyAdapter {
                inner: MemoryAdapter::new(config.clone(), Arc::clone(&stores)),
                attempts: Arc::clone(&attempts),
            }) as Arc<dyn Adapter>)
        }),
    )
}

#[async_trait]
impl Adapter for FlakyAdapter {
    fn name(&self) -> &str {
        "flaky"
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Custom("flaky".to_string())
    }

    fn has_native_structured_fields(&self) -> bool {
        true
    }

    async fn connect(&self) -> EntityResult<()> {
        if self.attempts.next_fails() {
            return Err(BackendError::ConnectionFailed {
                backend_name: "flaky".to_string(),
                message: "connection refused".to_string(),
            }
            .into());
        }
        self.inner.connect().await
    }

    async fn disconnect(&self) -> EntityResult<()> {
        self.inner.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn find(&self, params: &FindParams) -> EntityResult<Vec<Document>> {
        self.inner.find(params).await
    }

    async fn find_by_id(&self, id: &Value) -> EntityResult<Option<Document>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_ids(&self, ids: &[Value]) -> EntityResult<Vec<Document>> {
        self.inner.find_by_ids(ids).await
    }

    async fn count(&self, params: &FindParams) -> EntityResult<u64> {
        self.inner.count(params).await
    }

    async fn insert(&self, entity: Document) -> EntityResult<Document> {
        self.inner.insert(entity).await
    }

    async fn insert_many(
        &self,
        entities: Vec<Document>,
        return_entities: bool,
    ) -> EntityResult<InsertManyResult> {
        self.inner.insert_many(entities, return_entities).await
    }

    async fn update_by_id(
        &self,
        id: &Value,
        changes: Document,
        raw: bool,
    ) -> EntityResult<Option<Document>> {
        self.inner.update_by_id(id, changes, raw).await
    }

    async fn update_many(&self, filter: &Document, changes: Document, raw: bool) -> EntityResult<u64> {
        self.inner.update_many(filter, changes, raw).await
    }

    async fn replace_by_id(&self, id: &Value, entity: Document) -> EntityResult<Option<Document>> {
        self.inner.replace_by_id(id, entity).await
    }

    async fn remove_by_id(&self, id: &Value) -> EntityResult<Option<Value>> {
        self.inner.remove_by_id(id).await
    }

    async fn remove_many(&self, filter: &Document) -> EntityResult<u64> {
        self.inner.remove_many(filter).await
    }

    async fn clear(&self) -> EntityResult<u64> {
        self.inner.clear().await
    }

    async fn create_index(&self, definition: &IndexDefinition) -> EntityResult<()> {
        self.inner.create_index(definition).await
    }

    async fn remove_index(&self, definition: &IndexDefinition) -> EntityResult<()> {
        self.inner.remove_index(definition).await
    }
}

/// Answers lookups from a fixed id → entity table and records requests.
#[derive(Debug, Default)]
pub struct StaticTransport {
    entities: Map<String, Value>,
    requests: Mutex<Vec<(String, LookupRequest)>>,
}

impl StaticTransport {
    pub fn new(entities: Value) -> Arc<Self> {
        Arc::new(Self {
            entities: entities.as_object().cloned().unwrap_or_default(),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Returns the recorded `(action, request)` pairs.
    pub fn requests(&self) -> Vec<(String, LookupRequest)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LookupTransport for StaticTransport {
    async fn lookup(
        &self,
        action: &str,
        request: LookupRequest,
        _ctx: &OperationContext,
    ) -> EntityResult<Map<String, Value>> {
        let found = request
            .ids
            .iter()
            .filter_map(|id| {
                let key = id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string());
                self.entities.get(&key).map(|entity| (key, entity.clone()))
            })
            .collect();
        self.requests.lock().push((action.to_string(), request));
        Ok(found)
    }
}
