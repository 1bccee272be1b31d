//! Backend adapter contract.
//!
//! Every storage backend plugs in through the [`Adapter`] trait. The field
//! engine only relies on the operations below plus one capability flag,
//! [`Adapter::has_native_structured_fields`], which decides whether object
//! and array values are stored as-is or as JSON strings.
//!
//! Two adapters ship with the crate:
//!
//! - [`MemoryAdapter`]: an in-process document store. Adapters with the same
//!   connection signature share one store through a [`MemoryStoreRegistry`].
//! - `SqliteAdapter` (feature `sqlite`): JSON documents in SQLite tables,
//!   pooled through r2d2.

mod filter;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConfigurationError, EntityResult};
use crate::params::QueryParams;

pub use filter::{apply_changes, compare_values, lookup_path, matches_filter, select};
pub use memory::{MemoryAdapter, MemoryStoreRegistry};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAdapter;

/// A backend document: column name → value.
pub type Document = Map<String, Value>;

/// Returns the string form of an id, used as a map key.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Identifies the type of backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    /// In-process document store.
    Memory,
    /// SQLite relational store.
    Sqlite,
    /// A backend registered by the host under its own name.
    Custom(String),
}

impl AdapterKind {
    /// Parses a kind name; anything unknown is a custom kind.
    pub fn parse(name: &str) -> Self {
        match name {
            "memory" | "" => AdapterKind::Memory,
            "sqlite" => AdapterKind::Sqlite,
            other => AdapterKind::Custom(other.strip_prefix("custom:").unwrap_or(other).to_string()),
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterKind::Memory => write!(f, "memory"),
            AdapterKind::Sqlite => write!(f, "sqlite"),
            AdapterKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Static backend configuration, before and after tenant resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Adapter kind name (`memory`, `sqlite` or a custom name).
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Connection string (database path, URL). Empty for the default.
    #[serde(default)]
    pub connection: String,

    /// Collection or table name.
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Schema or namespace, when the tenancy strategy uses one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Column holding the primary key.
    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Free-form adapter options.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

fn default_kind() -> String {
    "memory".to_string()
}

fn default_collection() -> String {
    "entities".to_string()
}

fn default_id_column() -> String {
    "_id".to_string()
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            connection: String::new(),
            collection: default_collection(),
            schema: None,
            id_column: default_id_column(),
            options: Map::new(),
        }
    }
}

impl AdapterConfig {
    /// Creates a memory adapter configuration for a collection.
    pub fn memory(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Default::default()
        }
    }

    /// Creates a SQLite adapter configuration.
    pub fn sqlite(connection: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            kind: "sqlite".to_string(),
            connection: connection.into(),
            collection: collection.into(),
            ..Default::default()
        }
    }

    /// Sets the backend kind (`memory`, `sqlite` or `custom:<name>`).
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Sets the connection string.
    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }

    /// Sets the collection.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Sets the schema namespace.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Sets the primary key column.
    pub fn with_id_column(mut self, id_column: impl Into<String>) -> Self {
        self.id_column = id_column.into();
        self
    }

    /// Sets an adapter specific option.
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Returns the parsed kind.
    pub fn adapter_kind(&self) -> AdapterKind {
        AdapterKind::parse(&self.kind)
    }

    /// Identifies the underlying connection. Adapters with equal signatures
    /// may share a client.
    pub fn signature(&self) -> String {
        format!(
            "{}|{}|{}",
            self.kind,
            self.connection,
            self.schema.as_deref().unwrap_or_default()
        )
    }
}

/// Parameters of a backend read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindParams {
    /// Filter, keyed by column name.
    pub filter: Document,
    /// Sort keys by column name; a `-` prefix sorts descending.
    pub sort: Vec<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub search: Option<String>,
    /// Columns the search term applies to; all string columns when empty.
    pub search_fields: Vec<String>,
    /// Backend-specific collation, passed through.
    pub collation: Option<Value>,
}

impl FindParams {
    /// Creates params matching every document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates params with a filter.
    pub fn filter(filter: Document) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl From<&QueryParams> for FindParams {
    fn from(params: &QueryParams) -> Self {
        Self {
            filter: params.filter(),
            sort: params.sort.clone().unwrap_or_default(),
            limit: params.limit,
            offset: params.offset,
            search: params.search.clone().filter(|s| !s.is_empty()),
            search_fields: params.search_fields.clone().unwrap_or_default(),
            collation: params.collation.clone(),
        }
    }
}

/// Result of [`Adapter::insert_many`].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertManyResult {
    /// The stored documents.
    Entities(Vec<Document>),
    /// Only the new ids.
    Ids(Vec<Value>),
}

/// An index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Indexed columns, in order.
    pub fields: Vec<String>,
    /// Index name; derived from the columns when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    /// Creates a non-unique index over the columns.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            name: None,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns the explicit or derived index name.
    pub fn index_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("idx_{}", self.fields.join("_")))
    }
}

/// A pluggable storage backend.
///
/// Documents are keyed by column name. `find_by_id`, `update_by_id`,
/// `replace_by_id` and `remove_by_id` address the adapter's id column
/// ([`AdapterConfig::id_column`]).
#[async_trait]
pub trait Adapter: Send + Sync + fmt::Debug {
    /// Returns a human-readable name for this adapter.
    fn name(&self) -> &str;

    /// Returns the kind of backend.
    fn kind(&self) -> AdapterKind;

    /// Whether object and array values can be stored natively.
    fn has_native_structured_fields(&self) -> bool;

    /// Opens the connection.
    async fn connect(&self) -> EntityResult<()>;

    /// Closes the connection.
    async fn disconnect(&self) -> EntityResult<()>;

    /// Returns `true` between a successful `connect` and `disconnect`.
    fn is_connected(&self) -> bool;

    async fn find(&self, params: &FindParams) -> EntityResult<Vec<Document>>;

    async fn find_one(&self, params: &FindParams) -> EntityResult<Option<Document>> {
        let mut params = params.clone();
        params.limit = Some(1);
        Ok(self.find(&params).await?.into_iter().next())
    }

    async fn find_by_id(&self, id: &Value) -> EntityResult<Option<Document>>;

    /// Returns the documents found, in no particular order.
    async fn find_by_ids(&self, ids: &[Value]) -> EntityResult<Vec<Document>>;

    async fn count(&self, params: &FindParams) -> EntityResult<u64>;

    /// Stores a document and returns it as stored (with its id).
    async fn insert(&self, entity: Document) -> EntityResult<Document>;

    async fn insert_many(
        &self,
        entities: Vec<Document>,
        return_entities: bool,
    ) -> EntityResult<InsertManyResult>;

    /// Applies changes. With `raw`, `changes` holds update operators
    /// (`$set`, `$unset`, `$inc`) instead of plain values.
    async fn update_by_id(
        &self,
        id: &Value,
        changes: Document,
        raw: bool,
    ) -> EntityResult<Option<Document>>;

    /// Returns the number of updated documents.
    async fn update_many(&self, filter: &Document, changes: Document, raw: bool)
    -> EntityResult<u64>;

    async fn replace_by_id(&self, id: &Value, entity: Document) -> EntityResult<Option<Document>>;

    /// Returns the removed id, or `None` if nothing matched.
    async fn remove_by_id(&self, id: &Value) -> EntityResult<Option<Value>>;

    /// Returns the number of removed documents.
    async fn remove_many(&self, filter: &Document) -> EntityResult<u64>;

    /// Removes every document and returns how many there were.
    async fn clear(&self) -> EntityResult<u64>;

    /// Converts a backend-native document to a plain one.
    fn entity_to_json(&self, doc: Document) -> Document {
        doc
    }

    async fn create_index(&self, definition: &IndexDefinition) -> EntityResult<()>;

    async fn remove_index(&self, definition: &IndexDefinition) -> EntityResult<()>;
}

/// Builds adapters from resolved configurations.
pub trait AdapterFactory: Send + Sync + fmt::Debug {
    /// Creates an unconnected adapter.
    fn create(&self, config: &AdapterConfig) -> EntityResult<Arc<dyn Adapter>>;
}

type CustomCtor = Arc<dyn Fn(&AdapterConfig) -> EntityResult<Arc<dyn Adapter>> + Send + Sync>;

/// The built-in factory: memory and SQLite adapters plus any custom kinds
/// registered by the host.
#[derive(Clone, Default)]
pub struct DefaultAdapterFactory {
    memory: Arc<MemoryStoreRegistry>,
    custom: HashMap<String, CustomCtor>,
}

impl fmt::Debug for DefaultAdapterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultAdapterFactory")
            .field("memory", &self.memory)
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DefaultAdapterFactory {
    /// Creates a factory with its own memory store registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory sharing an existing memory store registry.
    pub fn with_memory_registry(memory: Arc<MemoryStoreRegistry>) -> Self {
        Self {
            memory,
            custom: HashMap::new(),
        }
    }

    /// Returns the memory store registry.
    pub fn memory_registry(&self) -> &Arc<MemoryStoreRegistry> {
        &self.memory
    }

    /// Registers a constructor for a custom kind.
    pub fn register<F>(mut self, kind: impl Into<String>, ctor: F) -> Self
    where
        F: Fn(&AdapterConfig) -> EntityResult<Arc<dyn Adapter>> + Send + Sync + 'static,
    {
        self.custom.insert(kind.into(), Arc::new(ctor));
        self
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn create(&self, config: &AdapterConfig) -> EntityResult<Arc<dyn Adapter>> {
        match config.adapter_kind() {
            AdapterKind::Memory => Ok(Arc::new(MemoryAdapter::new(
                config.clone(),
                Arc::clone(&self.memory),
            ))),
            #[cfg(feature = "sqlite")]
            AdapterKind::Sqlite => Ok(Arc::new(SqliteAdapter::new(config.clone()))),
            #[cfg(not(feature = "sqlite"))]
            AdapterKind::Sqlite => Err(ConfigurationError::UnknownAdapterKind {
                kind: "sqlite (feature disabled)".to_string(),
            }
            .into()),
            AdapterKind::Custom(name) => match self.custom.get(&name) {
                Some(ctor) => ctor(config),
                None => Err(ConfigurationError::UnknownAdapterKind { kind: name }.into()),
            },
        }
    }
}
