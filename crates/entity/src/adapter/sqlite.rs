//! SQLite adapter.
//!
//! Each collection is a table of JSON documents:
//!
//! ```sql
//! CREATE TABLE "<schema>__<collection>" (id TEXT NOT NULL UNIQUE, doc TEXT NOT NULL)
//! ```
//!
//! Filters, search and sorting run over the decoded documents; indexes are
//! expression indexes over `json_extract(doc, '$.<column>')`. Structured
//! values are not stored natively, so the field engine hands them over as
//! JSON strings.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{BackendError, ConfigurationError, EntityResult};

use super::filter::{apply_changes, matches_filter, select};
use super::{
    Adapter, AdapterConfig, AdapterKind, Document, FindParams, IndexDefinition, InsertManyResult,
    id_key,
};

/// Tuning read from [`AdapterConfig::options`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteOptions {
    /// Maximum number of pooled connections. In-memory databases always use
    /// one, since every connection would otherwise see its own database.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Enable WAL mode for file databases.
    #[serde(default = "default_true")]
    pub enable_wal: bool,
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_connection_timeout_ms() -> u64 {
    30000
}

fn default_true() -> bool {
    true
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            enable_wal: true,
        }
    }
}

/// SQLite document adapter.
pub struct SqliteAdapter {
    config: AdapterConfig,
    table: String,
    pool: RwLock<Option<Pool<SqliteConnectionManager>>>,
}

impl fmt::Debug for SqliteAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteAdapter")
            .field("connection", &self.config.connection)
            .field("table", &self.table)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

fn sanitize_identifier(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn is_memory(connection: &str) -> bool {
    connection.is_empty() || connection == ":memory:"
}

fn internal(message: impl Into<String>) -> BackendError {
    BackendError::Internal {
        backend_name: "sqlite".to_string(),
        message: message.into(),
        source: None,
    }
}

impl SqliteAdapter {
    /// Creates an unconnected adapter.
    pub fn new(config: AdapterConfig) -> Self {
        let table = match &config.schema {
            Some(schema) => format!(
                "{}__{}",
                sanitize_identifier(schema),
                sanitize_identifier(&config.collection)
            ),
            None => sanitize_identifier(&config.collection),
        };
        Self {
            config,
            table,
            pool: RwLock::new(None),
        }
    }

    /// Returns the table backing the collection.
    pub fn table(&self) -> &str {
        &self.table
    }

    fn options(&self) -> EntityResult<SqliteOptions> {
        if self.config.options.is_empty() {
            return Ok(SqliteOptions::default());
        }
        serde_json::from_value(Value::Object(self.config.options.clone())).map_err(|e| {
            ConfigurationError::InvalidSettings {
                errors: vec![format!("sqlite options: {}", e)],
            }
            .into()
        })
    }

    fn conn(&self) -> EntityResult<PooledConnection<SqliteConnectionManager>> {
        let pool = self.pool.read().clone().ok_or_else(|| BackendError::NotConnected {
            backend_name: "sqlite".to_string(),
        })?;
        Ok(pool.get()?)
    }

    fn decode(text: &str) -> EntityResult<Document> {
        match serde_json::from_str(text)? {
            Value::Object(doc) => Ok(doc),
            _ => Err(internal("stored document is not an object").into()),
        }
    }

    fn load_all(&self, conn: &Connection) -> EntityResult<Vec<Document>> {
        let mut stmt = conn.prepare(&format!("SELECT doc FROM \"{}\" ORDER BY rowid", self.table))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut docs = Vec::new();
        for text in rows {
            docs.push(Self::decode(&text?)?);
        }
        Ok(docs)
    }

    fn load_one(&self, conn: &Connection, id: &Value) -> EntityResult<Option<Document>> {
        let text: Option<String> = conn
            .query_row(
                &format!("SELECT doc FROM \"{}\" WHERE id = ?1", self.table),
                params![id_key(id)],
                |row| row.get(0),
            )
            .optional()?;
        text.as_deref().map(Self::decode).transpose()
    }

    fn store(&self, conn: &Connection, id: &Value, doc: &Document) -> EntityResult<()> {
        conn.execute(
            &format!("UPDATE \"{}\" SET doc = ?2 WHERE id = ?1", self.table),
            params![id_key(id), serde_json::to_string(doc)?],
        )?;
        Ok(())
    }

    fn with_id(&self, mut doc: Document) -> (Value, Document) {
        let id = match doc.get(&self.config.id_column) {
            Some(id) if !id.is_null() => id.clone(),
            _ => {
                let id = Value::String(uuid::Uuid::new_v4().to_string());
                doc.insert(self.config.id_column.clone(), id.clone());
                id
            }
        };
        (id, doc)
    }

    fn insert_with(&self, conn: &Connection, entity: Document) -> EntityResult<Document> {
        let (id, doc) = self.with_id(entity);
        conn.execute(
            &format!("INSERT INTO \"{}\" (id, doc) VALUES (?1, ?2)", self.table),
            params![id_key(&id), serde_json::to_string(&doc)?],
        )?;
        Ok(doc)
    }

    fn index_sql_name(&self, definition: &IndexDefinition) -> String {
        format!(
            "{}_{}",
            self.table,
            sanitize_identifier(&definition.index_name())
        )
    }
}

#[async_trait]
impl Adapter for SqliteAdapter {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Sqlite
    }

    fn has_native_structured_fields(&self) -> bool {
        false
    }

    async fn connect(&self) -> EntityResult<()> {
        let options = self.options()?;
        let memory = is_memory(&self.config.connection);
        let manager = if memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(&self.config.connection)
        };

        let pool = Pool::builder()
            .max_size(if memory { 1 } else { options.max_connections.max(1) })
            .connection_timeout(Duration::from_millis(options.connection_timeout_ms))
            .build(manager)
            .map_err(|e| BackendError::ConnectionFailed {
                backend_name: "sqlite".to_string(),
                message: e.to_string(),
            })?;

        {
            let conn = pool.get()?;
            conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;
            if options.enable_wal && !memory {
                // journal_mode returns a row, so it cannot go through execute().
                conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            }
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS \"{}\" (id TEXT NOT NULL UNIQUE, doc TEXT NOT NULL)",
                    self.table
                ),
                [],
            )?;
        }

        info!(
            connection = %if memory { ":memory:" } else { self.config.connection.as_str() },
            table = %self.table,
            "Connected SQLite adapter"
        );
        *self.pool.write() = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> EntityResult<()> {
        if self.pool.write().take().is_some() {
            debug!(table = %self.table, "Disconnected SQLite adapter");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pool.read().is_some()
    }

    async fn find(&self, params: &FindParams) -> EntityResult<Vec<Document>> {
        let conn = self.conn()?;
        let docs = self.load_all(&conn)?;
        Ok(select(&docs, params))
    }

    async fn find_by_id(&self, id: &Value) -> EntityResult<Option<Document>> {
        let conn = self.conn()?;
        self.load_one(&conn, id)
    }

    async fn find_by_ids(&self, ids: &[Value]) -> EntityResult<Vec<Document>> {
        let conn = self.conn()?;
        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.load_one(&conn, id)? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    async fn count(&self, params: &FindParams) -> EntityResult<u64> {
        let conn = self.conn()?;
        if params.filter.is_empty() && params.search.is_none() {
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM \"{}\"", self.table),
                [],
                |row| row.get(0),
            )?;
            return Ok(n as u64);
        }
        let mut params = params.clone();
        params.limit = None;
        params.offset = None;
        Ok(select(&self.load_all(&conn)?, &params).len() as u64)
    }

    async fn insert(&self, entity: Document) -> EntityResult<Document> {
        let conn = self.conn()?;
        self.insert_with(&conn, entity)
    }

    async fn insert_many(
        &self,
        entities: Vec<Document>,
        return_entities: bool,
    ) -> EntityResult<InsertManyResult> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut stored = Vec::with_capacity(entities.len());
        for entity in entities {
            stored.push(self.insert_with(&tx, entity)?);
        }
        tx.commit()?;

        if return_entities {
            Ok(InsertManyResult::Entities(stored))
        } else {
            Ok(InsertManyResult::Ids(
                stored
                    .into_iter()
                    .filter_map(|mut doc| doc.remove(&self.config.id_column))
                    .collect(),
            ))
        }
    }

    async fn update_by_id(
        &self,
        id: &Value,
        changes: Document,
        raw: bool,
    ) -> EntityResult<Option<Document>> {
        let conn = self.conn()?;
        let Some(mut doc) = self.load_one(&conn, id)? else {
            return Ok(None);
        };
        apply_changes(&mut doc, changes, raw)?;
        self.store(&conn, id, &doc)?;
        Ok(Some(doc))
    }

    async fn update_many(
        &self,
        filter: &Document,
        changes: Document,
        raw: bool,
    ) -> EntityResult<u64> {
        let mut conn = self.conn()?;
        let docs = self.load_all(&conn)?;
        let tx = conn.transaction()?;
        let mut updated = 0;
        for mut doc in docs.into_iter().filter(|doc| matches_filter(doc, filter)) {
            let Some(id) = doc.get(&self.config.id_column).cloned() else {
                continue;
            };
            apply_changes(&mut doc, changes.clone(), raw)?;
            self.store(&tx, &id, &doc)?;
            updated += 1;
        }
        tx.commit()?;
        Ok(updated)
    }

    async fn replace_by_id(&self, id: &Value, entity: Document) -> EntityResult<Option<Document>> {
        let conn = self.conn()?;
        if self.load_one(&conn, id)?.is_none() {
            return Ok(None);
        }
        let mut doc = entity;
        doc.insert(self.config.id_column.clone(), id.clone());
        self.store(&conn, id, &doc)?;
        Ok(Some(doc))
    }

    async fn remove_by_id(&self, id: &Value) -> EntityResult<Option<Value>> {
        let conn = self.conn()?;
        let removed = conn.execute(
            &format!("DELETE FROM \"{}\" WHERE id = ?1", self.table),
            params![id_key(id)],
        )?;
        Ok((removed > 0).then(|| id.clone()))
    }

    async fn remove_many(&self, filter: &Document) -> EntityResult<u64> {
        let mut conn = self.conn()?;
        let docs = self.load_all(&conn)?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        for doc in docs.iter().filter(|doc| matches_filter(doc, filter)) {
            if let Some(id) = doc.get(&self.config.id_column) {
                removed += tx.execute(
                    &format!("DELETE FROM \"{}\" WHERE id = ?1", self.table),
                    params![id_key(id)],
                )? as u64;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    async fn clear(&self) -> EntityResult<u64> {
        let conn = self.conn()?;
        let removed = conn.execute(&format!("DELETE FROM \"{}\"", self.table), [])?;
        Ok(removed as u64)
    }

    async fn create_index(&self, definition: &IndexDefinition) -> EntityResult<()> {
        if definition.fields.is_empty() {
            return Err(BackendError::QueryError {
                message: "index needs at least one column".to_string(),
            }
            .into());
        }
        let mut columns = Vec::with_capacity(definition.fields.len());
        for field in &definition.fields {
            if !field
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
            {
                return Err(BackendError::QueryError {
                    message: format!("invalid index column '{}'", field),
                }
                .into());
            }
            columns.push(format!("json_extract(doc, '$.{}')", field));
        }

        let conn = self.conn()?;
        conn.execute(
            &format!(
                "CREATE {}INDEX IF NOT EXISTS \"{}\" ON \"{}\" ({})",
                if definition.unique { "UNIQUE " } else { "" },
                self.index_sql_name(definition),
                self.table,
                columns.join(", ")
            ),
            [],
        )?;
        Ok(())
    }

    async fn remove_index(&self, definition: &IndexDefinition) -> EntityResult<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!("DROP INDEX IF EXISTS \"{}\"", self.index_sql_name(definition)),
            [],
        )?;
        Ok(())
    }
}
