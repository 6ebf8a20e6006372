//! SQLite-backed durable store.
//!
//! All collections share one `documents` table keyed by `(collection, id)`.
//! Secondary indexes are JSON expression indexes over the declared index
//! fields, so index queries never scan unrelated collections.

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use limeaura_common::{Error, Result};

use crate::collection::Collection;
use crate::store::{Document, LocalStore, Query};

/// Durable store using SQLite.
///
/// Blocking SQLite calls run on the tokio blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or schema setup failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path).map_err(store_error)?;
        Self::init(conn).inspect(|_| info!("Opened local store at {}", db_path.display()))
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
            "#,
        )
        .map_err(store_error)?;

        for collection in Collection::ALL {
            for field in collection.indexes() {
                let sql = format!(
                    "CREATE INDEX IF NOT EXISTS idx_{name}_{field} \
                     ON documents (json_extract(body, '$.{field}')) \
                     WHERE collection = '{name}'",
                    name = collection.name(),
                    field = field,
                );
                conn.execute_batch(&sql).map_err(store_error)?;
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::StoreUnavailable("sqlite connection lock poisoned".to_string()))?;
            f(&guard).map_err(store_error)
        })
        .await
        .map_err(|e| Error::StoreUnavailable(format!("store task failed: {}", e)))?
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        let id = id.to_string();
        let name = collection.name();
        let row = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, body FROM documents WHERE collection = ?1 AND id = ?2",
                    params![name, id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()
            })
            .await?;

        row.map(|(id, body)| decode(id, &body)).transpose()
    }

    async fn put(&self, collection: Collection, document: Document) -> Result<()> {
        document.validate()?;
        let body = serde_json::to_string(&document.body)?;
        let name = collection.name();
        debug!("Upserting {}/{}", name, document.id);

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO documents (collection, id, body) VALUES (?1, ?2, ?3)",
                params![name, document.id, body],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        let id = id.to_string();
        let name = collection.name();
        debug!("Deleting {}/{}", name, id);

        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![name, id],
            )
            .map(|_| ())
        })
        .await
    }

    async fn query(&self, collection: Collection, query: &Query) -> Result<Vec<Document>> {
        query.validate(collection)?;
        if query.values.is_empty() {
            return Ok(Vec::new());
        }

        // Collection and field names come from the static schema (checked by
        // `validate`), so they are safe to splice into the statement. The
        // literal collection name lets SQLite pick the partial index.
        let field = format!("json_extract(body, '$.{}')", query.index);
        let bindings: Vec<SqlValue> = query
            .values
            .iter()
            .filter(|value| !value.is_null())
            .map(to_sql_value)
            .collect();

        // `IN (NULL)` never matches, so null is tested separately. Like the
        // memory store, it also matches documents missing the field.
        let mut predicates = Vec::new();
        if !bindings.is_empty() {
            let placeholders = (1..=bindings.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            predicates.push(format!("{} IN ({})", field, placeholders));
        }
        if query.values.iter().any(Value::is_null) {
            predicates.push(format!("{} IS NULL", field));
        }

        let order = match &query.order_by {
            Some(field) => format!("json_extract(body, '$.{}'), id", field),
            None => "id".to_string(),
        };
        let sql = format!(
            "SELECT id, body FROM documents \
             WHERE collection = '{}' AND ({}) \
             ORDER BY {}",
            collection.name(),
            predicates.join(" OR "),
            order
        );

        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(bindings), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        rows.into_iter()
            .map(|(id, body)| decode(id, &body))
            .collect()
    }
}

fn decode(id: String, body: &str) -> Result<Document> {
    Ok(Document::new(id, serde_json::from_str(body)?))
}

/// Map a JSON scalar onto the value `json_extract` yields for it.
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn store_error(err: rusqlite::Error) -> Error {
    Error::StoreUnavailable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = SqliteStore::in_memory().unwrap();
        let doc = Document::new("p-1", json!({ "workspace_id": "w-1", "name": "Roadmap" }));

        store.put(Collection::Projects, doc.clone()).await.unwrap();
        assert_eq!(store.get(Collection::Projects, "p-1").await.unwrap(), Some(doc));

        store.delete(Collection::Projects, "p-1").await.unwrap();
        assert!(store.get(Collection::Projects, "p-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .put(Collection::Tasks, Document::new("x", json!({ "status": "todo" })))
            .await
            .unwrap();

        assert!(store.get(Collection::Comments, "x").await.unwrap().is_none());
        let todo = store
            .query(Collection::Tasks, &Query::equals("status", "todo"))
            .await
            .unwrap();
        assert_eq!(todo.len(), 1);
    }

    #[tokio::test]
    async fn test_query_multi_value_sorted_numerically() {
        let store = SqliteStore::in_memory().unwrap();
        let rows = [
            ("a", "failed", 1_700_000_000_300_000i64),
            ("b", "pending", 1_700_000_000_100_000),
            ("c", "conflict", 1_700_000_000_000_000),
            ("d", "pending", 999),
        ];
        for (id, state, created_at) in rows {
            store
                .put(
                    Collection::SyncOperations,
                    Document::new(id, json!({ "state": state, "created_at": created_at })),
                )
                .await
                .unwrap();
        }

        let query = Query::any_of("state", ["pending", "failed"]).sort_by("created_at");
        let result = store.query(Collection::SyncOperations, &query).await.unwrap();
        let ids: Vec<_> = result.iter().map(|d| d.id.as_str()).collect();

        assert_eq!(ids, ["d", "b", "a"]);
    }

    #[tokio::test]
    async fn test_query_by_number_and_bool() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .put(Collection::Tasks, Document::new("t-1", json!({ "version": 3 })))
            .await
            .unwrap();
        store
            .put(Collection::Tasks, Document::new("t-2", json!({ "version": 4 })))
            .await
            .unwrap();

        let result = store
            .query(Collection::Tasks, &Query::equals("version", 3))
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "t-1");
    }

    #[tokio::test]
    async fn test_null_predicate_matches_memory_store() {
        let sqlite = SqliteStore::in_memory().unwrap();
        let memory = MemoryStore::new();
        let tasks = [
            Document::new("t-1", json!({ "assignee_id": null, "status": "todo" })),
            Document::new("t-2", json!({ "status": "todo" })),
            Document::new("t-3", json!({ "assignee_id": "u-1", "status": "todo" })),
            Document::new("t-4", json!({ "assignee_id": "u-2", "status": "todo" })),
        ];
        for task in tasks {
            sqlite.put(Collection::Tasks, task.clone()).await.unwrap();
            memory.put(Collection::Tasks, task).await.unwrap();
        }

        let queries = [
            Query::equals("assignee_id", Value::Null),
            Query::any_of("assignee_id", [Value::Null, json!("u-1")]),
            Query::equals("assignee_id", "u-2"),
        ];
        for query in queries {
            let ids = |docs: Vec<Document>| docs.into_iter().map(|d| d.id).collect::<Vec<_>>();
            let from_sqlite = ids(sqlite.query(Collection::Tasks, &query).await.unwrap());
            let from_memory = ids(memory.query(Collection::Tasks, &query).await.unwrap());
            assert_eq!(from_sqlite, from_memory, "{:?}", query);
        }

        let unassigned = sqlite
            .query(Collection::Tasks, &Query::equals("assignee_id", Value::Null))
            .await
            .unwrap();
        let ids: Vec<_> = unassigned.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["t-1", "t-2"]);
    }

    #[tokio::test]
    async fn test_unindexed_query_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        let result = store
            .query(Collection::SyncOperations, &Query::equals("retries", 1))
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("offline.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .put(
                    Collection::SyncOperations,
                    Document::new("op-1", json!({ "state": "pending", "created_at": 1 })),
                )
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let pending = store
            .query(Collection::SyncOperations, &Query::equals("state", "pending"))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "op-1");
    }

    #[tokio::test]
    async fn test_open_unwritable_path_is_store_unavailable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing-dir").join("offline.db");
        let err = SqliteStore::open(&path).err().unwrap();
        assert!(err.is_store_unavailable());
    }
}
