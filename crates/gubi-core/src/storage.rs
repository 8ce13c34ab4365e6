use crate::error::StoreError;
use crate::store::{document_id, Collection, DocumentStore, Filter, ALL, ID_FIELD};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Document store backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StoreConfig {
    /// Keep every collection in process memory only.
    #[default]
    Memory,
    /// Persist documents as JSONB rows keyed by `(collection, id)`.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Open the configured backend.
pub async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn DocumentStore>, StoreError> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryDocumentStore::new())),
        StoreConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresDocumentStore::connect(database_url, *max_connections).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

/// In-process store with the same last-write-wins semantics as the replicated one.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<Collection, BTreeMap<String, Value>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently held in a collection.
    pub async fn count(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .await
            .get(&collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, collection: Collection, document: Value) -> Result<(), StoreError> {
        let id = document_id(&document)?;
        self.collections
            .write()
            .await
            .entry(collection)
            .or_default()
            .insert(id, document);
        Ok(())
    }

    async fn query(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(&collection)
            .map(|documents| {
                documents
                    .values()
                    .filter(|document| filter.matches(document))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), StoreError> {
        let mut guard = self.collections.write().await;
        if id == ALL {
            guard.remove(&collection);
        } else if let Some(documents) = guard.get_mut(&collection) {
            documents.remove(id);
        }
        Ok(())
    }
}

/// PostgreSQL-backed document store. One table holds every collection.
#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx("connect", e))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gubi_documents (
                collection TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                document JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (collection, doc_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("schema create", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_gubi_documents_body ON gubi_documents USING GIN (document)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("index create", e))?;

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn put(&self, collection: Collection, document: Value) -> Result<(), StoreError> {
        let id = document_id(&document)?;
        sqlx::query(
            r#"
            INSERT INTO gubi_documents (collection, doc_id, document, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (collection, doc_id)
            DO UPDATE SET document = EXCLUDED.document, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(collection.name())
        .bind(&id)
        .bind(&document)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("put", e))?;

        Ok(())
    }

    async fn query(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError> {
        let rows = match filter {
            Filter::All => sqlx::query(
                "SELECT document FROM gubi_documents WHERE collection = $1 ORDER BY doc_id",
            )
            .bind(collection.name())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx("query", e))?,
            Filter::Fields { keys, value } => {
                let by_id = keys.iter().any(|key| key == ID_FIELD);
                sqlx::query(
                    r#"
                    SELECT document FROM gubi_documents
                    WHERE collection = $1
                      AND (
                        ($4 AND doc_id = $3)
                        OR EXISTS (
                            SELECT 1 FROM unnest($2::text[]) AS k(key)
                            WHERE document ->> k.key = $3
                        )
                      )
                    ORDER BY doc_id
                    "#,
                )
                .bind(collection.name())
                .bind(keys)
                .bind(value)
                .bind(by_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx("query", e))?
            }
        };

        rows.into_iter()
            .map(|row| {
                row.try_get::<Value, _>("document")
                    .map_err(|e| StoreError::Serialization(format!("postgres decode failed: {e}")))
            })
            .collect()
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), StoreError> {
        let result = if id == ALL {
            sqlx::query("DELETE FROM gubi_documents WHERE collection = $1")
                .bind(collection.name())
                .execute(&self.pool)
                .await
        } else {
            sqlx::query("DELETE FROM gubi_documents WHERE collection = $1 AND doc_id = $2")
                .bind(collection.name())
                .bind(id)
                .execute(&self.pool)
                .await
        };
        result.map_err(|e| map_sqlx("delete", e))?;
        Ok(())
    }
}

fn map_sqlx(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("postgres {operation} failed: {err}"))
        }
        other => StoreError::Backend(format!("postgres {operation} failed: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_put_replaces_whole_document() {
        let store = MemoryDocumentStore::new();
        store
            .put(
                Collection::UserBalance,
                json!({"_id": "alice", "balance": 10, "income": 5}),
            )
            .await
            .unwrap();
        store
            .put(Collection::UserBalance, json!({"_id": "alice", "balance": 20}))
            .await
            .unwrap();

        let docs = store
            .query(Collection::UserBalance, &Filter::by_id("alice"))
            .await
            .unwrap();
        assert_eq!(docs, vec![json!({"_id": "alice", "balance": 20})]);
    }

    #[tokio::test]
    async fn memory_delete_all_clears_only_that_collection() {
        let store = MemoryDocumentStore::new();
        store
            .put(Collection::Plan, json!({"_id": "p1", "price": 10}))
            .await
            .unwrap();
        store
            .put(Collection::Plan, json!({"_id": "p2", "price": 20}))
            .await
            .unwrap();
        store
            .put(Collection::Income, json!({"_id": "i1", "amount": 1}))
            .await
            .unwrap();

        store.delete(Collection::Plan, "missing").await.unwrap();
        assert_eq!(store.count(Collection::Plan).await, 2);

        store.delete(Collection::Plan, ALL).await.unwrap();
        assert_eq!(store.count(Collection::Plan).await, 0);
        assert_eq!(store.count(Collection::Income).await, 1);
    }

    #[tokio::test]
    async fn memory_rejects_documents_without_identifier() {
        let store = MemoryDocumentStore::new();
        let err = store
            .put(Collection::Plan, json!({"price": 10}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn config_labels() {
        assert_eq!(StoreConfig::default().label(), "memory");
        assert_eq!(
            StoreConfig::postgres("postgres://localhost/gubi", 4).label(),
            "postgres"
        );
    }
}
