//! Document store adapters for the cyber-gubi ledger.

#![deny(unsafe_code)]

use async_trait::async_trait;
use gubi_core::store::{document_id, ALL};
use gubi_core::{Collection, DocumentStore, Filter, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("document file IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document file serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<FileStoreError> for StoreError {
    fn from(err: FileStoreError) -> Self {
        match err {
            FileStoreError::Io(io) => StoreError::Unavailable(format!("document file: {io}")),
            FileStoreError::Serialization(e) => StoreError::Serialization(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct FileData {
    /// Keyed by collection name.
    collections: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Single-node store persisted to one JSON file.
///
/// Every mutation is written to a temporary file and renamed over the previous state, so a
/// crash leaves either the old or the new document set. A failed write leaves the in-memory
/// state untouched.
#[derive(Debug)]
pub struct FileDocumentStore {
    path: PathBuf,
    data: AsyncMutex<FileData>,
}

impl FileDocumentStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, FileStoreError> {
        let path = path.into();
        let data = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                FileData::default()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            FileData::default()
        };

        Ok(Self {
            path,
            data: AsyncMutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn commit<F>(&self, mutate: F) -> Result<(), FileStoreError>
    where
        F: FnOnce(&mut FileData),
    {
        let mut guard = self.data.lock().await;
        let mut next = guard.clone();
        mutate(&mut next);
        persist(&self.path, &next).await?;
        *guard = next;
        Ok(())
    }
}

async fn persist(path: &Path, data: &FileData) -> Result<(), FileStoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let bytes = serde_json::to_vec_pretty(data)?;
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(tmp_path, path).await?;
    Ok(())
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn put(&self, collection: Collection, document: Value) -> Result<(), StoreError> {
        let id = document_id(&document)?;
        self.commit(|data| {
            data.collections
                .entry(collection.name().to_string())
                .or_default()
                .insert(id, document);
        })
        .await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError> {
        let guard = self.data.lock().await;
        Ok(guard
            .collections
            .get(collection.name())
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
        self.commit(|data| {
            if id == ALL {
                data.collections.remove(collection.name());
            } else if let Some(documents) = data.collections.get_mut(collection.name()) {
                documents.remove(id);
            }
        })
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Put,
    Query,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fail with a retryable `Unavailable` error.
    Unavailable,
    /// Fail with a terminal backend error.
    Backend,
    /// Stall before forwarding, long enough to trip the client timeout.
    Stall(Duration),
}

/// One scripted fault. Matches by operation, optionally narrowed to a collection and a
/// document id, and fires `times` times after letting `skip` matching calls through.
#[derive(Debug, Clone)]
pub struct FaultRule {
    op: FaultOp,
    collection: Option<Collection>,
    id: Option<String>,
    skip: usize,
    times: usize,
    kind: FaultKind,
}

impl FaultRule {
    pub fn new(op: FaultOp) -> Self {
        Self {
            op,
            collection: None,
            id: None,
            skip: 0,
            times: 1,
            kind: FaultKind::Unavailable,
        }
    }

    pub fn put(collection: Collection) -> Self {
        Self::new(FaultOp::Put).in_collection(collection)
    }

    pub fn in_collection(mut self, collection: Collection) -> Self {
        self.collection = Some(collection);
        self
    }

    pub fn on_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn after(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn times(mut self, times: usize) -> Self {
        self.times = times;
        self
    }

    pub fn with(mut self, kind: FaultKind) -> Self {
        self.kind = kind;
        self
    }

    fn matches(&self, op: FaultOp, collection: Collection, id: Option<&str>) -> bool {
        self.times > 0
            && self.op == op
            && self.collection.map(|c| c == collection).unwrap_or(true)
            && match (&self.id, id) {
                (Some(target), Some(id)) => target == id,
                (Some(_), None) => false,
                (None, _) => true,
            }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounters {
    pub put_attempts: usize,
    pub query_attempts: usize,
    pub delete_attempts: usize,
    /// Puts and deletes that reached the inner store.
    pub writes: usize,
}

#[derive(Debug, Default)]
struct FaultState {
    rules: Vec<FaultRule>,
    counters: StoreCounters,
}

/// Wraps another store and injects scripted failures. For chaos and compensation tests.
pub struct FaultyStore {
    inner: Arc<dyn DocumentStore>,
    state: Mutex<FaultState>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner,
            state: Mutex::new(FaultState::default()),
        }
    }

    pub fn inject(&self, rule: FaultRule) {
        self.state().rules.push(rule);
    }

    pub fn heal(&self) {
        self.state().rules.clear();
    }

    pub fn counters(&self) -> StoreCounters {
        self.state().counters
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_fault(&self, op: FaultOp, collection: Collection, id: Option<&str>) -> Option<FaultKind> {
        let mut state = self.state();
        match op {
            FaultOp::Put => state.counters.put_attempts += 1,
            FaultOp::Query => state.counters.query_attempts += 1,
            FaultOp::Delete => state.counters.delete_attempts += 1,
        }
        let rule = state
            .rules
            .iter_mut()
            .find(|rule| rule.matches(op, collection, id))?;
        if rule.skip > 0 {
            rule.skip -= 1;
            return None;
        }
        rule.times -= 1;
        Some(rule.kind)
    }

    async fn gate(&self, op: FaultOp, collection: Collection, id: Option<&str>) -> Result<(), StoreError> {
        let Some(kind) = self.take_fault(op, collection, id) else {
            return Ok(());
        };
        warn!(?op, collection = %collection, id, ?kind, "injecting store fault");
        match kind {
            FaultKind::Unavailable => Err(StoreError::Unavailable(format!(
                "injected {op:?} fault on {collection}"
            ))),
            FaultKind::Backend => Err(StoreError::Backend(format!(
                "injected {op:?} fault on {collection}"
            ))),
            FaultKind::Stall(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }

    fn record_write(&self) {
        self.state().counters.writes += 1;
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    async fn put(&self, collection: Collection, document: Value) -> Result<(), StoreError> {
        let id = document_id(&document)?;
        self.gate(FaultOp::Put, collection, Some(&id)).await?;
        self.inner.put(collection, document).await?;
        self.record_write();
        debug!(collection = %collection, id = %id, "put forwarded");
        Ok(())
    }

    async fn query(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError> {
        self.gate(FaultOp::Query, collection, None).await?;
        self.inner.query(collection, filter).await
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), StoreError> {
        self.gate(FaultOp::Delete, collection, Some(id)).await?;
        self.inner.delete(collection, id).await?;
        self.record_write();
        Ok(())
    }
}
