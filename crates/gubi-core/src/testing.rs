//! Scripted store used by the unit tests of this crate.

use crate::error::StoreError;
use crate::storage::MemoryDocumentStore;
use crate::store::{document_id, Collection, DocumentStore, Filter};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Fault {
    Unavailable,
    Backend,
    Hang,
}

#[derive(Debug)]
struct Rule {
    collection: Collection,
    /// `None` matches every document of the collection.
    id: Option<String>,
    /// Matching puts let through before the fault starts firing.
    skip: usize,
    remaining: usize,
    fault: Fault,
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<Rule>,
    put_attempts: HashMap<Collection, usize>,
    writes: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ScriptedStore {
    inner: MemoryDocumentStore,
    script: Mutex<Script>,
}

impl ScriptedStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_puts(&self, collection: Collection, id: &str, times: usize, fault: Fault) {
        self.push_rule(collection, Some(id.to_string()), 0, times, fault);
    }

    pub(crate) fn fail_puts_after(
        &self,
        collection: Collection,
        id: &str,
        skip: usize,
        times: usize,
        fault: Fault,
    ) {
        self.push_rule(collection, Some(id.to_string()), skip, times, fault);
    }

    pub(crate) fn fail_every_put(&self, collection: Collection, times: usize, fault: Fault) {
        self.push_rule(collection, None, 0, times, fault);
    }

    pub(crate) fn put_attempts(&self, collection: Collection) -> usize {
        self.lock()
            .put_attempts
            .get(&collection)
            .copied()
            .unwrap_or(0)
    }

    /// Successful puts and deletes across all collections.
    pub(crate) fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Write directly, bypassing the script and the counters.
    pub(crate) async fn seed<T: Serialize>(&self, collection: Collection, document: &T) {
        let value = serde_json::to_value(document).expect("seed document serializes");
        self.inner
            .put(collection, value)
            .await
            .expect("seed write succeeds");
    }

    pub(crate) async fn documents(&self, collection: Collection) -> Vec<Value> {
        self.inner
            .query(collection, &Filter::All)
            .await
            .expect("memory query succeeds")
    }

    fn push_rule(
        &self,
        collection: Collection,
        id: Option<String>,
        skip: usize,
        times: usize,
        fault: Fault,
    ) {
        self.lock().rules.push(Rule {
            collection,
            id,
            skip,
            remaining: times,
            fault,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_fault(&self, collection: Collection, id: &str) -> Option<Fault> {
        let mut script = self.lock();
        *script.put_attempts.entry(collection).or_default() += 1;
        let rule = script.rules.iter_mut().find(|rule| {
            rule.remaining > 0
                && rule.collection == collection
                && rule.id.as_deref().map(|target| target == id).unwrap_or(true)
        })?;
        if rule.skip > 0 {
            rule.skip -= 1;
            return None;
        }
        rule.remaining -= 1;
        Some(rule.fault)
    }
}

#[async_trait]
impl DocumentStore for ScriptedStore {
    fn backend(&self) -> &'static str {
        "scripted"
    }

    async fn put(&self, collection: Collection, document: Value) -> Result<(), StoreError> {
        let id = document_id(&document)?;
        match self.take_fault(collection, &id) {
            Some(Fault::Unavailable) => {
                return Err(StoreError::Unavailable(format!("scripted put {collection}/{id}")))
            }
            Some(Fault::Backend) => {
                return Err(StoreError::Backend(format!("scripted put {collection}/{id}")))
            }
            Some(Fault::Hang) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            None => {}
        }
        self.inner.put(collection, document).await?;
        self.lock().writes += 1;
        Ok(())
    }

    async fn query(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError> {
        self.inner.query(collection, filter).await
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), StoreError> {
        self.inner.delete(collection, id).await?;
        self.lock().writes += 1;
        Ok(())
    }
}
