use crate::error::StoreError;
use crate::store::{document_id, ensure_single_document, Collection, DocumentStore, Filter, ALL};
use crate::types::Versioned;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Timeout and retry bounds applied to every store call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub op_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Re-runs of a versioned update after another writer moved the document.
    pub conflict_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            op_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            conflict_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, short timeout. Used by tests that assert exact failure points.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            op_timeout: Duration::from_millis(500),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            conflict_retries: 0,
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

/// Typed client over a [`DocumentStore`] with timeouts, bounded retry and versioned writes.
#[derive(Clone)]
pub struct LedgerStoreClient {
    store: Arc<dyn DocumentStore>,
    policy: RetryPolicy,
}

impl LedgerStoreClient {
    pub fn new(store: Arc<dyn DocumentStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub async fn put<T: Serialize>(&self, collection: Collection, document: &T) -> Result<(), StoreError> {
        let document = serde_json::to_value(document)?;
        self.put_value(collection, document).await
    }

    pub async fn put_value(&self, collection: Collection, document: Value) -> Result<(), StoreError> {
        ensure_single_document(collection, &document_id(&document)?)?;
        self.run("put", collection, || self.store.put(collection, document.clone()))
            .await
    }

    pub async fn query<T: DeserializeOwned>(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<T>, StoreError> {
        let documents = self
            .run("query", collection, || self.store.query(collection, filter))
            .await?;
        documents
            .into_iter()
            .map(|document| serde_json::from_value(document).map_err(StoreError::from))
            .collect()
    }

    pub async fn find_by_id<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        Ok(self
            .query::<T>(collection, &Filter::by_id(id))
            .await?
            .into_iter()
            .next())
    }

    /// Delete one document. The reserved collection-wide id is refused.
    pub async fn delete(&self, collection: Collection, id: &str) -> Result<(), StoreError> {
        ensure_single_document(collection, id)?;
        self.run("delete", collection, || self.store.delete(collection, id))
            .await
    }

    /// Drop the whole collection.
    pub async fn delete_all(&self, collection: Collection) -> Result<(), StoreError> {
        self.run("delete_all", collection, || self.store.delete(collection, ALL))
            .await
    }

    /// Read-modify-write with an application-level version check.
    ///
    /// `mutate` returns `Ok(false)` to leave the document untouched (no write). Before the
    /// write the document is read again; a version change since the first read restarts the
    /// cycle, up to `conflict_retries` times.
    pub async fn update_versioned<T, E, I, F>(
        &self,
        collection: Collection,
        id: &str,
        init: I,
        mut mutate: F,
    ) -> Result<T, E>
    where
        T: Versioned + Serialize + DeserializeOwned,
        E: From<StoreError>,
        I: Fn() -> T,
        F: FnMut(&mut T) -> Result<bool, E>,
    {
        let mut conflicts = 0u32;
        loop {
            let current: Option<T> = self.find_by_id(collection, id).await?;
            let observed = current.as_ref().map(Versioned::version);
            let mut next = current.unwrap_or_else(&init);

            if !mutate(&mut next)? {
                return Ok(next);
            }
            next.set_version(observed.unwrap_or(0) + 1);

            let latest = self
                .find_by_id::<T>(collection, id)
                .await?
                .map(|document| document.version());
            if latest != observed {
                let conflict = StoreError::Conflict {
                    collection: collection.name().to_string(),
                    id: id.to_string(),
                    expected: observed.unwrap_or(0),
                    found: latest.unwrap_or(0),
                };
                if conflicts >= self.policy.conflict_retries {
                    return Err(conflict.into());
                }
                conflicts += 1;
                debug!(collection = %collection, id, conflicts, "version moved, re-reading");
                continue;
            }

            self.put(collection, &next).await?;
            return Ok(next);
        }
    }

    async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        collection: Collection,
        mut call: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 1u32;

        loop {
            let outcome = match tokio::time::timeout(self.policy.op_timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StoreError::Timeout {
                    operation,
                    timeout_ms: u64::try_from(self.policy.op_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                }),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    debug!(
                        operation,
                        collection = %collection,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "store call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = self.policy.next_backoff(backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDocumentStore;
    use crate::testing::{Fault, ScriptedStore};
    use crate::types::UserBalance;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            op_timeout: Duration::from_millis(200),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            conflict_retries: 2,
        }
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_up_to_the_bound() {
        let store = Arc::new(ScriptedStore::new());
        store.fail_puts(Collection::UserBalance, "alice", 2, Fault::Unavailable);
        let client = LedgerStoreClient::new(store.clone(), fast_policy(3));

        client
            .put(Collection::UserBalance, &UserBalance::new("alice"))
            .await
            .unwrap();
        assert_eq!(store.put_attempts(Collection::UserBalance), 3);

        store.fail_puts(Collection::UserBalance, "bob", 5, Fault::Unavailable);
        let err = client
            .put(Collection::UserBalance, &UserBalance::new("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.put_attempts(Collection::UserBalance), 6);
    }

    #[tokio::test]
    async fn terminal_failures_are_not_retried() {
        let store = Arc::new(ScriptedStore::new());
        store.fail_puts(Collection::UserBalance, "alice", 1, Fault::Backend);
        let client = LedgerStoreClient::new(store.clone(), fast_policy(4));

        let err = client
            .put(Collection::UserBalance, &UserBalance::new("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(store.put_attempts(Collection::UserBalance), 1);
    }

    #[tokio::test]
    async fn versioned_update_bumps_version_and_skips_noop_writes() {
        let client = LedgerStoreClient::new(Arc::new(MemoryDocumentStore::new()), fast_policy(1));

        let first: UserBalance = client
            .update_versioned::<_, StoreError, _, _>(
                Collection::UserBalance,
                "alice",
                || UserBalance::new("alice"),
                |balance| {
                    balance.credit(100);
                    Ok(true)
                },
            )
            .await
            .unwrap();
        assert_eq!(first.version, 1);

        let untouched: UserBalance = client
            .update_versioned::<_, StoreError, _, _>(
                Collection::UserBalance,
                "alice",
                || UserBalance::new("alice"),
                |_| Ok(false),
            )
            .await
            .unwrap();
        assert_eq!(untouched.version, 1);
        assert_eq!(untouched.balance, 100);

        let stored: Option<UserBalance> = client
            .find_by_id(Collection::UserBalance, "alice")
            .await
            .unwrap();
        assert_eq!(stored.unwrap().version, 1);
    }

    #[tokio::test]
    async fn reserved_id_never_reaches_the_store_as_a_single_document() {
        let store = Arc::new(ScriptedStore::new());
        store
            .seed(Collection::UserBalance, &UserBalance::new("alice"))
            .await;
        let client = LedgerStoreClient::new(store.clone(), fast_policy(1));

        let err = client.delete(Collection::UserBalance, ALL).await.unwrap_err();
        assert!(matches!(err, StoreError::ReservedId { .. }));
        let err = client
            .put(Collection::UserBalance, &UserBalance::new(ALL))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReservedId { .. }));
        assert_eq!(store.writes(), 0);
        assert_eq!(store.documents(Collection::UserBalance).await.len(), 1);

        client.delete_all(Collection::UserBalance).await.unwrap();
        assert!(store.documents(Collection::UserBalance).await.is_empty());
    }
}
