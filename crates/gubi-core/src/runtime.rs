use crate::client::{LedgerStoreClient, RetryPolicy};
use crate::compensation::Compensator;
use crate::error::{LedgerError, StoreError};
use crate::income::IncomeScheduler;
use crate::locks::IdentityLocks;
use crate::plans::PlanRegistry;
use crate::recorder::TransactionRecorder;
use crate::storage::{connect_store, StoreConfig};
use crate::store::{ensure_single_document, Collection, DocumentStore, Filter};
use crate::subscriptions::SubscriptionManager;
use crate::transfer::TransferEngine;
use crate::types::{AccountKind, Plan, UserBalance};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Ledger runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct LedgerEngineConfig {
    pub store: StoreConfig,
    pub retry: RetryPolicy,
}

/// Wires the ledger components over one store client and one lock registry.
#[derive(Clone)]
pub struct LedgerEngine {
    client: LedgerStoreClient,
    recorder: TransactionRecorder,
    transfers: TransferEngine,
    plans: PlanRegistry,
    subscriptions: SubscriptionManager,
    income: IncomeScheduler,
    compensator: Compensator,
    locks: IdentityLocks,
}

impl LedgerEngine {
    pub async fn bootstrap(config: LedgerEngineConfig) -> Result<Self, StoreError> {
        let store = connect_store(&config.store).await?;
        info!(backend = config.store.label(), "ledger store connected");
        Ok(Self::with_store(store, config.retry))
    }

    pub fn with_store(store: Arc<dyn DocumentStore>, retry: RetryPolicy) -> Self {
        let client = LedgerStoreClient::new(store, retry);
        let locks = IdentityLocks::new();
        let recorder = TransactionRecorder::new(client.clone());
        let compensator = Compensator::new(client.clone(), recorder.clone(), locks.clone());
        let transfers = TransferEngine::new(
            client.clone(),
            recorder.clone(),
            locks.clone(),
            compensator.clone(),
        );
        let plans = PlanRegistry::new(client.clone(), locks.clone());
        let subscriptions = SubscriptionManager::new(
            client.clone(),
            plans.clone(),
            transfers.clone(),
            compensator.clone(),
            locks.clone(),
        );
        let income = IncomeScheduler::new(client.clone(), locks.clone());

        Self {
            client,
            recorder,
            transfers,
            plans,
            subscriptions,
            income,
            compensator,
            locks,
        }
    }

    pub fn backend_label(&self) -> &'static str {
        self.client.backend()
    }

    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    pub fn recorder(&self) -> &TransactionRecorder {
        &self.recorder
    }

    pub fn plans(&self) -> &PlanRegistry {
        &self.plans
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn income(&self) -> &IncomeScheduler {
        &self.income
    }

    pub fn compensations(&self) -> &Compensator {
        &self.compensator
    }

    pub async fn balance(&self, identity: &str) -> Result<Option<UserBalance>, StoreError> {
        self.client.find_by_id(Collection::UserBalance, identity).await
    }

    pub async fn open_account(
        &self,
        identity: &str,
        kind: AccountKind,
        now: DateTime<Utc>,
    ) -> Result<(UserBalance, bool), LedgerError> {
        self.income.open_account(identity, kind, now).await
    }

    /// Remove the identity's balance and every plan it owns. Returns the removed plan count.
    pub async fn close_account(&self, identity: &str) -> Result<usize, LedgerError> {
        ensure_single_document(Collection::UserBalance, identity)?;
        let _guard = self.locks.acquire(&[identity]).await;

        let owned: Vec<Plan> = self
            .client
            .query(Collection::Plan, &Filter::field("created_by", identity))
            .await?;
        for plan in &owned {
            self.plans.delete_plan(&plan.id).await?;
        }
        self.client.delete(Collection::UserBalance, identity).await?;

        info!(identity, plans_removed = owned.len(), "account closed");
        Ok(owned.len())
    }

    /// Administrative reset: drop an entire collection.
    pub async fn reset_collection(&self, collection: Collection) -> Result<(), StoreError> {
        warn!(collection = %collection, "resetting collection");
        self.client.delete_all(collection).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::PeriodToken;
    use crate::types::LineItem;
    use chrono::TimeZone;

    #[tokio::test]
    async fn memory_bootstrap_runs_end_to_end() {
        let engine = LedgerEngine::bootstrap(LedgerEngineConfig::default())
            .await
            .unwrap();
        assert_eq!(engine.backend_label(), "memory");

        let now = Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap();
        engine
            .income()
            .publish_income(100_000, PeriodToken::new(2024, 5).unwrap())
            .await
            .unwrap();
        engine
            .open_account("alice", AccountKind::Individual, now)
            .await
            .unwrap();
        engine
            .open_account("shop", AccountKind::Business, now)
            .await
            .unwrap();

        let plan = engine.plans().create_or_update("shop", 2_000).await.unwrap();
        engine
            .subscriptions()
            .subscribe("alice", &plan.id, now)
            .await
            .unwrap();
        engine
            .transfers()
            .transfer("alice", "shop", vec![LineItem::new("coffee", 350, 2)], now)
            .await
            .unwrap();

        assert_eq!(engine.balance("alice").await.unwrap().unwrap().balance, 97_300);
        assert_eq!(engine.balance("shop").await.unwrap().unwrap().balance, 2_700);
        assert_eq!(engine.recorder().history_for("shop").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn close_account_removes_balance_and_plan() {
        let engine = LedgerEngine::bootstrap(LedgerEngineConfig::default())
            .await
            .unwrap();
        engine.income().ensure_business_balance("shop").await.unwrap();
        engine.plans().create_or_update("shop", 900).await.unwrap();

        assert_eq!(engine.close_account("shop").await.unwrap(), 1);
        assert!(engine.balance("shop").await.unwrap().is_none());
        assert!(engine.plans().list_plans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closing_the_reserved_identity_touches_nothing() {
        let engine = LedgerEngine::bootstrap(LedgerEngineConfig::default())
            .await
            .unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap();
        engine
            .income()
            .publish_income(1_000, PeriodToken::new(2024, 5).unwrap())
            .await
            .unwrap();
        for identity in ["alice", "bob"] {
            engine
                .open_account(identity, AccountKind::Individual, now)
                .await
                .unwrap();
        }
        engine.plans().create_or_update("carol", 900).await.unwrap();

        let err = engine.close_account("all").await.unwrap_err();
        assert!(err.is_validation());
        assert!(engine.balance("alice").await.unwrap().is_some());
        assert!(engine.balance("bob").await.unwrap().is_some());
        assert_eq!(engine.plans().list_plans().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reset_collection_clears_everything_in_it() {
        let engine = LedgerEngine::bootstrap(LedgerEngineConfig::default())
            .await
            .unwrap();
        engine.plans().create_or_update("a", 1).await.unwrap();
        engine.plans().create_or_update("b", 2).await.unwrap();

        engine.reset_collection(Collection::Plan).await.unwrap();
        assert!(engine.plans().list_plans().await.unwrap().is_empty());
    }
}
