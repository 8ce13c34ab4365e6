use crate::client::LedgerStoreClient;
use crate::error::{LedgerError, StoreError};
use crate::period::PeriodToken;
use crate::store::{Collection, Filter};
use crate::types::{OrphanedTransaction, Transaction};
use chrono::Utc;
use std::collections::HashSet;
use tracing::debug;

/// Append-only transaction log. Writes never compensate; callers own that decision.
#[derive(Clone)]
pub struct TransactionRecorder {
    client: LedgerStoreClient,
}

impl TransactionRecorder {
    pub fn new(client: LedgerStoreClient) -> Self {
        Self { client }
    }

    pub async fn store(&self, tx: &Transaction) -> Result<(), LedgerError> {
        tx.verify_total()?;
        self.client.put(Collection::Transaction, tx).await?;
        debug!(transaction_id = %tx.id, period = %tx.period, "transaction recorded");
        Ok(())
    }

    pub async fn get(&self, transaction_id: &str) -> Result<Option<Transaction>, StoreError> {
        self.client
            .find_by_id(Collection::Transaction, transaction_id)
            .await
    }

    /// Transactions sent or received by `identity`, most recent first.
    pub async fn history_for(&self, identity: &str) -> Result<Vec<Transaction>, StoreError> {
        let mut transactions: Vec<Transaction> = self
            .client
            .query(
                Collection::Transaction,
                &Filter::any_of(&["sender_id", "receiver_id"], identity),
            )
            .await?;
        let orphaned = self.orphaned_ids().await?;
        transactions.retain(|tx| !orphaned.contains(&tx.id));
        transactions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(transactions)
    }

    /// Feed for the external batch process: the period's transactions not yet processed,
    /// oldest first.
    pub async fn unprocessed_for_period(
        &self,
        period: &PeriodToken,
    ) -> Result<Vec<Transaction>, StoreError> {
        let mut transactions: Vec<Transaction> = self
            .client
            .query(Collection::Transaction, &Filter::field("period", period.to_string()))
            .await?;
        let orphaned = self.orphaned_ids().await?;
        transactions.retain(|tx| !tx.processed && !orphaned.contains(&tx.id));
        transactions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(transactions)
    }

    pub async fn mark_orphaned(&self, transaction_id: &str, reason: &str) -> Result<(), StoreError> {
        let marker = OrphanedTransaction {
            transaction_id: transaction_id.to_string(),
            reason: reason.to_string(),
            recorded_at: Utc::now(),
        };
        self.client
            .put(Collection::OrphanedTransaction, &marker)
            .await
    }

    pub async fn orphaned_ids(&self) -> Result<HashSet<String>, StoreError> {
        let markers: Vec<OrphanedTransaction> = self
            .client
            .query(Collection::OrphanedTransaction, &Filter::all())
            .await?;
        Ok(markers
            .into_iter()
            .map(|marker| marker.transaction_id)
            .collect())
    }
}
