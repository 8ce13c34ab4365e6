use crate::client::LedgerStoreClient;
use crate::compensation::{CompensationRequest, CompensationStep, Compensator, FailedStep, OperationKind};
use crate::error::LedgerError;
use crate::locks::{IdentityGuard, IdentityLocks};
use crate::recorder::TransactionRecorder;
use crate::store::Collection;
use crate::types::{LineItem, Transaction, UserBalance};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Debit, credit, record. Each step is a whole-document write preceded by a fresh read.
#[derive(Clone)]
pub struct TransferEngine {
    client: LedgerStoreClient,
    recorder: TransactionRecorder,
    locks: IdentityLocks,
    compensator: Compensator,
}

impl TransferEngine {
    pub fn new(
        client: LedgerStoreClient,
        recorder: TransactionRecorder,
        locks: IdentityLocks,
        compensator: Compensator,
    ) -> Self {
        Self {
            client,
            recorder,
            locks,
            compensator,
        }
    }

    pub async fn transfer(
        &self,
        sender_id: &str,
        receiver_id: &str,
        line_items: Vec<LineItem>,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        if sender_id == receiver_id {
            return Err(LedgerError::SelfTransfer(sender_id.to_string()));
        }
        let tx = Transaction::new(sender_id, receiver_id, line_items, now)?;

        let guard = self.locks.acquire(&[sender_id, receiver_id]).await;
        let (tx, _guard) = self.execute(tx, guard).await?;
        Ok(tx)
    }

    /// Run the mutation sequence for an already validated transaction under a guard that
    /// covers both parties. The guard is handed back on success so callers can extend the
    /// sequence, and is consumed by compensation on failure.
    pub(crate) async fn execute(
        &self,
        tx: Transaction,
        guard: IdentityGuard,
    ) -> Result<(Transaction, IdentityGuard), LedgerError> {
        let total = tx.total_cost;

        let debited = self
            .client
            .update_versioned::<UserBalance, LedgerError, _, _>(
                Collection::UserBalance,
                &tx.sender_id,
                || UserBalance::new(tx.sender_id.clone()),
                |balance| {
                    balance.debit(total)?;
                    Ok(true)
                },
            )
            .await;
        if let Err(err) = debited {
            if err.is_validation() {
                info!(transfer_id = %tx.id, sender = %tx.sender_id, total, error = %err, "transfer rejected");
            } else {
                warn!(transfer_id = %tx.id, sender = %tx.sender_id, error = %err, "debit failed, nothing applied");
            }
            return Err(err);
        }

        let credited = self
            .client
            .update_versioned::<UserBalance, LedgerError, _, _>(
                Collection::UserBalance,
                &tx.receiver_id,
                || UserBalance::new(tx.receiver_id.clone()),
                |balance| {
                    balance.credit(total);
                    Ok(true)
                },
            )
            .await;
        if let Err(err) = credited {
            let request = CompensationRequest {
                operation: OperationKind::Transfer,
                operation_id: tx.id.clone(),
                step: FailedStep::Credit,
                failure: err.into_store_error(),
                steps: vec![CompensationStep::AdjustBalance {
                    identity: tx.sender_id.clone(),
                    delta: total,
                }],
            };
            return Err(self.compensator.run_detached(request, guard).await);
        }

        if let Err(err) = self.recorder.store(&tx).await {
            let request = CompensationRequest {
                operation: OperationKind::Transfer,
                operation_id: tx.id.clone(),
                step: FailedStep::Record,
                failure: err.into_store_error(),
                steps: vec![
                    CompensationStep::AdjustBalance {
                        identity: tx.receiver_id.clone(),
                        delta: -total,
                    },
                    CompensationStep::AdjustBalance {
                        identity: tx.sender_id.clone(),
                        delta: total,
                    },
                ],
            };
            return Err(self.compensator.run_detached(request, guard).await);
        }

        info!(
            transfer_id = %tx.id,
            sender = %tx.sender_id,
            receiver = %tx.receiver_id,
            total,
            period = %tx.period,
            "transfer completed"
        );
        Ok((tx, guard))
    }

    /// Compensation plan undoing a fully applied transfer: orphan the record, take the
    /// amount back from the receiver, return it to the sender.
    pub fn reversal(tx: &Transaction, reason: &str) -> Vec<CompensationStep> {
        vec![
            CompensationStep::OrphanTransaction {
                transaction_id: tx.id.clone(),
                reason: reason.to_string(),
            },
            CompensationStep::AdjustBalance {
                identity: tx.receiver_id.clone(),
                delta: -tx.total_cost,
            },
            CompensationStep::AdjustBalance {
                identity: tx.sender_id.clone(),
                delta: tx.total_cost,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RetryPolicy;
    use crate::compensation::PendingCompensation;
    use crate::error::StoreError;
    use crate::testing::{Fault, ScriptedStore};
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        store: Arc<ScriptedStore>,
        client: LedgerStoreClient,
        recorder: TransactionRecorder,
        compensator: Compensator,
        engine: TransferEngine,
    }

    fn harness_with(policy: RetryPolicy) -> Harness {
        let store = Arc::new(ScriptedStore::new());
        let client = LedgerStoreClient::new(store.clone(), policy);
        let recorder = TransactionRecorder::new(client.clone());
        let locks = IdentityLocks::new();
        let compensator = Compensator::new(client.clone(), recorder.clone(), locks.clone());
        let engine = TransferEngine::new(client.clone(), recorder.clone(), locks, compensator.clone());
        Harness {
            store,
            client,
            recorder,
            compensator,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_with(RetryPolicy::no_retry())
    }

    async fn seed_balance(store: &ScriptedStore, id: &str, amount: i64) {
        let mut balance = UserBalance::new(id);
        balance.credit(amount);
        store.seed(Collection::UserBalance, &balance).await;
    }

    async fn balance_of(client: &LedgerStoreClient, id: &str) -> i64 {
        client
            .find_by_id::<UserBalance>(Collection::UserBalance, id)
            .await
            .unwrap()
            .map(|balance| balance.balance)
            .unwrap_or(0)
    }

    fn items() -> Vec<LineItem> {
        vec![LineItem::new("bread", 250, 2), LineItem::new("milk", 125, 4)]
    }

    #[tokio::test]
    async fn successful_transfer_moves_total_and_records_once() {
        let h = harness();
        seed_balance(&h.store, "alice", 10_000).await;
        seed_balance(&h.store, "bob", 700).await;

        let tx = h
            .engine
            .transfer("alice", "bob", items(), Utc::now())
            .await
            .unwrap();

        assert_eq!(tx.total_cost, 1_000);
        assert_eq!(balance_of(&h.client, "alice").await, 9_000);
        assert_eq!(balance_of(&h.client, "bob").await, 1_700);
        let history = h.recorder.history_for("alice").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].total_cost, 1_000);
    }

    #[tokio::test]
    async fn insufficient_funds_writes_nothing() {
        let h = harness();
        seed_balance(&h.store, "alice", 500).await;

        let err = h
            .engine
            .transfer("alice", "bob", vec![LineItem::new("tv", 1_000, 1)], Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LedgerError::InsufficientFunds {
                balance: 500,
                required: 1_000,
                ..
            }
        ));
        assert_eq!(h.store.writes(), 0);
        assert!(h.store.documents(Collection::Transaction).await.is_empty());
    }

    #[tokio::test]
    async fn validation_failures_never_reach_the_store() {
        let h = harness();
        assert!(matches!(
            h.engine.transfer("alice", "alice", items(), Utc::now()).await,
            Err(LedgerError::SelfTransfer(_))
        ));
        assert!(matches!(
            h.engine.transfer("alice", "bob", Vec::new(), Utc::now()).await,
            Err(LedgerError::MalformedLineItems(_))
        ));
        let err = h
            .engine
            .transfer("alice", "all", items(), Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(h.store.put_attempts(Collection::UserBalance), 0);
    }

    #[tokio::test]
    async fn credit_failure_restores_sender() {
        let h = harness();
        seed_balance(&h.store, "alice", 5_000).await;
        h.store
            .fail_puts(Collection::UserBalance, "bob", 1, Fault::Unavailable);

        let err = h
            .engine
            .transfer("alice", "bob", items(), Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LedgerError::RolledBack {
                step: FailedStep::Credit,
                ..
            }
        ));
        assert_eq!(balance_of(&h.client, "alice").await, 5_000);
        assert_eq!(balance_of(&h.client, "bob").await, 0);
        assert!(h.store.documents(Collection::Transaction).await.is_empty());
    }

    #[tokio::test]
    async fn record_failure_restores_both_parties() {
        let h = harness();
        seed_balance(&h.store, "alice", 5_000).await;
        seed_balance(&h.store, "bob", 300).await;
        h.store
            .fail_every_put(Collection::Transaction, 1, Fault::Unavailable);

        let err = h
            .engine
            .transfer("alice", "bob", items(), Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LedgerError::RolledBack {
                step: FailedStep::Record,
                ..
            }
        ));
        assert_eq!(balance_of(&h.client, "alice").await, 5_000);
        assert_eq!(balance_of(&h.client, "bob").await, 300);
        assert!(h.recorder.history_for("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn timed_out_credit_is_compensated() {
        let h = harness_with(RetryPolicy {
            op_timeout: Duration::from_millis(50),
            ..RetryPolicy::no_retry()
        });
        seed_balance(&h.store, "alice", 5_000).await;
        h.store.fail_puts(Collection::UserBalance, "bob", 1, Fault::Hang);

        let err = h
            .engine
            .transfer("alice", "bob", items(), Utc::now())
            .await
            .unwrap_err();

        match err {
            LedgerError::RolledBack { source, .. } => {
                assert!(matches!(source, StoreError::Timeout { operation: "put", .. }))
            }
            other => panic!("unexpected outcome: {other}"),
        }
        assert_eq!(balance_of(&h.client, "alice").await, 5_000);
    }

    #[tokio::test]
    async fn failed_compensation_is_journaled_not_fatal() {
        let h = harness();
        seed_balance(&h.store, "alice", 5_000).await;
        h.store
            .fail_every_put(Collection::Transaction, 1, Fault::Unavailable);
        h.store
            .fail_puts_after(Collection::UserBalance, "bob", 1, 1, Fault::Unavailable);

        let err = h
            .engine
            .transfer("alice", "bob", items(), Utc::now())
            .await
            .unwrap_err();

        let (tx_step, pending_id) = match err {
            LedgerError::CompensationFailed {
                step, pending_id, ..
            } => (step, pending_id),
            other => panic!("unexpected outcome: {other}"),
        };
        assert_eq!(tx_step, FailedStep::Record);
        assert_eq!(balance_of(&h.client, "alice").await, 4_000);
        assert_eq!(balance_of(&h.client, "bob").await, 1_000);

        let open: Vec<PendingCompensation> = h.compensator.pending().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, pending_id);
        assert_eq!(open[0].steps.len(), 2);

        let report = h.compensator.reconcile().await.unwrap();
        assert_eq!(report.resolved, vec![pending_id]);
        assert_eq!(balance_of(&h.client, "alice").await, 5_000);
        assert_eq!(balance_of(&h.client, "bob").await, 0);
    }

    #[tokio::test]
    async fn concurrent_credits_to_one_receiver_are_not_lost_locally() {
        let h = harness();
        for sender in ["s1", "s2", "s3", "s4"] {
            seed_balance(&h.store, sender, 1_000).await;
        }

        let mut tasks = Vec::new();
        for sender in ["s1", "s2", "s3", "s4"] {
            let engine = h.engine.clone();
            tasks.push(tokio::spawn(async move {
                engine
                    .transfer(sender, "shop", vec![LineItem::new("item", 100, 1)], Utc::now())
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(balance_of(&h.client, "shop").await, 400);
    }

    #[test]
    fn reversal_undoes_in_reverse_order() {
        let tx = Transaction::new("a", "b", vec![LineItem::new("x", 10, 3)], Utc::now()).unwrap();
        let steps = TransferEngine::reversal(&tx, "subscription write failed");
        assert!(matches!(steps[0], CompensationStep::OrphanTransaction { .. }));
        assert_eq!(
            steps[1],
            CompensationStep::AdjustBalance {
                identity: "b".into(),
                delta: -30
            }
        );
        assert_eq!(
            steps[2],
            CompensationStep::AdjustBalance {
                identity: "a".into(),
                delta: 30
            }
        );
    }
}
