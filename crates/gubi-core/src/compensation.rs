//! Compensation of partially applied mutation sequences.
//!
//! Steps run in the order given (callers pass them reversed relative to the primary path).
//! A step that cannot be applied stops the run; it and every step after it are written to a
//! durable `pending_compensation` record and an operator alert is emitted on the
//! `gubi::alert` target. [`Compensator::reconcile`] retries open records.
//!
//! Balance steps applied by reconciliation are keyed `{pending_id}/{step index}` on the
//! balance document itself, so a pass whose journal update is lost can be re-run without
//! applying the same delta twice.

use crate::client::LedgerStoreClient;
use crate::error::{LedgerError, StoreError};
use crate::locks::{IdentityGuard, IdentityLocks};
use crate::recorder::TransactionRecorder;
use crate::store::{Collection, Filter};
use crate::types::UserBalance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Transfer,
    Subscribe,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transfer => "transfer",
            Self::Subscribe => "subscribe",
        })
    }
}

/// Primary-path step whose failure triggered compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStep {
    Debit,
    Credit,
    Record,
    PersistSubscription,
}

impl fmt::Display for FailedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
            Self::Record => "record",
            Self::PersistSubscription => "persist_subscription",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompensationStep {
    /// Apply `delta` to the freshly read balance.
    AdjustBalance { identity: String, delta: i64 },
    DeleteSubscription { subscription_id: String },
    OrphanTransaction { transaction_id: String, reason: String },
}

impl CompensationStep {
    fn identity(&self) -> Option<&str> {
        match self {
            Self::AdjustBalance { identity, .. } => Some(identity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Open,
    Resolved,
}

/// Durable record of compensation that could not be completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCompensation {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub operation: OperationKind,
    pub operation_id: String,
    pub failed_step: FailedStep,
    /// Steps still outstanding, in execution order.
    pub steps: Vec<CompensationStep>,
    /// Position of `steps[0]` in the original compensation plan.
    #[serde(default)]
    pub step_offset: usize,
    /// Balances carrying applied-step keys for this record.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marked_identities: Vec<String>,
    pub failure: String,
    pub compensation_failure: String,
    pub status: CompensationStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingCompensation {
    pub fn pending_id(operation_id: &str, step: FailedStep) -> String {
        let digest = blake3::hash(format!("{operation_id}:{step}").as_bytes());
        format!("pc-{}", &digest.to_hex()[..24])
    }

    fn step_key(&self, index: usize) -> String {
        format!("{}/{}", self.id, self.step_offset + index)
    }

    fn key_prefix(&self) -> String {
        format!("{}/", self.id)
    }
}

/// Everything needed to undo a failed operation.
#[derive(Debug, Clone)]
pub struct CompensationRequest {
    pub operation: OperationKind,
    pub operation_id: String,
    pub step: FailedStep,
    pub failure: StoreError,
    pub steps: Vec<CompensationStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub resolved: Vec<String>,
    pub still_open: Vec<String>,
}

#[derive(Clone)]
pub struct Compensator {
    client: LedgerStoreClient,
    recorder: TransactionRecorder,
    locks: IdentityLocks,
}

impl Compensator {
    pub fn new(client: LedgerStoreClient, recorder: TransactionRecorder, locks: IdentityLocks) -> Self {
        Self {
            client,
            recorder,
            locks,
        }
    }

    /// Run compensation on its own task so that dropping the caller's future cannot cut it
    /// short. The identity guard is released only after the last step.
    pub async fn run_detached(&self, request: CompensationRequest, guard: IdentityGuard) -> LedgerError {
        let compensator = self.clone();
        let operation = request.operation;
        let step = request.step;
        let failure = request.failure.clone();
        let pending_id = PendingCompensation::pending_id(&request.operation_id, step);

        let task = tokio::spawn(async move {
            let outcome = compensator.compensate(request).await;
            drop(guard);
            outcome
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(join_err) => LedgerError::CompensationFailed {
                operation,
                step,
                source: failure,
                compensation: StoreError::Backend(format!("compensation task aborted: {join_err}")),
                pending_id,
            },
        }
    }

    async fn compensate(&self, request: CompensationRequest) -> LedgerError {
        warn!(
            operation = %request.operation,
            operation_id = %request.operation_id,
            step = %request.step,
            error = %request.failure,
            "compensating partially applied operation"
        );

        let CompensationRequest {
            operation,
            operation_id,
            step,
            failure,
            steps,
        } = request;

        for (index, action) in steps.iter().enumerate() {
            if let Err(compensation) = self.apply(action, None).await {
                let now = Utc::now();
                let record = PendingCompensation {
                    id: PendingCompensation::pending_id(&operation_id, step),
                    operation,
                    operation_id: operation_id.clone(),
                    failed_step: step,
                    steps: steps[index..].to_vec(),
                    step_offset: index,
                    marked_identities: Vec::new(),
                    failure: failure.to_string(),
                    compensation_failure: compensation.to_string(),
                    status: CompensationStatus::Open,
                    attempts: 1,
                    created_at: now,
                    updated_at: now,
                };
                let journaled = self
                    .client
                    .put(Collection::PendingCompensation, &record)
                    .await;
                error!(
                    target: "gubi::alert",
                    pending_id = %record.id,
                    operation = %operation,
                    operation_id = %operation_id,
                    step = %step,
                    outstanding = record.steps.len(),
                    journaled = journaled.is_ok(),
                    error = %compensation,
                    "compensation failed, manual reconciliation required"
                );
                if let Err(journal_err) = journaled {
                    error!(
                        target: "gubi::alert",
                        pending_id = %record.id,
                        record = %serde_json::to_string(&record).unwrap_or_default(),
                        error = %journal_err,
                        "pending compensation record could not be written"
                    );
                }
                return LedgerError::CompensationFailed {
                    operation,
                    step,
                    source: failure,
                    compensation,
                    pending_id: record.id,
                };
            }
        }

        info!(
            operation = %operation,
            operation_id = %operation_id,
            step = %step,
            "operation rolled back"
        );
        LedgerError::RolledBack {
            operation,
            step,
            source: failure,
        }
    }

    /// Apply one step. With a `key`, a balance step already applied under that key is skipped.
    async fn apply(&self, step: &CompensationStep, key: Option<&str>) -> Result<(), StoreError> {
        match step {
            CompensationStep::AdjustBalance { identity, delta } => {
                let delta = *delta;
                self.client
                    .update_versioned::<UserBalance, StoreError, _, _>(
                        Collection::UserBalance,
                        identity,
                        || UserBalance::new(identity.clone()),
                        |balance| match key {
                            Some(key) => Ok(balance.apply_compensation(key, delta)),
                            None => {
                                balance.adjust(delta);
                                Ok(true)
                            }
                        },
                    )
                    .await?;
                Ok(())
            }
            CompensationStep::DeleteSubscription { subscription_id } => {
                self.client
                    .delete(Collection::Subscription, subscription_id)
                    .await
            }
            CompensationStep::OrphanTransaction {
                transaction_id,
                reason,
            } => self.recorder.mark_orphaned(transaction_id, reason).await,
        }
    }

    /// Open pending-compensation records.
    pub async fn pending(&self) -> Result<Vec<PendingCompensation>, StoreError> {
        let mut records: Vec<PendingCompensation> = self
            .client
            .query(Collection::PendingCompensation, &Filter::field("status", "open"))
            .await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Retry every open record. Balance steps take the identity locks like any mutation.
    ///
    /// A record whose journal update fails stays open and is reported in `still_open`; the
    /// remaining records are still processed.
    pub async fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();

        for mut record in self.pending().await? {
            let identities: Vec<String> = record
                .steps
                .iter()
                .filter_map(CompensationStep::identity)
                .map(str::to_string)
                .collect();
            let lock_ids: Vec<&str> = identities.iter().map(String::as_str).collect();
            let guard = self.locks.acquire(&lock_ids).await;

            let mut applied = 0;
            let mut failure = None;
            for (index, step) in record.steps.iter().enumerate() {
                let key = record.step_key(index);
                match self.apply(step, Some(&key)).await {
                    Ok(()) => applied += 1,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            drop(guard);

            for identity in identities {
                if !record.marked_identities.contains(&identity) {
                    record.marked_identities.push(identity);
                }
            }
            record.steps.drain(..applied);
            record.step_offset += applied;
            record.attempts += 1;
            record.updated_at = Utc::now();
            if let Some(err) = &failure {
                warn!(pending_id = %record.id, outstanding = record.steps.len(), error = %err, "reconciliation incomplete");
                record.compensation_failure = err.to_string();
            } else {
                record.status = CompensationStatus::Resolved;
            }

            if let Err(journal_err) = self
                .client
                .put(Collection::PendingCompensation, &record)
                .await
            {
                error!(
                    target: "gubi::alert",
                    pending_id = %record.id,
                    applied,
                    error = %journal_err,
                    "reconciliation progress could not be journaled"
                );
                report.still_open.push(record.id.clone());
                continue;
            }

            if failure.is_some() {
                report.still_open.push(record.id.clone());
            } else {
                info!(pending_id = %record.id, operation_id = %record.operation_id, "pending compensation resolved");
                self.forget_step_keys(&record).await;
                report.resolved.push(record.id.clone());
            }
        }

        Ok(report)
    }

    /// Best effort: a key left behind only costs space on the balance document.
    async fn forget_step_keys(&self, record: &PendingCompensation) {
        let prefix = record.key_prefix();
        for identity in &record.marked_identities {
            let _guard = self.locks.acquire(&[identity.as_str()]).await;
            let cleared = self
                .client
                .update_versioned::<UserBalance, StoreError, _, _>(
                    Collection::UserBalance,
                    identity,
                    || UserBalance::new(identity.clone()),
                    |balance| Ok(balance.forget_compensations(&prefix)),
                )
                .await;
            if let Err(err) = cleared {
                warn!(pending_id = %record.id, identity = %identity, error = %err, "could not clear applied-step keys");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RetryPolicy;
    use crate::testing::{Fault, ScriptedStore};
    use std::sync::Arc;

    fn compensator(store: Arc<ScriptedStore>) -> Compensator {
        let client = LedgerStoreClient::new(store, RetryPolicy::no_retry());
        let recorder = TransactionRecorder::new(client.clone());
        Compensator::new(client, recorder, IdentityLocks::new())
    }

    fn request(steps: Vec<CompensationStep>) -> CompensationRequest {
        CompensationRequest {
            operation: OperationKind::Transfer,
            operation_id: "tx-1".to_string(),
            step: FailedStep::Record,
            failure: StoreError::Unavailable("record".into()),
            steps,
        }
    }

    #[test]
    fn pending_id_is_stable_per_operation_and_step() {
        let a = PendingCompensation::pending_id("tx-1", FailedStep::Record);
        assert_eq!(a, PendingCompensation::pending_id("tx-1", FailedStep::Record));
        assert_ne!(a, PendingCompensation::pending_id("tx-1", FailedStep::Credit));
        assert!(a.starts_with("pc-"));
        assert_eq!(a.len(), 27);
    }

    #[tokio::test]
    async fn failed_step_and_remainder_are_journaled_then_reconciled() {
        let store = Arc::new(ScriptedStore::new());
        let mut bob = UserBalance::new("bob");
        bob.credit(300);
        store.seed(Collection::UserBalance, &bob).await;
        store.fail_puts(Collection::UserBalance, "alice", 1, Fault::Unavailable);
        let compensator = compensator(store.clone());

        let locks = IdentityLocks::new();
        let guard = locks.acquire(&["alice", "bob"]).await;
        let err = compensator
            .run_detached(
                request(vec![
                    CompensationStep::AdjustBalance {
                        identity: "bob".into(),
                        delta: -300,
                    },
                    CompensationStep::AdjustBalance {
                        identity: "alice".into(),
                        delta: 300,
                    },
                ]),
                guard,
            )
            .await;

        let pending_id = match err {
            LedgerError::CompensationFailed { pending_id, .. } => pending_id,
            other => panic!("unexpected outcome: {other}"),
        };
        let open = compensator.pending().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, pending_id);
        assert_eq!(open[0].steps.len(), 1);

        let report = compensator.reconcile().await.unwrap();
        assert_eq!(report.resolved, vec![pending_id]);
        assert!(compensator.pending().await.unwrap().is_empty());

        let alice: UserBalance = compensator
            .client
            .find_by_id(Collection::UserBalance, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alice.balance, 300);
    }

    async fn balance_of(compensator: &Compensator, identity: &str) -> UserBalance {
        compensator
            .client
            .find_by_id(Collection::UserBalance, identity)
            .await
            .unwrap()
            .unwrap()
    }

    async fn seed_balance(store: &ScriptedStore, identity: &str, amount: i64) {
        let mut balance = UserBalance::new(identity);
        balance.credit(amount);
        store.seed(Collection::UserBalance, &balance).await;
    }

    async fn journaled(compensator: &Compensator, request: CompensationRequest) -> String {
        let guard = IdentityLocks::new().acquire(&["alice", "bob", "carol"]).await;
        match compensator.run_detached(request, guard).await {
            LedgerError::CompensationFailed { pending_id, .. } => pending_id,
            other => panic!("unexpected outcome: {other}"),
        }
    }

    #[tokio::test]
    async fn lost_journal_update_does_not_reapply_balance_steps() {
        let store = Arc::new(ScriptedStore::new());
        seed_balance(&store, "alice", 4_000).await;
        seed_balance(&store, "bob", 1_000).await;
        seed_balance(&store, "carol", 0).await;
        let compensator = compensator(store.clone());

        store.fail_puts(Collection::UserBalance, "bob", 1, Fault::Unavailable);
        let refund = journaled(
            &compensator,
            request(vec![
                CompensationStep::AdjustBalance {
                    identity: "bob".into(),
                    delta: -1_000,
                },
                CompensationStep::AdjustBalance {
                    identity: "alice".into(),
                    delta: 1_000,
                },
            ]),
        )
        .await;
        store.fail_puts(Collection::UserBalance, "carol", 1, Fault::Unavailable);
        let other = journaled(
            &compensator,
            CompensationRequest {
                operation_id: "tx-2".to_string(),
                ..request(vec![CompensationStep::AdjustBalance {
                    identity: "carol".into(),
                    delta: 250,
                }])
            },
        )
        .await;
        assert_eq!(compensator.pending().await.unwrap().len(), 2);

        store.fail_puts(Collection::PendingCompensation, &refund, 1, Fault::Backend);
        let report = compensator.reconcile().await.unwrap();
        assert_eq!(report.still_open, vec![refund.clone()]);
        assert_eq!(report.resolved, vec![other]);
        assert_eq!(balance_of(&compensator, "alice").await.balance, 5_000);
        assert_eq!(balance_of(&compensator, "bob").await.balance, 0);
        assert_eq!(balance_of(&compensator, "carol").await.balance, 250);

        let still_open = compensator.pending().await.unwrap();
        assert_eq!(still_open.len(), 1);
        assert_eq!(still_open[0].steps.len(), 2);

        let report = compensator.reconcile().await.unwrap();
        assert_eq!(report.resolved, vec![refund]);
        assert!(compensator.pending().await.unwrap().is_empty());

        let alice = balance_of(&compensator, "alice").await;
        let bob = balance_of(&compensator, "bob").await;
        assert_eq!(alice.balance, 5_000);
        assert_eq!(bob.balance, 0);
        assert!(alice.applied_compensations.is_empty());
        assert!(bob.applied_compensations.is_empty());
    }

    #[tokio::test]
    async fn complete_run_reports_rolled_back() {
        let store = Arc::new(ScriptedStore::new());
        let compensator = compensator(store.clone());
        let guard = IdentityLocks::new().acquire(&["alice"]).await;

        let err = compensator
            .run_detached(
                request(vec![CompensationStep::OrphanTransaction {
                    transaction_id: "tx-1".into(),
                    reason: "test".into(),
                }]),
                guard,
            )
            .await;
        assert!(matches!(err, LedgerError::RolledBack { .. }));
        assert!(compensator.recorder.orphaned_ids().await.unwrap().contains("tx-1"));
    }
}
