//! cyber-gubi ledger core.
//!
//! Per-identity balances, an append-only transaction log, plan subscriptions and a
//! once-per-period basic-income credit, kept approximately consistent on top of a replicated
//! document store that offers neither multi-document atomicity nor compare-and-swap.
//! Partial failures are undone by compensation; compensation that cannot finish is journaled
//! for reconciliation instead of aborting the process.

#![deny(unsafe_code)]

pub mod client;
pub mod compensation;
pub mod error;
pub mod income;
pub mod locks;
pub mod period;
pub mod plans;
pub mod recorder;
pub mod runtime;
pub mod storage;
pub mod store;
pub mod subscriptions;
pub mod transfer;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{LedgerStoreClient, RetryPolicy};
pub use compensation::{
    CompensationRequest, CompensationStatus, CompensationStep, Compensator, FailedStep,
    OperationKind, PendingCompensation, ReconcileReport,
};
pub use error::{LedgerError, StoreError};
pub use income::IncomeScheduler;
pub use locks::{IdentityGuard, IdentityLocks};
pub use period::PeriodToken;
pub use plans::PlanRegistry;
pub use recorder::TransactionRecorder;
pub use runtime::{LedgerEngine, LedgerEngineConfig};
pub use storage::{connect_store, MemoryDocumentStore, PostgresDocumentStore, StoreConfig};
pub use store::{Collection, DocumentStore, Filter};
pub use subscriptions::SubscriptionManager;
pub use transfer::TransferEngine;
pub use types::{
    AccountKind, Income, LineItem, OrphanedTransaction, Plan, Subscription, Transaction,
    UserBalance, Versioned,
};
