use crate::compensation::{FailedStep, OperationKind};
use thiserror::Error;

/// Failures surfaced by a document store backend or by the store client wrapped around it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("version conflict on {collection}/{id}: expected {expected}, found {found}")]
    Conflict {
        collection: String,
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("document serialization failed: {0}")]
    Serialization(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("'{id}' is reserved and cannot address a single {collection} document")]
    ReservedId { collection: String, id: String },
}

impl StoreError {
    /// Transient I/O failures worth another attempt. Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Ledger errors.
///
/// Validation variants are raised before any store mutation. `Store` means the call failed
/// without having applied anything. `RolledBack` and `CompensationFailed` report a failure
/// in the middle of a mutation sequence together with the outcome of the compensation run.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds: '{identity}' holds {balance}, transfer requires {required}")]
    InsufficientFunds {
        identity: String,
        balance: i64,
        required: i64,
    },

    #[error("identity '{0}' cannot transfer to itself")]
    SelfTransfer(String),

    #[error("identity '{identity}' owns plan '{plan_id}' and cannot subscribe to it")]
    SelfSubscription { identity: String, plan_id: String },

    #[error("malformed line items: {0}")]
    MalformedLineItems(String),

    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("invalid period token '{0}'")]
    InvalidPeriod(String),

    #[error("plan '{0}' not found")]
    PlanNotFound(String),

    #[error("balance for '{0}' not found")]
    BalanceNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{operation} failed at {step} and was rolled back: {source}")]
    RolledBack {
        operation: OperationKind,
        step: FailedStep,
        #[source]
        source: StoreError,
    },

    #[error(
        "{operation} failed at {step} ({source}); compensation also failed ({compensation}), \
         pending record '{pending_id}'"
    )]
    CompensationFailed {
        operation: OperationKind,
        step: FailedStep,
        #[source]
        source: StoreError,
        compensation: StoreError,
        pending_id: String,
    },
}

impl LedgerError {
    /// True for rejections that never reached the store.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds { .. }
                | Self::SelfTransfer(_)
                | Self::SelfSubscription { .. }
                | Self::MalformedLineItems(_)
                | Self::InvalidAmount(_)
                | Self::InvalidPeriod(_)
                | Self::Store(StoreError::ReservedId { .. })
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PlanNotFound(_) | Self::BalanceNotFound(_))
    }

    /// Collapse a failure of a primary-path step into the store error handed to compensation.
    pub(crate) fn into_store_error(self) -> StoreError {
        match self {
            Self::Store(err) => err,
            other => StoreError::Backend(other.to_string()),
        }
    }
}
