use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier field every document is keyed by in the replicated store.
pub const ID_FIELD: &str = "_id";

/// Reserved filter key / delete id addressing the whole collection.
pub const ALL: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    UserBalance,
    Transaction,
    Plan,
    Subscription,
    Income,
    PendingCompensation,
    OrphanedTransaction,
}

impl Collection {
    pub fn name(self) -> &'static str {
        match self {
            Self::UserBalance => "user_balance",
            Self::Transaction => "transaction",
            Self::Plan => "plan",
            Self::Subscription => "subscription",
            Self::Income => "income",
            Self::PendingCompensation => "pending_compensation",
            Self::OrphanedTransaction => "orphaned_transaction",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Query filter mirroring the store's `(filterKey, filterValue)` pair.
///
/// `Fields` OR-matches `value` against each named field. `id` is normalized to `_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    Fields { keys: Vec<String>, value: String },
}

impl Filter {
    pub fn all() -> Self {
        Self::All
    }

    pub fn field(key: &str, value: impl Into<String>) -> Self {
        Self::any_of(&[key], value)
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::field(ID_FIELD, id)
    }

    pub fn any_of(keys: &[&str], value: impl Into<String>) -> Self {
        Self::Fields {
            keys: keys.iter().map(|key| normalize_key(key)).collect(),
            value: value.into(),
        }
    }

    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Fields { keys, value } => keys.iter().any(|key| {
                field_value(document, key)
                    .map(|found| found == *value)
                    .unwrap_or(false)
            }),
        }
    }
}

fn normalize_key(key: &str) -> String {
    let key = key.trim();
    if key == "id" {
        ID_FIELD.to_string()
    } else {
        key.to_string()
    }
}

fn field_value(document: &Value, key: &str) -> Option<String> {
    let raw = match document.get(key) {
        Some(value) => value,
        None if key == ID_FIELD => document.get("id")?,
        None => return None,
    };
    match raw {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Refuse the reserved [`ALL`] id where a single document is meant.
pub fn ensure_single_document(collection: Collection, id: &str) -> Result<(), StoreError> {
    if id == ALL {
        return Err(StoreError::ReservedId {
            collection: collection.name().to_string(),
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Read the identifier of a raw document (`_id`, falling back to `id`).
pub fn document_id(document: &Value) -> Result<String, StoreError> {
    document
        .get(ID_FIELD)
        .or_else(|| document.get("id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| StoreError::Serialization("document has no string '_id' field".to_string()))
}

/// Replicated document store contract.
///
/// No transactions, no partial updates, no compare-and-swap: `put` replaces the whole
/// document keyed by its own `_id` and the last write wins. `delete` with [`ALL`] drops the
/// entire collection. Deleting a missing id is not an error.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn put(&self, collection: Collection, document: Value) -> Result<(), StoreError>;

    async fn query(&self, collection: Collection, filter: &Filter)
        -> Result<Vec<Value>, StoreError>;

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), StoreError>;
}
