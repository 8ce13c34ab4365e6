use crate::error::LedgerError;
use crate::period::{one_month_after, PeriodToken};
use crate::store::{ensure_single_document, Collection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Documents whose writes go through the optimistic version check.
pub trait Versioned {
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

/// Whether an identity takes part in basic-income crediting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    #[default]
    Individual,
    Business,
}

/// Per-identity balance document (`user_balance`). All amounts are minor units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserBalance {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub balance: i64,
    /// Recurring basic-income amount last credited; always 0 for businesses.
    #[serde(default)]
    pub income: i64,
    /// Period token of the last basic-income credit, empty when never credited.
    #[serde(default)]
    pub last_received: String,
    #[serde(default)]
    pub kind: AccountKind,
    /// Keys of reconciled compensation steps already applied to this balance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_compensations: Vec<String>,
    #[serde(default)]
    pub version: u64,
}

impl UserBalance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            balance: 0,
            income: 0,
            last_received: String::new(),
            kind: AccountKind::Individual,
            applied_compensations: Vec::new(),
            version: 0,
        }
    }

    pub fn business(id: impl Into<String>) -> Self {
        Self {
            kind: AccountKind::Business,
            ..Self::new(id)
        }
    }

    pub fn is_business(&self) -> bool {
        self.kind == AccountKind::Business
    }

    /// Debit with the non-negative pre-check.
    pub fn debit(&mut self, amount: i64) -> Result<(), LedgerError> {
        let remaining = self
            .balance
            .checked_sub(amount)
            .filter(|remaining| *remaining >= 0)
            .ok_or_else(|| LedgerError::InsufficientFunds {
                identity: self.id.clone(),
                balance: self.balance,
                required: amount,
            })?;
        self.balance = remaining;
        Ok(())
    }

    pub fn credit(&mut self, amount: i64) {
        self.balance = self.balance.saturating_add(amount);
    }

    /// Unchecked signed adjustment used by compensation, which may have to take a
    /// receiver below zero if it already spent the credited funds.
    pub fn adjust(&mut self, delta: i64) {
        self.balance = self.balance.saturating_add(delta);
    }

    pub fn received_in(&self, period: &PeriodToken) -> bool {
        period.matches(&self.last_received)
    }

    pub fn apply_income(&mut self, amount: i64, period: &PeriodToken) {
        self.credit(amount);
        self.income = amount;
        self.last_received = period.to_string();
    }

    /// Apply a keyed compensation delta at most once. Returns false when `key` was
    /// already applied to this document.
    pub fn apply_compensation(&mut self, key: &str, delta: i64) -> bool {
        if self.applied_compensations.iter().any(|applied| applied == key) {
            return false;
        }
        self.adjust(delta);
        self.applied_compensations.push(key.to_string());
        true
    }

    /// Drop the keys recorded under `prefix`. Returns false when there was nothing to drop.
    pub fn forget_compensations(&mut self, prefix: &str) -> bool {
        let before = self.applied_compensations.len();
        self.applied_compensations
            .retain(|applied| !applied.starts_with(prefix));
        self.applied_compensations.len() != before
    }
}

impl Versioned for UserBalance {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// One product or service line on a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineItem {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub name: String,
    /// Unit price in minor units.
    pub price: i64,
    #[serde(rename = "amount")]
    pub quantity: i64,
}

impl LineItem {
    pub fn new(name: impl Into<String>, price: i64, quantity: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            price,
            quantity,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn subtotal(&self) -> Option<i64> {
        self.price.checked_mul(self.quantity)
    }
}

/// Sum of `price * quantity`, rejecting empty lists, non-positive values and overflow.
pub fn total_cost(items: &[LineItem]) -> Result<i64, LedgerError> {
    if items.is_empty() {
        return Err(LedgerError::MalformedLineItems(
            "at least one line item is required".to_string(),
        ));
    }

    items.iter().try_fold(0i64, |total, item| {
        if item.price <= 0 || item.quantity <= 0 {
            return Err(LedgerError::MalformedLineItems(format!(
                "line item '{}' needs positive price and quantity (price={}, quantity={})",
                item.name, item.price, item.quantity
            )));
        }
        item.subtotal()
            .and_then(|subtotal| total.checked_add(subtotal))
            .ok_or_else(|| {
                LedgerError::MalformedLineItems(format!(
                    "total overflows at line item '{}'",
                    item.name
                ))
            })
    })
}

/// Immutable, append-only transfer record (`transaction`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub line_items: Vec<LineItem>,
    pub total_cost: i64,
    pub timestamp: DateTime<Utc>,
    pub period: PeriodToken,
    /// Reserved for the external batch settlement process; never set by this crate.
    #[serde(default)]
    pub processed: bool,
}

impl Transaction {
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        line_items: Vec<LineItem>,
        now: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        let (sender_id, receiver_id) = (sender_id.into(), receiver_id.into());
        ensure_single_document(Collection::UserBalance, &sender_id)?;
        ensure_single_document(Collection::UserBalance, &receiver_id)?;
        let total_cost = total_cost(&line_items)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            sender_id,
            receiver_id,
            line_items,
            total_cost,
            timestamp: now,
            period: PeriodToken::from_datetime(now),
            processed: false,
        })
    }

    pub fn verify_total(&self) -> Result<(), LedgerError> {
        let expected = total_cost(&self.line_items)?;
        if expected != self.total_cost {
            return Err(LedgerError::MalformedLineItems(format!(
                "transaction '{}' declares total {} but items sum to {}",
                self.id, self.total_cost, expected
            )));
        }
        Ok(())
    }
}

/// Marker for a transaction whose balance effects were reversed by compensation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrphanedTransaction {
    #[serde(rename = "_id", alias = "id")]
    pub transaction_id: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Monthly recurring-charge plan owned by a business identity (`plan`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub price: i64,
    pub created_by: String,
    #[serde(default)]
    pub version: u64,
}

impl Plan {
    pub fn new(created_by: impl Into<String>, price: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            price,
            created_by: created_by.into(),
            version: 0,
        }
    }

    pub fn as_line_item(&self) -> LineItem {
        LineItem::new("plan", self.price, 1).with_id(self.id.clone())
    }
}

impl Versioned for Plan {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub plan_id: String,
    pub user_id: String,
    /// Plan price at subscription time.
    pub price: i64,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl Subscription {
    pub fn start(plan: &Plan, user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            plan_id: plan.id.clone(),
            user_id: user_id.into(),
            price: plan.price,
            start_date: now,
            end_date: one_month_after(now),
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.end_date
    }
}

/// Shared per-period basic-income amount published by the external indexer (`income`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Income {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub amount: i64,
    pub period: PeriodToken,
}

impl Income {
    pub fn new(amount: i64, period: PeriodToken) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            amount,
            period,
        }
    }
}
