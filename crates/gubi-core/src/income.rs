use crate::client::LedgerStoreClient;
use crate::error::{LedgerError, StoreError};
use crate::locks::IdentityLocks;
use crate::period::PeriodToken;
use crate::store::{Collection, Filter};
use crate::types::{AccountKind, Income, UserBalance};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Once-per-period basic-income crediting.
#[derive(Clone)]
pub struct IncomeScheduler {
    client: LedgerStoreClient,
    locks: IdentityLocks,
}

impl IncomeScheduler {
    pub fn new(client: LedgerStoreClient, locks: IdentityLocks) -> Self {
        Self { client, locks }
    }

    /// Credit the period's shared income unless this identity already received it.
    /// Business balances are never credited.
    ///
    /// Returns the resulting balance and whether a credit was applied. A period whose income
    /// record has not been published yet is not an error: nothing is written and `false` is
    /// returned.
    pub async fn credit_income_if_due(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<(UserBalance, bool), LedgerError> {
        let period = PeriodToken::from_datetime(now);
        let _guard = self.locks.acquire(&[identity]).await;

        let current: Option<UserBalance> = self
            .client
            .find_by_id(Collection::UserBalance, identity)
            .await?;
        if let Some(balance) = current.as_ref().filter(|b| b.is_business()) {
            debug!(identity, "business balance, no basic income");
            return Ok((balance.clone(), false));
        }
        if let Some(balance) = current.as_ref().filter(|b| b.received_in(&period)) {
            debug!(identity, period = %period, "income already credited this period");
            return Ok((balance.clone(), false));
        }

        let Some(income) = self.income_for(&period).await? else {
            info!(identity, period = %period, "income not yet published for period, deferring");
            return Ok((current.unwrap_or_else(|| UserBalance::new(identity)), false));
        };

        let mut applied = false;
        let balance = self
            .client
            .update_versioned::<UserBalance, LedgerError, _, _>(
                Collection::UserBalance,
                identity,
                || UserBalance::new(identity),
                |balance| {
                    applied = !balance.is_business() && !balance.received_in(&period);
                    if applied {
                        balance.apply_income(income.amount, &period);
                    }
                    Ok(applied)
                },
            )
            .await?;

        if applied {
            info!(identity, period = %period, amount = income.amount, balance = balance.balance, "income credited");
        }
        Ok((balance, applied))
    }

    /// Businesses never receive basic income but still need a balance with `income = 0`,
    /// marked as a business so later credit requests skip it.
    pub async fn ensure_business_balance(&self, identity: &str) -> Result<UserBalance, LedgerError> {
        let _guard = self.locks.acquire(&[identity]).await;

        let current: Option<UserBalance> = self
            .client
            .find_by_id(Collection::UserBalance, identity)
            .await?;
        if let Some(balance) = current.filter(|b| b.is_business() && b.income == 0) {
            return Ok(balance);
        }

        let balance = self
            .client
            .update_versioned::<UserBalance, LedgerError, _, _>(
                Collection::UserBalance,
                identity,
                || UserBalance::business(identity),
                |balance| {
                    balance.kind = AccountKind::Business;
                    balance.income = 0;
                    Ok(true)
                },
            )
            .await?;
        info!(identity, "business balance initialized");
        Ok(balance)
    }

    pub async fn open_account(
        &self,
        identity: &str,
        kind: AccountKind,
        now: DateTime<Utc>,
    ) -> Result<(UserBalance, bool), LedgerError> {
        match kind {
            AccountKind::Business => Ok((self.ensure_business_balance(identity).await?, false)),
            AccountKind::Individual => self.credit_income_if_due(identity, now).await,
        }
    }

    pub async fn income_for(&self, period: &PeriodToken) -> Result<Option<Income>, StoreError> {
        let mut records: Vec<Income> = self
            .client
            .query(Collection::Income, &Filter::field("period", period.to_string()))
            .await?;
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records.into_iter().next())
    }

    /// Upsert the shared record for a period, keeping its id when it already exists.
    pub async fn publish_income(&self, amount: i64, period: PeriodToken) -> Result<Income, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut income = self
            .income_for(&period)
            .await?
            .unwrap_or_else(|| Income::new(amount, period));
        income.amount = amount;
        self.client.put(Collection::Income, &income).await?;
        info!(period = %period, amount, "income published");
        Ok(income)
    }

    /// True when the next period has no income record yet and the indexer should run.
    pub async fn indexer_due(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let next = PeriodToken::from_datetime(now).next();
        Ok(self.income_for(&next).await?.is_none())
    }
}
