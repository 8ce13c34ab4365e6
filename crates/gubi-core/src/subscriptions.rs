use crate::client::LedgerStoreClient;
use crate::compensation::{CompensationRequest, CompensationStep, Compensator, FailedStep, OperationKind};
use crate::error::{LedgerError, StoreError};
use crate::locks::IdentityLocks;
use crate::plans::PlanRegistry;
use crate::store::{Collection, Filter};
use crate::transfer::TransferEngine;
use crate::types::{Plan, Subscription, Transaction};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

#[derive(Clone)]
pub struct SubscriptionManager {
    client: LedgerStoreClient,
    plans: PlanRegistry,
    transfers: TransferEngine,
    compensator: Compensator,
    locks: IdentityLocks,
}

impl SubscriptionManager {
    pub fn new(
        client: LedgerStoreClient,
        plans: PlanRegistry,
        transfers: TransferEngine,
        compensator: Compensator,
        locks: IdentityLocks,
    ) -> Self {
        Self {
            client,
            plans,
            transfers,
            compensator,
            locks,
        }
    }

    /// Charge one month of the plan and persist the subscription.
    ///
    /// An active subscription to the same plan is returned unchanged without charging.
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        plan_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Subscription, LedgerError> {
        let plan = self
            .plans
            .plan(plan_id)
            .await?
            .ok_or_else(|| LedgerError::PlanNotFound(plan_id.to_string()))?;
        if plan.created_by == subscriber_id {
            return Err(LedgerError::SelfSubscription {
                identity: subscriber_id.to_string(),
                plan_id: plan.id,
            });
        }
        let tx = Transaction::new(subscriber_id, &plan.created_by, vec![plan.as_line_item()], now)?;

        let guard = self
            .locks
            .acquire(&[subscriber_id, plan.created_by.as_str()])
            .await;
        if let Some(existing) = self.active_subscription(subscriber_id, &plan.id, now).await? {
            info!(subscription_id = %existing.id, subscriber = subscriber_id, plan_id = %plan.id, "already subscribed");
            return Ok(existing);
        }

        let (tx, guard) = self.transfers.execute(tx, guard).await?;

        let subscription = Subscription::start(&plan, subscriber_id, now);
        if let Err(err) = self.client.put(Collection::Subscription, &subscription).await {
            let mut steps = vec![CompensationStep::DeleteSubscription {
                subscription_id: subscription.id.clone(),
            }];
            steps.extend(TransferEngine::reversal(&tx, "subscription could not be persisted"));
            let request = CompensationRequest {
                operation: OperationKind::Subscribe,
                operation_id: subscription.id.clone(),
                step: FailedStep::PersistSubscription,
                failure: err,
                steps,
            };
            return Err(self.compensator.run_detached(request, guard).await);
        }
        drop(guard);

        info!(
            subscription_id = %subscription.id,
            subscriber = subscriber_id,
            plan_id = %plan.id,
            transfer_id = %tx.id,
            end_date = %subscription.end_date,
            "subscription started"
        );
        Ok(subscription)
    }

    async fn active_subscription(
        &self,
        subscriber_id: &str,
        plan_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .subscriptions_of(subscriber_id)
            .await?
            .into_iter()
            .filter(|subscription| subscription.plan_id == plan_id && subscription.is_active(now))
            .min_by(|a, b| a.start_date.cmp(&b.start_date).then_with(|| a.id.cmp(&b.id))))
    }

    /// Delete every subscription whose end date has passed. Safe to run repeatedly.
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let subscriptions: Vec<Subscription> = self
            .client
            .query(Collection::Subscription, &Filter::all())
            .await?;

        let mut removed = 0;
        for subscription in subscriptions.iter().filter(|s| !s.is_active(now)) {
            self.client
                .delete(Collection::Subscription, &subscription.id)
                .await?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "expired subscriptions swept");
        }
        Ok(removed)
    }

    /// Plans the viewer may subscribe to. Sweeps expired subscriptions first.
    pub async fn available_plans(
        &self,
        viewer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Plan>, StoreError> {
        if let Err(err) = self.expire_sweep(now).await {
            warn!(error = %err, "expire sweep failed during plan listing");
        }
        let mut plans = self.plans.list_plans().await?;
        plans.retain(|plan| plan.created_by != viewer_id);
        Ok(plans)
    }

    pub async fn subscriptions_of(&self, user_id: &str) -> Result<Vec<Subscription>, StoreError> {
        let mut subscriptions: Vec<Subscription> = self
            .client
            .query(Collection::Subscription, &Filter::field("user_id", user_id))
            .await?;
        subscriptions.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        Ok(subscriptions)
    }

    /// Subscriptions to any plan owned by `owner_id`.
    pub async fn subscribers(&self, owner_id: &str) -> Result<Vec<Subscription>, StoreError> {
        let owned: Vec<Plan> = self
            .client
            .query(Collection::Plan, &Filter::field("created_by", owner_id))
            .await?;

        let mut subscriptions = Vec::new();
        for plan in owned {
            let mut for_plan: Vec<Subscription> = self
                .client
                .query(Collection::Subscription, &Filter::field("plan_id", plan.id))
                .await?;
            subscriptions.append(&mut for_plan);
        }
        subscriptions.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        Ok(subscriptions)
    }

    pub async fn recurring_revenue(&self, owner_id: &str) -> Result<i64, StoreError> {
        Ok(self
            .subscribers(owner_id)
            .await?
            .iter()
            .map(|subscription| subscription.price)
            .sum())
    }
}
