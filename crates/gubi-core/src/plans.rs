use crate::client::LedgerStoreClient;
use crate::error::{LedgerError, StoreError};
use crate::locks::IdentityLocks;
use crate::store::{Collection, Filter};
use crate::types::Plan;
use tracing::{info, warn};

/// Recurring-charge plans, one per business identity by convention.
#[derive(Clone)]
pub struct PlanRegistry {
    client: LedgerStoreClient,
    locks: IdentityLocks,
}

impl PlanRegistry {
    pub fn new(client: LedgerStoreClient, locks: IdentityLocks) -> Self {
        Self { client, locks }
    }

    /// Reuses the owner's existing plan id when there is one. Two peers creating at the same
    /// time can still end up with duplicates; reads pick the lowest id.
    pub async fn create_or_update(&self, owner_id: &str, price: i64) -> Result<Plan, LedgerError> {
        if price <= 0 {
            return Err(LedgerError::InvalidAmount(price));
        }
        let _guard = self.locks.acquire(&[owner_id]).await;

        let plan_id = match self.plan_for_owner(owner_id).await? {
            Some(existing) => existing.id,
            None => Plan::new(owner_id, price).id,
        };
        let plan: Plan = self
            .client
            .update_versioned::<Plan, LedgerError, _, _>(
                Collection::Plan,
                &plan_id,
                || {
                    let mut plan = Plan::new(owner_id, price);
                    plan.id = plan_id.clone();
                    plan
                },
                |plan| {
                    plan.price = price;
                    plan.created_by = owner_id.to_string();
                    Ok(true)
                },
            )
            .await?;

        info!(plan_id = %plan.id, owner = owner_id, price, "plan saved");
        Ok(plan)
    }

    pub async fn delete_plan(&self, plan_id: &str) -> Result<(), StoreError> {
        self.client.delete(Collection::Plan, plan_id).await?;
        info!(plan_id, "plan deleted");
        Ok(())
    }

    pub async fn plan(&self, plan_id: &str) -> Result<Option<Plan>, StoreError> {
        self.client.find_by_id(Collection::Plan, plan_id).await
    }

    pub async fn plan_for_owner(&self, owner_id: &str) -> Result<Option<Plan>, StoreError> {
        let mut plans: Vec<Plan> = self
            .client
            .query(Collection::Plan, &Filter::field("created_by", owner_id))
            .await?;
        if plans.len() > 1 {
            warn!(owner = owner_id, count = plans.len(), "duplicate plans for owner");
        }
        plans.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(plans.into_iter().next())
    }

    pub async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        let mut plans: Vec<Plan> = self.client.query(Collection::Plan, &Filter::all()).await?;
        plans.sort_by(|a, b| a.created_by.cmp(&b.created_by).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }
}
