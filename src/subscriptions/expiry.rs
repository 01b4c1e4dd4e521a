use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::QuotaResult;

use super::models::{InstanceStatus, SubscriptionInstance};
use super::store::LedgerStore;

/// Active may move to Expired or Canceled; both are terminal.
pub fn transition_allowed(from: InstanceStatus, to: InstanceStatus) -> bool {
    matches!(
        (from, to),
        (InstanceStatus::Active, InstanceStatus::Expired)
            | (InstanceStatus::Active, InstanceStatus::Canceled)
    )
}

/// key: expiry-reconciler -> lazy transition on read
///
/// Flips a stored-active instance whose window has elapsed to expired and
/// updates the in-memory copy. When another writer settled the row first the
/// copy is refreshed from the store instead. Re-applying it is a no-op.
pub async fn reconcile_instance(
    store: &dyn LedgerStore,
    instance: &mut SubscriptionInstance,
    now: DateTime<Utc>,
) -> QuotaResult<bool> {
    if instance.status != InstanceStatus::Active || !instance.is_expired(now) {
        return Ok(false);
    }

    let changed = store
        .transition_status(instance.id, InstanceStatus::Active, InstanceStatus::Expired, now)
        .await?;
    if !changed {
        if let Some(current) = store.instance(instance.id).await? {
            *instance = current;
        }
        return Ok(false);
    }

    instance.status = InstanceStatus::Expired;
    info!(
        instance = instance.id,
        user_id = instance.user_id,
        end_at = %instance.end_at,
        "subscription instance expired on read"
    );
    Ok(true)
}

/// key: expiry-reconciler -> periodic bulk sweep
pub async fn expire_sweep(store: &dyn LedgerStore, now: DateTime<Utc>) -> QuotaResult<u64> {
    let flipped = store.bulk_expire(now).await?;
    info!(flipped, "subscription expiry sweep completed");
    Ok(flipped)
}

/// Moves an active instance to canceled. Terminal instances stay as they are.
pub async fn cancel_instance(
    store: &dyn LedgerStore,
    instance_id: i64,
    now: DateTime<Utc>,
) -> QuotaResult<bool> {
    let changed = store
        .transition_status(instance_id, InstanceStatus::Active, InstanceStatus::Canceled, now)
        .await?;
    if changed {
        info!(instance = instance_id, "subscription instance canceled");
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::subscriptions::memory::MemoryLedgerStore;
    use crate::subscriptions::models::{
        NewSubscriptionInstance, NewSubscriptionPlan, PlanStatus, QuotaMap,
    };

    async fn lapsed_instance(store: &MemoryLedgerStore, now: DateTime<Utc>) -> SubscriptionInstance {
        let plan = store
            .insert_plan(
                &NewSubscriptionPlan {
                    name: "Starter".to_string(),
                    description: None,
                    price_cents: 990,
                    duration_days: 30,
                    status: PlanStatus::Enabled,
                    resource_quotas: QuotaMap::from([("gpt-4".to_string(), 10)]),
                },
                now,
            )
            .await
            .unwrap();
        store
            .insert_instance(
                &NewSubscriptionInstance {
                    user_id: 1,
                    plan_id: plan.id,
                    start_at: now - Duration::days(31),
                    end_at: now - Duration::days(1),
                    quotas: plan.resource_quotas.clone(),
                    purchase_price_cents: plan.price_cents,
                    payment_method: None,
                    payment_ref: None,
                },
                now,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reconcile_expires_a_lapsed_copy() {
        let store = MemoryLedgerStore::new();
        let now = Utc::now();
        let mut instance = lapsed_instance(&store, now).await;

        assert!(reconcile_instance(&store, &mut instance, now).await.unwrap());
        assert_eq!(instance.status, InstanceStatus::Expired);
        assert!(!reconcile_instance(&store, &mut instance, now).await.unwrap());
    }

    #[tokio::test]
    async fn reconcile_adopts_status_settled_by_another_writer() {
        let store = MemoryLedgerStore::new();
        let now = Utc::now();
        let mut stale = lapsed_instance(&store, now).await;

        assert!(cancel_instance(&store, stale.id, now).await.unwrap());
        assert!(!reconcile_instance(&store, &mut stale, now).await.unwrap());
        assert_eq!(stale.status, InstanceStatus::Canceled);

        let stored = store.instance(stale.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InstanceStatus::Canceled);
    }

    #[test]
    fn terminal_states_never_resurrect() {
        assert!(transition_allowed(InstanceStatus::Active, InstanceStatus::Expired));
        assert!(transition_allowed(InstanceStatus::Active, InstanceStatus::Canceled));
        assert!(!transition_allowed(InstanceStatus::Expired, InstanceStatus::Active));
        assert!(!transition_allowed(InstanceStatus::Canceled, InstanceStatus::Active));
        assert!(!transition_allowed(InstanceStatus::Canceled, InstanceStatus::Expired));
        assert!(!transition_allowed(InstanceStatus::Expired, InstanceStatus::Expired));
    }
}
