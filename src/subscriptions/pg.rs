use std::collections::HashMap;
use std::time::Duration as StdDuration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::warn;

use crate::config;
use crate::error::{QuotaError, QuotaResult};
use crate::telemetry::{notification_payload, validate_notification_payload};

use super::expiry::transition_allowed;
use super::models::{
    InstanceStatus, NewSubscriptionInstance, NewSubscriptionPlan, NewUsageEntry, PlanStatus,
    QuotaMap, QuotaNotification, SubscriptionInstance, SubscriptionPlan, UsageEntry, UsageFilter,
};
use super::store::LedgerStore;

/// SQLSTATE raised when `lock_timeout` elapses.
const LOCK_NOT_AVAILABLE: &str = "55P03";

#[derive(Clone, Debug)]
pub struct PgLedgerStoreConfig {
    pub lock_timeout: StdDuration,
    pub notify_channel: Option<String>,
}

impl Default for PgLedgerStoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: StdDuration::from_secs(2),
            notify_channel: None,
        }
    }
}

impl PgLedgerStoreConfig {
    pub fn from_env() -> Self {
        Self {
            lock_timeout: StdDuration::from_millis(*config::CONSUME_LOCK_TIMEOUT_MS),
            notify_channel: config::QUOTA_NOTIFY_CHANNEL.clone(),
        }
    }
}

/// key: ledger-store-postgres -> sqlx backed store
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    config: PgLedgerStoreConfig,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool, config: PgLedgerStoreConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn hydrate(&self, rows: Vec<InstanceRow>) -> QuotaResult<Vec<SubscriptionInstance>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let quota_rows = sqlx::query_as::<_, QuotaRow>(
            r#"
            SELECT instance_id, resource, granted, remaining, consumed
            FROM subscription_instance_quotas
            WHERE instance_id = ANY($1)
            "#,
        )
        .bind(&ids[..])
        .fetch_all(&self.pool)
        .await?;

        let mut by_instance: HashMap<i64, Vec<QuotaRow>> = HashMap::new();
        for row in quota_rows {
            by_instance.entry(row.instance_id).or_default().push(row);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let quotas = by_instance.remove(&row.id).unwrap_or_default();
                row.into_instance(quotas)
            })
            .collect())
    }

    async fn dispatch_notification(&self, payload: &serde_json::Value) -> anyhow::Result<()> {
        let Some(channel) = self.config.notify_channel.as_deref() else {
            return Ok(());
        };
        let payload =
            serde_json::to_string(payload).context("serialize quota notification payload")?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn lock_error(err: sqlx::Error, instance_id: i64) -> QuotaError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
            return QuotaError::LockTimeout(instance_id);
        }
    }
    QuotaError::Db(err)
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert_plan(
        &self,
        plan: &NewSubscriptionPlan,
        now: DateTime<Utc>,
    ) -> QuotaResult<SubscriptionPlan> {
        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            INSERT INTO subscription_plans (
                name,
                description,
                price_cents,
                duration_days,
                status,
                resource_quotas,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING id, name, description, price_cents, duration_days, status,
                      resource_quotas, created_at, updated_at
            "#,
        )
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price_cents)
        .bind(plan.duration_days)
        .bind(plan.status.as_str())
        .bind(Json(&plan.resource_quotas))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn plan(&self, plan_id: i64) -> QuotaResult<Option<SubscriptionPlan>> {
        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT id, name, description, price_cents, duration_days, status,
                   resource_quotas, created_at, updated_at
            FROM subscription_plans
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionPlan::from))
    }

    async fn list_plans(&self, status: Option<PlanStatus>) -> QuotaResult<Vec<SubscriptionPlan>> {
        let rows = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT id, name, description, price_cents, duration_days, status,
                   resource_quotas, created_at, updated_at
            FROM subscription_plans
            WHERE deleted_at IS NULL
              AND ($1::text IS NULL OR status = $1)
            ORDER BY price_cents ASC, id ASC
            "#,
        )
        .bind(status.map(|status| status.as_str()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SubscriptionPlan::from).collect())
    }

    async fn update_plan(
        &self,
        plan_id: i64,
        plan: &NewSubscriptionPlan,
        now: DateTime<Utc>,
    ) -> QuotaResult<Option<SubscriptionPlan>> {
        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            UPDATE subscription_plans
            SET name = $2,
                description = $3,
                price_cents = $4,
                duration_days = $5,
                status = $6,
                resource_quotas = $7,
                updated_at = $8
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING id, name, description, price_cents, duration_days, status,
                      resource_quotas, created_at, updated_at
            "#,
        )
        .bind(plan_id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price_cents)
        .bind(plan.duration_days)
        .bind(plan.status.as_str())
        .bind(Json(&plan.resource_quotas))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionPlan::from))
    }

    async fn delete_plan(&self, plan_id: i64, now: DateTime<Utc>) -> QuotaResult<bool> {
        let result = sqlx::query(
            "UPDATE subscription_plans SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(plan_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_plan_status(
        &self,
        plan_id: i64,
        status: PlanStatus,
        now: DateTime<Utc>,
    ) -> QuotaResult<bool> {
        let result = sqlx::query(
            "UPDATE subscription_plans SET status = $2, updated_at = $3 WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(plan_id)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_instance(
        &self,
        instance: &NewSubscriptionInstance,
        now: DateTime<Utc>,
    ) -> QuotaResult<SubscriptionInstance> {
        let mut tx = self.pool.begin().await?;
        let plan_name: Option<String> = sqlx::query_scalar(
            "SELECT name FROM subscription_plans WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(instance.plan_id)
        .fetch_optional(&mut *tx)
        .await?;
        let plan_name = plan_name.ok_or(QuotaError::NotFound("plan", instance.plan_id))?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO subscription_instances (
                user_id,
                plan_id,
                status,
                start_at,
                end_at,
                purchase_price_cents,
                payment_method,
                payment_ref,
                created_at,
                updated_at
            ) VALUES ($1, $2, 'active', $3, $4, $5, $6, $7, $8, $8)
            RETURNING id
            "#,
        )
        .bind(instance.user_id)
        .bind(instance.plan_id)
        .bind(instance.start_at)
        .bind(instance.end_at)
        .bind(instance.purchase_price_cents)
        .bind(&instance.payment_method)
        .bind(&instance.payment_ref)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for (resource, granted) in &instance.quotas {
            sqlx::query(
                "INSERT INTO subscription_instance_quotas (instance_id, resource, granted, remaining, consumed) VALUES ($1, $2, $3, $3, 0)",
            )
            .bind(id)
            .bind(resource)
            .bind(*granted)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(SubscriptionInstance {
            id,
            user_id: instance.user_id,
            plan_id: instance.plan_id,
            plan_name,
            status: InstanceStatus::Active,
            start_at: instance.start_at,
            end_at: instance.end_at,
            granted: instance.quotas.clone(),
            remaining: instance.quotas.clone(),
            consumed: QuotaMap::new(),
            purchase_price_cents: instance.purchase_price_cents,
            payment_method: instance.payment_method.clone(),
            payment_ref: instance.payment_ref.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn instance(&self, instance_id: i64) -> QuotaResult<Option<SubscriptionInstance>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT i.id, i.user_id, i.plan_id, p.name AS plan_name, i.status, i.start_at,
                   i.end_at, i.purchase_price_cents, i.payment_method, i.payment_ref,
                   i.created_at, i.updated_at
            FROM subscription_instances i
            JOIN subscription_plans p ON p.id = i.plan_id
            WHERE i.id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(self.hydrate(vec![row]).await?.pop())
    }

    async fn find_active_instances(&self, user_id: i64) -> QuotaResult<Vec<SubscriptionInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT i.id, i.user_id, i.plan_id, p.name AS plan_name, i.status, i.start_at,
                   i.end_at, i.purchase_price_cents, i.payment_method, i.payment_ref,
                   i.created_at, i.updated_at
            FROM subscription_instances i
            JOIN subscription_plans p ON p.id = i.plan_id
            WHERE i.user_id = $1 AND i.status = 'active'
            ORDER BY i.end_at ASC, i.id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn list_active_instances(&self) -> QuotaResult<Vec<SubscriptionInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT i.id, i.user_id, i.plan_id, p.name AS plan_name, i.status, i.start_at,
                   i.end_at, i.purchase_price_cents, i.payment_method, i.payment_ref,
                   i.created_at, i.updated_at
            FROM subscription_instances i
            JOIN subscription_plans p ON p.id = i.plan_id
            WHERE i.status = 'active'
            ORDER BY i.end_at ASC, i.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn list_instances_created_between(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> QuotaResult<Vec<SubscriptionInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT i.id, i.user_id, i.plan_id, p.name AS plan_name, i.status, i.start_at,
                   i.end_at, i.purchase_price_cents, i.payment_method, i.payment_ref,
                   i.created_at, i.updated_at
            FROM subscription_instances i
            JOIN subscription_plans p ON p.id = i.plan_id
            WHERE ($1::timestamptz IS NULL OR i.created_at >= $1)
              AND ($2::timestamptz IS NULL OR i.created_at <= $2)
            ORDER BY i.end_at ASC, i.id ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn conditional_decrement(
        &self,
        instance_id: i64,
        resource: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> QuotaResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.config.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;

        // The row lock taken by UPDATE re-evaluates `remaining >= amount`
        // against the committed value, so concurrent draws cannot oversell.
        let applied: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE subscription_instance_quotas q
            SET remaining = q.remaining - $3,
                consumed = q.consumed + $3
            FROM subscription_instances i
            WHERE q.instance_id = $1
              AND q.resource = $2
              AND q.remaining >= $3
              AND i.id = q.instance_id
              AND i.status = 'active'
              AND i.start_at <= $4
              AND i.end_at > $4
            RETURNING q.remaining
            "#,
        )
        .bind(instance_id)
        .bind(resource)
        .bind(amount)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| lock_error(err, instance_id))?;

        tx.commit().await?;
        Ok(applied.is_some())
    }

    async fn transition_status(
        &self,
        instance_id: i64,
        from: InstanceStatus,
        to: InstanceStatus,
        now: DateTime<Utc>,
    ) -> QuotaResult<bool> {
        if !transition_allowed(from, to) {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE subscription_instances SET status = $3, updated_at = $4 WHERE id = $1 AND status = $2",
        )
        .bind(instance_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bulk_expire(&self, now: DateTime<Utc>) -> QuotaResult<u64> {
        let result = sqlx::query(
            "UPDATE subscription_instances SET status = 'expired', updated_at = $1 WHERE status = 'active' AND end_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn append_usage(&self, entry: &NewUsageEntry) -> QuotaResult<UsageEntry> {
        let row = sqlx::query_as::<_, UsageRow>(
            r#"
            INSERT INTO subscription_usage_ledger (
                user_id,
                instance_id,
                resource,
                usage_count,
                tokens_used,
                request_id,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, user_id, instance_id, resource, usage_count, tokens_used,
                      request_id, created_at
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.instance_id)
        .bind(&entry.resource)
        .bind(entry.usage_count)
        .bind(entry.tokens_used)
        .bind(&entry.request_id)
        .bind(entry.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn usage_entries(&self, filter: &UsageFilter) -> QuotaResult<Vec<UsageEntry>> {
        let rows = sqlx::query_as::<_, UsageRow>(
            r#"
            SELECT id, user_id, instance_id, resource, usage_count, tokens_used,
                   request_id, created_at
            FROM subscription_usage_ledger
            WHERE ($1::bigint IS NULL OR user_id = $1)
              AND ($2::bigint IS NULL OR instance_id = $2)
              AND ($3::text IS NULL OR resource = $3)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at <= $5)
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.instance_id)
        .bind(filter.resource.as_deref())
        .bind(filter.start)
        .bind(filter.end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UsageEntry::from).collect())
    }

    async fn purge_usage_older_than(&self, cutoff: DateTime<Utc>) -> QuotaResult<u64> {
        let result = sqlx::query("DELETE FROM subscription_usage_ledger WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_notification_if_absent(
        &self,
        notification: &QuotaNotification,
        cooldown: Duration,
    ) -> QuotaResult<bool> {
        let payload = notification_payload(notification);
        validate_notification_payload(&payload)
            .map_err(|err| QuotaError::validation(err.to_string()))?;

        let threshold = notification.observed_at - cooldown;
        let dedupe_key = format!(
            "{}:{}:{}",
            notification.instance_id,
            notification.resource,
            notification.band.as_str()
        );

        // Serializes concurrent sweeps on the same key until commit.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(&dedupe_key)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO subscription_quota_notifications (
                user_id,
                instance_id,
                resource,
                band,
                usage_percentage,
                remaining,
                total,
                payload,
                created_at
            )
            SELECT $1::bigint, $2::bigint, $3::text, $4::text, $5::double precision,
                   $6::bigint, $7::bigint, $8::jsonb, $9::timestamptz
            WHERE NOT EXISTS (
                SELECT 1
                FROM subscription_quota_notifications
                WHERE instance_id = $2
                  AND resource = $3
                  AND band = $4
                  AND created_at >= $10
            )
            "#,
        )
        .bind(notification.user_id)
        .bind(notification.instance_id)
        .bind(&notification.resource)
        .bind(notification.band.as_str())
        .bind(notification.usage_percentage)
        .bind(notification.remaining)
        .bind(notification.total)
        .bind(&payload)
        .bind(notification.observed_at)
        .bind(threshold)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            if let Err(err) = self.dispatch_notification(&payload).await {
                warn!(
                    ?err,
                    instance = notification.instance_id,
                    "failed to publish quota notification"
                );
            }
        }
        Ok(inserted)
    }
}

#[derive(FromRow)]
struct PlanRow {
    id: i64,
    name: String,
    description: Option<String>,
    price_cents: i64,
    duration_days: i32,
    status: String,
    resource_quotas: Json<QuotaMap>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PlanRow> for SubscriptionPlan {
    fn from(row: PlanRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            price_cents: row.price_cents,
            duration_days: row.duration_days,
            status: PlanStatus::from_str(&row.status),
            resource_quotas: row.resource_quotas.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct InstanceRow {
    id: i64,
    user_id: i64,
    plan_id: i64,
    plan_name: String,
    status: String,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    purchase_price_cents: i64,
    payment_method: Option<String>,
    payment_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl InstanceRow {
    fn into_instance(self, quotas: Vec<QuotaRow>) -> SubscriptionInstance {
        let mut granted = QuotaMap::new();
        let mut remaining = QuotaMap::new();
        let mut consumed = QuotaMap::new();
        for quota in quotas {
            granted.insert(quota.resource.clone(), quota.granted);
            remaining.insert(quota.resource.clone(), quota.remaining);
            if quota.consumed > 0 {
                consumed.insert(quota.resource, quota.consumed);
            }
        }

        SubscriptionInstance {
            id: self.id,
            user_id: self.user_id,
            plan_id: self.plan_id,
            plan_name: self.plan_name,
            status: InstanceStatus::from_str(&self.status),
            start_at: self.start_at,
            end_at: self.end_at,
            granted,
            remaining,
            consumed,
            purchase_price_cents: self.purchase_price_cents,
            payment_method: self.payment_method,
            payment_ref: self.payment_ref,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(FromRow)]
struct QuotaRow {
    instance_id: i64,
    resource: String,
    granted: i64,
    remaining: i64,
    consumed: i64,
}

#[derive(FromRow)]
struct UsageRow {
    id: i64,
    user_id: i64,
    instance_id: i64,
    resource: String,
    usage_count: i64,
    tokens_used: Option<i64>,
    request_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<UsageRow> for UsageEntry {
    fn from(row: UsageRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            instance_id: row.instance_id,
            resource: row.resource,
            usage_count: row.usage_count,
            tokens_used: row.tokens_used,
            request_id: row.request_id,
            created_at: row.created_at,
        }
    }
}
