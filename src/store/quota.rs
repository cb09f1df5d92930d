use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Executor, Postgres, Row};
use uuid::Uuid;

use crate::quota::{Period, QuotaBucket, QuotaLedger, UsageDelta, Window};

use super::PgStore;

pub(super) fn map_bucket(row: &PgRow) -> Result<QuotaBucket> {
    let period: String = row.get("period");
    Ok(QuotaBucket {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        period: Period::parse(&period).ok_or_else(|| anyhow!("unknown bucket period `{period}`"))?,
        window_start: row.get("window_start"),
        window_end: row.get("window_end"),
        sync_count: row.get("sync_count"),
        revenue_count: row.get("revenue_count"),
        orders_count: row.get("orders_count"),
        folded_sync_count: row.get("folded_sync_count"),
        folded_revenue_count: row.get("folded_revenue_count"),
        folded_orders_count: row.get("folded_orders_count"),
        rotated_at: row.try_get("rotated_at").ok().flatten(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Atomic add into a bucket, creating it on first use. `folded` is added to the
/// folded counters in the same statement.
pub(super) async fn add_to_bucket<'c, E>(
    executor: E,
    owner_id: i64,
    period: Period,
    window: Window,
    delta: UsageDelta,
    folded: UsageDelta,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO quota_buckets (
            id, owner_id, period, window_start, window_end,
            sync_count, revenue_count, orders_count,
            folded_sync_count, folded_revenue_count, folded_orders_count,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
        ON CONFLICT (owner_id, period, window_start) DO UPDATE
        SET
            sync_count = quota_buckets.sync_count + EXCLUDED.sync_count,
            revenue_count = quota_buckets.revenue_count + EXCLUDED.revenue_count,
            orders_count = quota_buckets.orders_count + EXCLUDED.orders_count,
            folded_sync_count = quota_buckets.folded_sync_count + EXCLUDED.folded_sync_count,
            folded_revenue_count = quota_buckets.folded_revenue_count + EXCLUDED.folded_revenue_count,
            folded_orders_count = quota_buckets.folded_orders_count + EXCLUDED.folded_orders_count,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(owner_id)
    .bind(period.as_str())
    .bind(window.start)
    .bind(window.end)
    .bind(delta.sync)
    .bind(delta.revenue)
    .bind(delta.orders)
    .bind(folded.sync)
    .bind(folded.revenue)
    .bind(folded.orders)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

/// Live completion: the day and its month grow together, and the day records the
/// amount as already folded.
pub(super) async fn apply_increment(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    owner_id: i64,
    daily: Window,
    monthly: Window,
    delta: UsageDelta,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    add_to_bucket(&mut *tx, owner_id, Period::Daily, daily, delta, delta, now).await?;
    add_to_bucket(
        &mut *tx,
        owner_id,
        Period::Monthly,
        monthly,
        delta,
        UsageDelta::default(),
        now,
    )
    .await?;
    Ok(())
}

#[async_trait]
impl QuotaLedger for PgStore {
    async fn get_or_create(
        &self,
        owner_id: i64,
        period: Period,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<QuotaBucket> {
        let row = sqlx::query(
            r#"
            INSERT INTO quota_buckets (id, owner_id, period, window_start, window_end, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (owner_id, period, window_start) DO UPDATE
            SET window_end = quota_buckets.window_end
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(period.as_str())
        .bind(window.start)
        .bind(window.end)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        map_bucket(&row)
    }

    async fn find(
        &self,
        owner_id: i64,
        period: Period,
        window_start: DateTime<Utc>,
    ) -> Result<Option<QuotaBucket>> {
        let row = sqlx::query(
            r#"
            SELECT *
            FROM quota_buckets
            WHERE owner_id = $1 AND period = $2 AND window_start = $3
            "#,
        )
        .bind(owner_id)
        .bind(period.as_str())
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| map_bucket(&row)).transpose()
    }

    async fn list(&self, owner_id: i64, period: Period, limit: i64) -> Result<Vec<QuotaBucket>> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM quota_buckets
            WHERE owner_id = $1 AND period = $2
            ORDER BY window_start DESC
            LIMIT $3
            "#,
        )
        .bind(owner_id)
        .bind(period.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_bucket).collect()
    }

    async fn increment_usage(
        &self,
        owner_id: i64,
        daily: Window,
        monthly: Window,
        delta: UsageDelta,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        apply_increment(&mut tx, owner_id, daily, monthly, delta, now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn unrotated_daily(
        &self,
        owner_id: i64,
        before: DateTime<Utc>,
    ) -> Result<Vec<QuotaBucket>> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM quota_buckets
            WHERE owner_id = $1
              AND period = 'daily'
              AND rotated_at IS NULL
              AND window_end <= $2
            ORDER BY window_start
            "#,
        )
        .bind(owner_id)
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_bucket).collect()
    }

    async fn fold_into_month(
        &self,
        owner_id: i64,
        daily: Window,
        monthly: Window,
        now: DateTime<Utc>,
    ) -> Result<UsageDelta> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT *
            FROM quota_buckets
            WHERE owner_id = $1 AND period = 'daily' AND window_start = $2
            FOR UPDATE
            "#,
        )
        .bind(owner_id)
        .bind(daily.start)
        .fetch_optional(&mut tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(UsageDelta::default());
        };
        let unfolded = map_bucket(&row)?.unfolded();

        sqlx::query(
            r#"
            UPDATE quota_buckets
            SET
                folded_sync_count = sync_count,
                folded_revenue_count = revenue_count,
                folded_orders_count = orders_count,
                rotated_at = COALESCE(rotated_at, $3),
                updated_at = $3
            WHERE owner_id = $1 AND period = 'daily' AND window_start = $2
            "#,
        )
        .bind(owner_id)
        .bind(daily.start)
        .bind(now)
        .execute(&mut tx)
        .await?;

        add_to_bucket(
            &mut tx,
            owner_id,
            Period::Monthly,
            monthly,
            unfolded,
            UsageDelta::default(),
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(unfolded)
    }

    async fn reset_stale(
        &self,
        owner_id: i64,
        period: Period,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaBucket>> {
        let row = sqlx::query(
            r#"
            INSERT INTO quota_buckets (id, owner_id, period, window_start, window_end, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (owner_id, period, window_start) DO UPDATE
            SET
                sync_count = 0,
                revenue_count = 0,
                orders_count = 0,
                folded_sync_count = 0,
                folded_revenue_count = 0,
                folded_orders_count = 0,
                updated_at = EXCLUDED.updated_at
            WHERE quota_buckets.updated_at < quota_buckets.window_start
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(period.as_str())
        .bind(window.start)
        .bind(window.end)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_bucket).transpose()
    }

    async fn prune_daily(
        &self,
        unrotated_before: DateTime<Utc>,
        rotated_before: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM quota_buckets
            WHERE period = 'daily'
              AND (
                window_end <= $1
                OR (rotated_at IS NOT NULL AND window_end <= $2)
              )
            "#,
        )
        .bind(unrotated_before)
        .bind(rotated_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn prune_monthly(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM quota_buckets WHERE period = 'monthly' AND window_end <= $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
