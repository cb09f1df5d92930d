use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::executions::{
    merge_metadata, Completion, ExecutionFilter, ExecutionRecord, ExecutionStatus, ExecutionStore,
    Failure,
};
use crate::schedules::SyncType;

use super::quota::apply_increment;
use super::PgStore;

fn map_execution(row: &PgRow) -> Result<ExecutionRecord> {
    let sync_type: String = row.get("sync_type");
    let status: String = row.get("status");
    Ok(ExecutionRecord {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        network_id: row.get("network_id"),
        schedule_id: row.try_get("schedule_id").ok().flatten(),
        sync_type: SyncType::parse(&sync_type)
            .ok_or_else(|| anyhow!("unknown sync type `{sync_type}`"))?,
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown execution status `{status}`"))?,
        started_at: row.try_get("started_at").ok().flatten(),
        completed_at: row.try_get("completed_at").ok().flatten(),
        duration_seconds: row.try_get("duration_seconds").ok().flatten(),
        records_synced: row.get("records_synced"),
        campaigns_count: row.get("campaigns_count"),
        coupons_count: row.get("coupons_count"),
        purchases_count: row.get("purchases_count"),
        error_message: row.try_get("error_message").ok().flatten(),
        metadata: row.get("metadata"),
        attempts: row.get("attempts"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn create(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_executions (
                id, owner_id, network_id, schedule_id, sync_type, status,
                metadata, attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.owner_id)
        .bind(record.network_id)
        .bind(record.schedule_id)
        .bind(record.sync_type.as_str())
        .bind(record.status.as_str())
        .bind(&record.metadata)
        .bind(record.attempts)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query("SELECT * FROM sync_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| map_execution(&row)).transpose()
    }

    async fn mark_processing(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query(
            r#"
            UPDATE sync_executions
            SET status = 'processing', started_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| map_execution(&row)).transpose()
    }

    async fn complete(
        &self,
        id: Uuid,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>> {
        let stats = &completion.stats;
        let metadata = json!({
            "executor": stats.metadata,
            "attempts": completion.attempts,
        });

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE sync_executions
            SET
                status = 'completed',
                completed_at = $2,
                duration_seconds = GREATEST(
                    0,
                    FLOOR(EXTRACT(EPOCH FROM ($2 - COALESCE(started_at, $2))))
                )::BIGINT,
                records_synced = $3,
                campaigns_count = $4,
                coupons_count = $5,
                purchases_count = $6,
                attempts = $7,
                metadata = metadata || $8,
                updated_at = $2
            WHERE id = $1 AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(stats.total_records)
        .bind(stats.campaigns_count)
        .bind(stats.coupons_count)
        .bind(stats.purchases_count)
        .bind(completion.attempts)
        .bind(&metadata)
        .fetch_optional(&mut tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let usage = completion.usage;
        apply_increment(
            &mut tx,
            usage.owner_id,
            usage.daily,
            usage.monthly,
            usage.delta,
            now,
        )
        .await?;
        tx.commit().await?;
        map_execution(&row).map(Some)
    }

    async fn fail(
        &self,
        id: Uuid,
        failure: Failure,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>> {
        let mut metadata = json!({ "attempts": failure.attempts });
        if let Some(diagnostics) = failure.diagnostics {
            merge_metadata(&mut metadata, diagnostics);
        }

        let row = sqlx::query(
            r#"
            UPDATE sync_executions
            SET
                status = 'failed',
                completed_at = $2,
                duration_seconds = CASE
                    WHEN started_at IS NULL THEN NULL
                    ELSE GREATEST(0, FLOOR(EXTRACT(EPOCH FROM ($2 - started_at))))::BIGINT
                END,
                error_message = $3,
                attempts = $4,
                metadata = metadata || $5,
                updated_at = $2
            WHERE id = $1 AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(&failure.message)
        .bind(failure.attempts)
        .bind(&metadata)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| map_execution(&row)).transpose()
    }

    async fn query(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM sync_executions
            WHERE ($1::BIGINT IS NULL OR owner_id = $1)
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::UUID IS NULL OR schedule_id = $3)
              AND ($4::TIMESTAMPTZ IS NULL OR created_at >= $4)
              AND ($5::TIMESTAMPTZ IS NULL OR created_at < $5)
            ORDER BY created_at DESC
            LIMIT $6
            "#,
        )
        .bind(filter.owner_id)
        .bind(filter.status.map(|status| status.as_str()))
        .bind(filter.schedule_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.effective_limit())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_execution).collect()
    }

    async fn count_dispatched_since(&self, owner_id: i64, since: DateTime<Utc>) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM sync_executions
            WHERE owner_id = $1
              AND status <> 'failed'
              AND created_at >= $2
            "#,
        )
        .bind(owner_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_in_flight_since(&self, owner_id: i64, since: DateTime<Utc>) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM sync_executions
            WHERE owner_id = $1
              AND status IN ('pending', 'processing')
              AND created_at >= $2
            "#,
        )
        .bind(owner_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn find_stale(
        &self,
        status: ExecutionStatus,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM sync_executions
            WHERE status = $1 AND updated_at <= $2
            ORDER BY updated_at
            LIMIT $3
            "#,
        )
        .bind(status.as_str())
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_execution).collect()
    }
}
