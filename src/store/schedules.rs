use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::schedules::{DateRangeMode, RunUpdate, Schedule, ScheduleRegistry, SyncType};

use super::PgStore;

/// `runs_today` as of `now_param`; a passed reset marker means it no longer counts.
fn effective_runs(now_param: &str) -> String {
    format!(
        "CASE WHEN runs_reset_at IS NOT NULL AND runs_reset_at <= {now_param} THEN 0 ELSE runs_today END"
    )
}

fn map_schedule(row: &PgRow) -> Result<Schedule> {
    let sync_type: String = row.get("sync_type");
    let date_range_mode: Option<String> = row.try_get("date_range_mode").ok().flatten();
    Ok(Schedule {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        network_targets: row.get("network_targets"),
        sync_type: SyncType::parse(&sync_type)
            .ok_or_else(|| anyhow!("unknown sync type `{sync_type}`"))?,
        date_range_mode: date_range_mode.as_deref().and_then(DateRangeMode::parse),
        interval_minutes: row.get("interval_minutes"),
        max_runs_per_day: row.get("max_runs_per_day"),
        runs_today: row.get("runs_today"),
        runs_reset_at: row.try_get("runs_reset_at").ok().flatten(),
        last_run_at: row.try_get("last_run_at").ok().flatten(),
        next_run_at: row.get("next_run_at"),
        active: row.get("active"),
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

impl PgStore {
    /// Stores a schedule definition as created by the owner.
    pub async fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_schedules (
                id, owner_id, network_targets, sync_type, date_range_mode,
                interval_minutes, max_runs_per_day, runs_today, runs_reset_at,
                last_run_at, next_run_at, active, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(schedule.id)
        .bind(schedule.owner_id)
        .bind(&schedule.network_targets)
        .bind(schedule.sync_type.as_str())
        .bind(schedule.date_range_mode.map(|mode| mode.as_str()))
        .bind(schedule.interval_minutes)
        .bind(schedule.max_runs_per_day)
        .bind(schedule.runs_today)
        .bind(schedule.runs_reset_at)
        .bind(schedule.last_run_at)
        .bind(schedule.next_run_at)
        .bind(schedule.active)
        .bind(schedule.version)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ScheduleRegistry for PgStore {
    async fn get(&self, schedule_id: Uuid) -> Result<Option<Schedule>> {
        let row = sqlx::query("SELECT * FROM sync_schedules WHERE id = $1")
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| map_schedule(&row)).transpose()
    }

    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_schedules WHERE owner_id = $1 ORDER BY created_at",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_schedule).collect()
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Schedule>> {
        let sql = format!(
            r#"
            SELECT *
            FROM sync_schedules
            WHERE active
              AND next_run_at <= $1
              AND {} < max_runs_per_day
            ORDER BY next_run_at
            LIMIT $2
            "#,
            effective_runs("$1")
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_schedule).collect()
    }

    async fn claim(
        &self,
        schedule_id: Uuid,
        expected_version: i64,
        next: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Schedule>> {
        let sql = format!(
            r#"
            UPDATE sync_schedules
            SET
                runs_today = {effective},
                runs_reset_at = CASE
                    WHEN runs_reset_at IS NOT NULL AND runs_reset_at <= $4 THEN NULL
                    ELSE runs_reset_at
                END,
                next_run_at = $3,
                version = version + 1,
                updated_at = $4
            WHERE id = $1
              AND version = $2
              AND active
              AND next_run_at <= $4
              AND {effective} < max_runs_per_day
            RETURNING *
            "#,
            effective = effective_runs("$4")
        );
        let row = sqlx::query(&sql)
            .bind(schedule_id)
            .bind(expected_version)
            .bind(next)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| map_schedule(&row)).transpose()
    }

    async fn record_run(
        &self,
        schedule_id: Uuid,
        expected_version: i64,
        update: RunUpdate,
    ) -> Result<Option<Schedule>> {
        let row = sqlx::query(
            r#"
            UPDATE sync_schedules
            SET
                runs_today = LEAST(GREATEST($3, 0), max_runs_per_day),
                runs_reset_at = $4,
                last_run_at = $5,
                next_run_at = $6,
                version = version + 1,
                updated_at = $5
            WHERE id = $1
              AND version = $2
            RETURNING *
            "#,
        )
        .bind(schedule_id)
        .bind(expected_version)
        .bind(update.runs_today)
        .bind(update.runs_reset_at)
        .bind(update.last_run_at)
        .bind(update.next_run_at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| map_schedule(&row)).transpose()
    }

    async fn reset_daily_runs(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_schedules
            SET
                runs_today = 0,
                runs_reset_at = NULL,
                version = version + 1,
                updated_at = $1
            WHERE runs_reset_at IS NOT NULL
              AND runs_reset_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
