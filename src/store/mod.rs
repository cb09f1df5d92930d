mod executions;
mod quota;
mod schedules;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::connections::{ConnectionResolver, NetworkConnection};
use crate::plans::{
    limit_from_sentinel, AllowedWindow, PlanDirectory, RateLimit, RateLimitUnit, SyncPlan,
};

/// key: pg-store -> Postgres-backed repositories
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_plan(row: &PgRow) -> SyncPlan {
    let code: String = row.get("plan_code");
    let timezone: String = row.get("timezone");
    let timezone = timezone.parse::<Tz>().unwrap_or_else(|_| {
        tracing::warn!(plan = %code, %timezone, "unknown plan timezone; using UTC");
        Tz::UTC
    });

    let rate_limit = match (
        row.try_get::<Option<String>, _>("rate_limit_unit").ok().flatten(),
        row.try_get::<Option<i32>, _>("rate_limit_size").ok().flatten(),
        row.try_get::<Option<i64>, _>("rate_limit_max_syncs").ok().flatten(),
    ) {
        (Some(unit), Some(size), Some(max_syncs)) => {
            RateLimitUnit::parse(&unit).map(|unit| RateLimit {
                unit,
                size: u32::try_from(size.max(1)).unwrap_or(1),
                max_syncs: max_syncs.max(0),
            })
        }
        _ => None,
    };

    let allowed_window = match (
        row.try_get::<Option<NaiveTime>, _>("allowed_from").ok().flatten(),
        row.try_get::<Option<NaiveTime>, _>("allowed_to").ok().flatten(),
    ) {
        (Some(from), Some(to)) => Some(AllowedWindow::new(from, to)),
        _ => None,
    };

    SyncPlan {
        code,
        daily_sync_limit: limit_from_sentinel(row.get("daily_sync_limit")),
        monthly_sync_limit: limit_from_sentinel(row.get("monthly_sync_limit")),
        revenue_cap: limit_from_sentinel(row.get("revenue_cap")),
        orders_cap: limit_from_sentinel(row.get("orders_cap")),
        rate_limit,
        allowed_window,
        timezone,
    }
}

#[async_trait]
impl PlanDirectory for PgStore {
    async fn plan_for_owner(&self, owner_id: i64, now: DateTime<Utc>) -> Result<Option<SyncPlan>> {
        let row = sqlx::query(
            r#"
            SELECT *
            FROM subscriber_plans
            WHERE owner_id = $1
              AND subscription_status IN ('active', 'trialing')
              AND (current_period_end IS NULL OR current_period_end >= $2)
            "#,
        )
        .bind(owner_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| map_plan(&row)))
    }

    async fn active_owners(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let owners = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT owner_id
            FROM subscriber_plans
            WHERE subscription_status IN ('active', 'trialing')
              AND (current_period_end IS NULL OR current_period_end >= $1)
            ORDER BY owner_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(owners)
    }
}

#[async_trait]
impl ConnectionResolver for PgStore {
    async fn active_connection(
        &self,
        owner_id: i64,
        network_id: i64,
    ) -> Result<Option<NetworkConnection>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, network_id, status, credentials
            FROM network_connections
            WHERE owner_id = $1
              AND network_id = $2
              AND status = 'active'
            "#,
        )
        .bind(owner_id)
        .bind(network_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| NetworkConnection {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            network_id: row.get("network_id"),
            status: row.get("status"),
            credentials: row.get("credentials"),
        }))
    }
}
