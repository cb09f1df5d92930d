use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::executions::ExecutionStore;
use crate::plans::SyncPlan;
use crate::windows::{daily_window, monthly_window};

use super::models::{Period, UsageDelta, Window};
use super::QuotaLedger;

/// Planning-time rejection. Never reaches the executor.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaExceeded {
    #[error("daily sync limit reached ({used}/{limit})")]
    DailySyncLimit { used: i64, limit: i64 },
    #[error("monthly sync limit reached ({used}/{limit})")]
    MonthlySyncLimit { used: i64, limit: i64 },
    #[error("rate limit reached ({used}/{limit} per {size} {unit})")]
    RateLimit {
        used: i64,
        limit: i64,
        size: u32,
        unit: &'static str,
    },
    #[error("revenue cap exhausted ({used}/{limit})")]
    RevenueCap { used: i64, limit: i64 },
    #[error("orders cap exhausted ({used}/{limit})")]
    OrdersCap { used: i64, limit: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: Option<QuotaExceeded>,
}

impl QuotaDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: QuotaExceeded) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Remaining data volume for the current month; `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DataBudget {
    pub revenue: Option<i64>,
    pub orders: Option<i64>,
}

/// Ledger state a decision is made on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub daily: UsageDelta,
    pub monthly: UsageDelta,
    /// Syncs dispatched inside the plan's rolling rate-limit window.
    pub rolling_syncs: i64,
    /// Pending or processing records created inside the current day and month.
    /// They count against the sync limits until they settle.
    pub daily_in_flight: i64,
    pub monthly_in_flight: i64,
}

impl QuotaUsage {
    pub fn daily_syncs(&self) -> i64 {
        self.daily.sync + self.daily_in_flight
    }

    pub fn monthly_syncs(&self) -> i64 {
        self.monthly.sync + self.monthly_in_flight
    }
}

/// `count >= limit` denies; `None` never does.
pub fn limit_reached(count: i64, limit: Option<i64>) -> bool {
    matches!(limit, Some(limit) if count >= limit)
}

/// key: quota-enforcer -> permit decision + data budget
#[derive(Clone)]
pub struct QuotaEnforcer {
    ledger: Arc<dyn QuotaLedger>,
    executions: Arc<dyn ExecutionStore>,
}

impl QuotaEnforcer {
    pub fn new(ledger: Arc<dyn QuotaLedger>, executions: Arc<dyn ExecutionStore>) -> Self {
        Self { ledger, executions }
    }

    /// Pure decision over a usage snapshot. Every configured gate must pass.
    pub fn evaluate(plan: &SyncPlan, usage: &QuotaUsage) -> QuotaDecision {
        if let Some(rate_limit) = plan.rate_limit {
            if limit_reached(usage.rolling_syncs, Some(rate_limit.max_syncs)) {
                return QuotaDecision::deny(QuotaExceeded::RateLimit {
                    used: usage.rolling_syncs,
                    limit: rate_limit.max_syncs,
                    size: rate_limit.size,
                    unit: rate_limit.unit.as_str(),
                });
            }
        }
        if limit_reached(usage.daily_syncs(), plan.daily_sync_limit) {
            return QuotaDecision::deny(QuotaExceeded::DailySyncLimit {
                used: usage.daily_syncs(),
                limit: plan.daily_sync_limit.unwrap_or_default(),
            });
        }
        if limit_reached(usage.monthly_syncs(), plan.monthly_sync_limit) {
            return QuotaDecision::deny(QuotaExceeded::MonthlySyncLimit {
                used: usage.monthly_syncs(),
                limit: plan.monthly_sync_limit.unwrap_or_default(),
            });
        }
        if limit_reached(usage.monthly.revenue, plan.revenue_cap) {
            return QuotaDecision::deny(QuotaExceeded::RevenueCap {
                used: usage.monthly.revenue,
                limit: plan.revenue_cap.unwrap_or_default(),
            });
        }
        if limit_reached(usage.monthly.orders, plan.orders_cap) {
            return QuotaDecision::deny(QuotaExceeded::OrdersCap {
                used: usage.monthly.orders,
                limit: plan.orders_cap.unwrap_or_default(),
            });
        }
        QuotaDecision::allow()
    }

    pub fn budget(plan: &SyncPlan, usage: &QuotaUsage) -> DataBudget {
        DataBudget {
            revenue: plan
                .revenue_cap
                .map(|cap| cap.saturating_sub(usage.monthly.revenue).max(0)),
            orders: plan
                .orders_cap
                .map(|cap| cap.saturating_sub(usage.monthly.orders).max(0)),
        }
    }

    /// Reads the owner's current buckets without creating them.
    pub async fn usage(
        &self,
        owner_id: i64,
        plan: &SyncPlan,
        now: DateTime<Utc>,
    ) -> Result<QuotaUsage> {
        let daily_window = Window::from(daily_window(now, plan.timezone));
        let monthly_window = Window::from(monthly_window(now, plan.timezone));
        let daily = self
            .ledger
            .find(owner_id, Period::Daily, daily_window.start)
            .await?
            .map(|bucket| bucket.usage())
            .unwrap_or_default();
        let monthly = self
            .ledger
            .find(owner_id, Period::Monthly, monthly_window.start)
            .await?
            .map(|bucket| bucket.usage())
            .unwrap_or_default();
        let daily_in_flight = self
            .executions
            .count_in_flight_since(owner_id, daily_window.start)
            .await?;
        let monthly_in_flight = self
            .executions
            .count_in_flight_since(owner_id, monthly_window.start)
            .await?;

        let rolling_syncs = match plan.rate_limit {
            Some(rate_limit) => {
                self.executions
                    .count_dispatched_since(owner_id, now - rate_limit.span())
                    .await?
            }
            None => 0,
        };

        Ok(QuotaUsage {
            daily,
            monthly,
            rolling_syncs,
            daily_in_flight,
            monthly_in_flight,
        })
    }

    pub async fn check(
        &self,
        owner_id: i64,
        plan: &SyncPlan,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision> {
        let usage = self.usage(owner_id, plan, now).await?;
        Ok(Self::evaluate(plan, &usage))
    }

    pub async fn remaining_data_budget(
        &self,
        owner_id: i64,
        plan: &SyncPlan,
        now: DateTime<Utc>,
    ) -> Result<DataBudget> {
        let usage = self.usage(owner_id, plan, now).await?;
        Ok(Self::budget(plan, &usage))
    }
}
