use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use serde::Serialize;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config;
use crate::orchestrator::SyncEngine;
use crate::plans::PlanDirectory;
use crate::quota::{Period, QuotaLedger, UsageDelta, Window};
use crate::schedules::ScheduleRegistry;
use crate::windows::{daily_window, monthly_window};

/// How long buckets are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub daily_days: i64,
    pub rotated_daily_days: i64,
    pub monthly_months: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily_days: 30,
            rotated_daily_days: 7,
            monthly_months: 12,
        }
    }
}

impl RetentionPolicy {
    pub fn from_env() -> Self {
        Self {
            daily_days: *config::DAILY_BUCKET_RETENTION_DAYS,
            rotated_daily_days: *config::ROTATED_DAILY_RETENTION_DAYS,
            monthly_months: *config::MONTHLY_BUCKET_RETENTION_MONTHS,
        }
    }

    pub fn daily_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.daily_days)
    }

    pub fn rotated_daily_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.rotated_daily_days)
    }

    pub fn monthly_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_months(Months::new(self.monthly_months))
            .unwrap_or(now)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DailyResetSummary {
    pub owners: usize,
    /// Today's buckets whose stale counters were zeroed.
    pub reconciled: usize,
    pub schedules_reset: u64,
    pub pruned_daily: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RotationSummary {
    pub owners: usize,
    pub days_rotated: usize,
    pub folded: UsageDelta,
    pub pruned_daily: u64,
    pub pruned_monthly: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HousekeepingReport {
    pub daily_reset: Option<DailyResetSummary>,
    pub rotation: Option<RotationSummary>,
}

/// key: housekeeping -> daily reset and rotation of quota buckets
#[derive(Clone)]
pub struct Housekeeping {
    clock: Arc<dyn Clock>,
    ledger: Arc<dyn QuotaLedger>,
    schedules: Arc<dyn ScheduleRegistry>,
    plans: Arc<dyn PlanDirectory>,
    retention: RetentionPolicy,
}

impl Housekeeping {
    pub fn new(engine: &SyncEngine, retention: RetentionPolicy) -> Self {
        Self {
            clock: engine.clock.clone(),
            ledger: engine.ledger.clone(),
            schedules: engine.schedules.clone(),
            plans: engine.plans.clone(),
            retention,
        }
    }

    /// Makes sure every subscribed owner has a daily bucket for their local today,
    /// zeroing counters that predate the window. Usage recorded today is kept, so
    /// the routine can run at any hour and any number of times. Also applies passed
    /// `runs_today` reset markers and prunes stale daily buckets.
    pub async fn daily_reset(&self, now: DateTime<Utc>) -> Result<DailyResetSummary> {
        let mut summary = DailyResetSummary::default();
        for owner_id in self.plans.active_owners(now).await? {
            let Some(plan) = self.plans.plan_for_owner(owner_id, now).await? else {
                continue;
            };
            summary.owners += 1;
            let window = Window::from(daily_window(now, plan.timezone));
            let existing = self.ledger.find(owner_id, Period::Daily, window.start).await?;
            let zeroed = self
                .ledger
                .reset_stale(owner_id, Period::Daily, window, now)
                .await?
                .is_some();
            if let Some(existing) = existing.filter(|bucket| !bucket.usage().is_zero()) {
                if zeroed {
                    summary.reconciled += 1;
                    warn!(
                        owner_id,
                        sync_count = existing.sync_count,
                        revenue_count = existing.revenue_count,
                        orders_count = existing.orders_count,
                        "zeroed daily bucket holding counters from before its window"
                    );
                } else {
                    debug!(
                        owner_id,
                        sync_count = existing.sync_count,
                        "kept usage recorded inside today's window"
                    );
                }
            }
        }

        summary.schedules_reset = self.schedules.reset_daily_runs(now).await?;
        let cutoff = self.retention.daily_cutoff(now);
        summary.pruned_daily = self.ledger.prune_daily(cutoff, cutoff).await?;

        info!(
            owners = summary.owners,
            reconciled = summary.reconciled,
            schedules_reset = summary.schedules_reset,
            pruned_daily = summary.pruned_daily,
            "daily quota reset completed"
        );
        Ok(summary)
    }

    /// Folds every finished, unrotated daily bucket into the month it belongs to.
    /// Folding is keyed on the daily bucket itself, so a second run folds nothing.
    pub async fn rotate(&self, now: DateTime<Utc>) -> Result<RotationSummary> {
        let mut summary = RotationSummary::default();
        for owner_id in self.plans.active_owners(now).await? {
            let Some(plan) = self.plans.plan_for_owner(owner_id, now).await? else {
                continue;
            };
            summary.owners += 1;
            let tz = plan.timezone;
            let today_start = daily_window(now, tz).0;

            for bucket in self.ledger.unrotated_daily(owner_id, today_start).await? {
                let month = Window::from(monthly_window(bucket.window_start, tz));
                let folded = self
                    .ledger
                    .fold_into_month(owner_id, bucket.window(), month, now)
                    .await?;
                summary.days_rotated += 1;
                summary.folded = summary.folded + folded;
                debug!(
                    owner_id,
                    window_start = %bucket.window_start,
                    sync = folded.sync,
                    revenue = folded.revenue,
                    orders = folded.orders,
                    "rotated daily bucket into month"
                );
            }

            self.ledger
                .get_or_create(
                    owner_id,
                    Period::Monthly,
                    Window::from(monthly_window(now, tz)),
                    now,
                )
                .await?;
        }

        summary.pruned_daily = self
            .ledger
            .prune_daily(
                self.retention.daily_cutoff(now),
                self.retention.rotated_daily_cutoff(now),
            )
            .await?;
        summary.pruned_monthly = self
            .ledger
            .prune_monthly(self.retention.monthly_cutoff(now))
            .await?;

        info!(
            owners = summary.owners,
            days_rotated = summary.days_rotated,
            folded_syncs = summary.folded.sync,
            pruned_daily = summary.pruned_daily,
            pruned_monthly = summary.pruned_monthly,
            "quota rotation completed"
        );
        Ok(summary)
    }

    /// Housekeeping tick: daily reset followed by rotation.
    pub async fn run(&self) -> Result<HousekeepingReport> {
        let now = self.clock.now();
        let daily_reset = self.daily_reset(now).await?;
        let rotation = self.rotate(now).await?;
        Ok(HousekeepingReport {
            daily_reset: Some(daily_reset),
            rotation: Some(rotation),
        })
    }

    /// Runs whichever routine has not yet run on the current UTC day.
    pub async fn run_due(&self, state: &mut HousekeepingState) -> Result<HousekeepingReport> {
        let now = self.clock.now();
        let today = now.date_naive();
        let mut report = HousekeepingReport::default();
        if state.daily_reset_on != Some(today) {
            report.daily_reset = Some(self.daily_reset(now).await?);
            state.daily_reset_on = Some(today);
        }
        if state.rotated_on != Some(today) {
            report.rotation = Some(self.rotate(now).await?);
            state.rotated_on = Some(today);
        }
        Ok(report)
    }
}

/// UTC days on which each routine last ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingState {
    pub daily_reset_on: Option<NaiveDate>,
    pub rotated_on: Option<NaiveDate>,
}

/// key: housekeeping-driver -> wakes periodically, runs each routine once per day
pub fn spawn(housekeeping: Housekeeping, interval: TokioDuration) {
    tokio::spawn(async move {
        let mut state = HousekeepingState::default();
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = housekeeping.run_due(&mut state).await {
                warn!(?err, "housekeeping tick failed");
            }
        }
    });
}
