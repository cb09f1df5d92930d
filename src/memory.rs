use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::connections::{ConnectionResolver, NetworkConnection};
use crate::executions::{
    Completion, ExecutionFilter, ExecutionRecord, ExecutionStatus, ExecutionStore, Failure,
    Transition, UsageIncrement,
};
use crate::plans::{is_subscription_active, PlanDirectory, SyncPlan};
use crate::quota::{Period, QuotaBucket, QuotaLedger, UsageDelta, Window};
use crate::schedules::{RunUpdate, Schedule, ScheduleRegistry};

type BucketKey = (i64, Period, DateTime<Utc>);

#[derive(Debug, Clone)]
struct Subscription {
    plan: SyncPlan,
    status: String,
    current_period_end: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MemoryState {
    subscriptions: HashMap<i64, Subscription>,
    connections: Vec<NetworkConnection>,
    schedules: HashMap<Uuid, Schedule>,
    buckets: HashMap<BucketKey, QuotaBucket>,
    executions: HashMap<Uuid, ExecutionRecord>,
}

impl MemoryState {
    fn bucket_mut(
        &mut self,
        owner_id: i64,
        period: Period,
        window: Window,
        now: DateTime<Utc>,
    ) -> &mut QuotaBucket {
        self.buckets
            .entry((owner_id, period, window.start))
            .or_insert_with(|| QuotaBucket::empty(owner_id, period, window, now))
    }

    fn apply_increment(&mut self, usage: &UsageIncrement, now: DateTime<Utc>) {
        let delta = usage.delta;
        let daily = self.bucket_mut(usage.owner_id, Period::Daily, usage.daily, now);
        daily.sync_count += delta.sync;
        daily.revenue_count += delta.revenue;
        daily.orders_count += delta.orders;
        daily.folded_sync_count += delta.sync;
        daily.folded_revenue_count += delta.revenue;
        daily.folded_orders_count += delta.orders;
        daily.updated_at = now;

        let monthly = self.bucket_mut(usage.owner_id, Period::Monthly, usage.monthly, now);
        monthly.sync_count += delta.sync;
        monthly.revenue_count += delta.revenue;
        monthly.orders_count += delta.orders;
        monthly.updated_at = now;
    }
}

/// key: memory-store -> in-process repositories behind a single lock
///
/// Every operation holds the one lock for its whole duration, which gives the same
/// atomicity the Postgres store gets from single statements and transactions.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gives the owner an active subscription on `plan`.
    pub async fn set_plan(&self, owner_id: i64, plan: SyncPlan) {
        self.set_subscription(owner_id, plan, "active", None).await;
    }

    pub async fn set_subscription(
        &self,
        owner_id: i64,
        plan: SyncPlan,
        status: &str,
        current_period_end: Option<DateTime<Utc>>,
    ) {
        self.state.lock().await.subscriptions.insert(
            owner_id,
            Subscription {
                plan,
                status: status.to_string(),
                current_period_end,
            },
        );
    }

    pub async fn insert_connection(&self, connection: NetworkConnection) {
        let mut state = self.state.lock().await;
        state.connections.retain(|existing| {
            existing.owner_id != connection.owner_id || existing.network_id != connection.network_id
        });
        state.connections.push(connection);
    }

    pub async fn insert_schedule(&self, schedule: Schedule) {
        self.state
            .lock()
            .await
            .schedules
            .insert(schedule.id, schedule);
    }

    /// Replaces (or creates) a bucket as-is, bypassing the atomic increment path.
    pub async fn insert_bucket(&self, bucket: QuotaBucket) {
        self.state.lock().await.buckets.insert(
            (bucket.owner_id, bucket.period, bucket.window_start),
            bucket,
        );
    }

    pub async fn buckets(&self, owner_id: i64) -> Vec<QuotaBucket> {
        let state = self.state.lock().await;
        let mut buckets: Vec<_> = state
            .buckets
            .values()
            .filter(|bucket| bucket.owner_id == owner_id)
            .cloned()
            .collect();
        buckets.sort_by_key(|bucket| (bucket.period.as_str(), bucket.window_start));
        buckets
    }

    pub async fn executions(&self) -> Vec<ExecutionRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state.executions.values().cloned().collect();
        records.sort_by_key(|record| record.created_at);
        records
    }
}

#[async_trait]
impl PlanDirectory for MemoryStore {
    async fn plan_for_owner(&self, owner_id: i64, now: DateTime<Utc>) -> Result<Option<SyncPlan>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .get(&owner_id)
            .filter(|sub| is_subscription_active(&sub.status, sub.current_period_end, now))
            .map(|sub| sub.plan.clone()))
    }

    async fn active_owners(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let state = self.state.lock().await;
        let mut owners: Vec<i64> = state
            .subscriptions
            .iter()
            .filter(|(_, sub)| is_subscription_active(&sub.status, sub.current_period_end, now))
            .map(|(owner_id, _)| *owner_id)
            .collect();
        owners.sort_unstable();
        Ok(owners)
    }
}

#[async_trait]
impl ConnectionResolver for MemoryStore {
    async fn active_connection(
        &self,
        owner_id: i64,
        network_id: i64,
    ) -> Result<Option<NetworkConnection>> {
        let state = self.state.lock().await;
        Ok(state
            .connections
            .iter()
            .find(|conn| {
                conn.owner_id == owner_id && conn.network_id == network_id && conn.is_active()
            })
            .cloned())
    }
}

#[async_trait]
impl ScheduleRegistry for MemoryStore {
    async fn get(&self, schedule_id: Uuid) -> Result<Option<Schedule>> {
        Ok(self.state.lock().await.schedules.get(&schedule_id).cloned())
    }

    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<Schedule>> {
        let state = self.state.lock().await;
        let mut schedules: Vec<_> = state
            .schedules
            .values()
            .filter(|schedule| schedule.owner_id == owner_id)
            .cloned()
            .collect();
        schedules.sort_by_key(|schedule| schedule.created_at);
        Ok(schedules)
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Schedule>> {
        let state = self.state.lock().await;
        let mut due: Vec<_> = state
            .schedules
            .values()
            .filter(|schedule| schedule.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|schedule| schedule.next_run_at);
        due.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(due)
    }

    async fn claim(
        &self,
        schedule_id: Uuid,
        expected_version: i64,
        next: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Schedule>> {
        let mut state = self.state.lock().await;
        let Some(schedule) = state.schedules.get_mut(&schedule_id) else {
            return Ok(None);
        };
        if schedule.version != expected_version || !schedule.is_due(now) {
            return Ok(None);
        }
        if schedule.reset_due(now) {
            schedule.runs_today = 0;
            schedule.runs_reset_at = None;
        }
        schedule.next_run_at = next;
        schedule.version += 1;
        schedule.updated_at = now;
        Ok(Some(schedule.clone()))
    }

    async fn record_run(
        &self,
        schedule_id: Uuid,
        expected_version: i64,
        update: RunUpdate,
    ) -> Result<Option<Schedule>> {
        let mut state = self.state.lock().await;
        let Some(schedule) = state.schedules.get_mut(&schedule_id) else {
            return Ok(None);
        };
        if schedule.version != expected_version {
            return Ok(None);
        }
        schedule.runs_today = update.runs_today.clamp(0, schedule.max_runs_per_day);
        schedule.runs_reset_at = update.runs_reset_at;
        schedule.last_run_at = Some(update.last_run_at);
        schedule.next_run_at = update.next_run_at;
        schedule.version += 1;
        schedule.updated_at = update.last_run_at;
        Ok(Some(schedule.clone()))
    }

    async fn reset_daily_runs(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut reset = 0;
        for schedule in state.schedules.values_mut() {
            if schedule.reset_due(now) {
                schedule.runs_today = 0;
                schedule.runs_reset_at = None;
                schedule.version += 1;
                schedule.updated_at = now;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[async_trait]
impl QuotaLedger for MemoryStore {
    async fn get_or_create(
        &self,
        owner_id: i64,
        period: Period,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<QuotaBucket> {
        let mut state = self.state.lock().await;
        Ok(state.bucket_mut(owner_id, period, window, now).clone())
    }

    async fn find(
        &self,
        owner_id: i64,
        period: Period,
        window_start: DateTime<Utc>,
    ) -> Result<Option<QuotaBucket>> {
        let state = self.state.lock().await;
        Ok(state.buckets.get(&(owner_id, period, window_start)).cloned())
    }

    async fn list(&self, owner_id: i64, period: Period, limit: i64) -> Result<Vec<QuotaBucket>> {
        let state = self.state.lock().await;
        let mut buckets: Vec<_> = state
            .buckets
            .values()
            .filter(|bucket| bucket.owner_id == owner_id && bucket.period == period)
            .cloned()
            .collect();
        buckets.sort_by(|a, b| b.window_start.cmp(&a.window_start));
        buckets.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(buckets)
    }

    async fn increment_usage(
        &self,
        owner_id: i64,
        daily: Window,
        monthly: Window,
        delta: UsageDelta,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.apply_increment(
            &UsageIncrement {
                owner_id,
                daily,
                monthly,
                delta,
            },
            now,
        );
        Ok(())
    }

    async fn unrotated_daily(
        &self,
        owner_id: i64,
        before: DateTime<Utc>,
    ) -> Result<Vec<QuotaBucket>> {
        let state = self.state.lock().await;
        let mut buckets: Vec<_> = state
            .buckets
            .values()
            .filter(|bucket| {
                bucket.owner_id == owner_id
                    && bucket.period == Period::Daily
                    && bucket.rotated_at.is_none()
                    && bucket.window_end <= before
            })
            .cloned()
            .collect();
        buckets.sort_by_key(|bucket| bucket.window_start);
        Ok(buckets)
    }

    async fn fold_into_month(
        &self,
        owner_id: i64,
        daily: Window,
        monthly: Window,
        now: DateTime<Utc>,
    ) -> Result<UsageDelta> {
        let mut state = self.state.lock().await;
        let Some(day) = state.buckets.get_mut(&(owner_id, Period::Daily, daily.start)) else {
            return Ok(UsageDelta::default());
        };
        let unfolded = day.unfolded();
        day.folded_sync_count = day.sync_count;
        day.folded_revenue_count = day.revenue_count;
        day.folded_orders_count = day.orders_count;
        day.rotated_at.get_or_insert(now);
        day.updated_at = now;

        let month = state.bucket_mut(owner_id, Period::Monthly, monthly, now);
        month.sync_count += unfolded.sync;
        month.revenue_count += unfolded.revenue;
        month.orders_count += unfolded.orders;
        month.updated_at = now;
        Ok(unfolded)
    }

    async fn reset_stale(
        &self,
        owner_id: i64,
        period: Period,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaBucket>> {
        let mut state = self.state.lock().await;
        if let Some(bucket) = state.buckets.get_mut(&(owner_id, period, window.start)) {
            if bucket.updated_at >= window.start {
                return Ok(None);
            }
            bucket.sync_count = 0;
            bucket.revenue_count = 0;
            bucket.orders_count = 0;
            bucket.folded_sync_count = 0;
            bucket.folded_revenue_count = 0;
            bucket.folded_orders_count = 0;
            bucket.updated_at = now;
            return Ok(Some(bucket.clone()));
        }
        Ok(Some(state.bucket_mut(owner_id, period, window, now).clone()))
    }

    async fn prune_daily(
        &self,
        unrotated_before: DateTime<Utc>,
        rotated_before: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.buckets.len();
        state.buckets.retain(|_, bucket| {
            bucket.period != Period::Daily
                || !(bucket.window_end <= unrotated_before
                    || (bucket.rotated_at.is_some() && bucket.window_end <= rotated_before))
        });
        Ok((before - state.buckets.len()) as u64)
    }

    async fn prune_monthly(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let count = state.buckets.len();
        state
            .buckets
            .retain(|_, bucket| bucket.period != Period::Monthly || bucket.window_end > before);
        Ok((count - state.buckets.len()) as u64)
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create(&self, record: &ExecutionRecord) -> Result<()> {
        self.state
            .lock()
            .await
            .executions
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ExecutionRecord>> {
        Ok(self.state.lock().await.executions.get(&id).cloned())
    }

    async fn mark_processing(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<ExecutionRecord>> {
        let mut state = self.state.lock().await;
        let Some(record) = state.executions.get_mut(&id) else {
            return Ok(None);
        };
        match record.mark_processing(now) {
            Ok(_) => Ok(Some(record.clone())),
            Err(err) => {
                debug!(%err, "processing transition rejected");
                Ok(None)
            }
        }
    }

    async fn complete(
        &self,
        id: Uuid,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>> {
        let mut state = self.state.lock().await;
        let Some(record) = state.executions.get_mut(&id) else {
            return Ok(None);
        };
        match record.mark_completed(&completion.stats, completion.attempts, now) {
            Ok(Transition::Applied) => {
                let completed = record.clone();
                state.apply_increment(&completion.usage, now);
                Ok(Some(completed))
            }
            Ok(Transition::Ignored) => Ok(None),
            Err(err) => {
                debug!(%err, "completion transition rejected");
                Ok(None)
            }
        }
    }

    async fn fail(
        &self,
        id: Uuid,
        failure: Failure,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>> {
        let mut state = self.state.lock().await;
        let Some(record) = state.executions.get_mut(&id) else {
            return Ok(None);
        };
        match record.mark_failed(&failure.message, failure.diagnostics, failure.attempts, now) {
            Ok(Transition::Applied) => Ok(Some(record.clone())),
            Ok(Transition::Ignored) => Ok(None),
            Err(err) => {
                debug!(%err, "failure transition rejected");
                Ok(None)
            }
        }
    }

    async fn query(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state
            .executions
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(usize::try_from(filter.effective_limit()).unwrap_or(usize::MAX));
        Ok(records)
    }

    async fn count_dispatched_since(&self, owner_id: i64, since: DateTime<Utc>) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .executions
            .values()
            .filter(|record| {
                record.owner_id == owner_id
                    && record.status != ExecutionStatus::Failed
                    && record.created_at >= since
            })
            .count() as i64)
    }

    async fn count_in_flight_since(&self, owner_id: i64, since: DateTime<Utc>) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .executions
            .values()
            .filter(|record| {
                record.owner_id == owner_id
                    && !record.status.is_terminal()
                    && record.created_at >= since
            })
            .count() as i64)
    }

    async fn find_stale(
        &self,
        status: ExecutionStatus,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state
            .executions
            .values()
            .filter(|record| record.status == status && record.updated_at <= before)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.updated_at);
        records.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn day(d: u32) -> Window {
        let start = Utc.with_ymd_and_hms(2024, 5, d, 0, 0, 0).unwrap();
        Window::new(start, start + Duration::days(1))
    }

    fn may() -> Window {
        Window::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn live_increment_is_not_folded_twice() {
        let store = MemoryStore::new();
        let now = day(3).start + Duration::hours(5);
        store
            .increment_usage(7, day(3), may(), UsageDelta::new(1, 4, 2), now)
            .await
            .unwrap();
        let folded = store
            .fold_into_month(7, day(3), may(), now + Duration::days(1))
            .await
            .unwrap();
        assert!(folded.is_zero());
        let month = store.find(7, Period::Monthly, may().start).await.unwrap().unwrap();
        assert_eq!(month.usage(), UsageDelta::new(1, 4, 2));
    }

    #[tokio::test]
    async fn prune_honours_rotation_state() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2024, 5, 20, 1, 0, 0).unwrap();
        for d in [5, 10] {
            store.get_or_create(7, Period::Daily, day(d), now).await.unwrap();
        }
        store.fold_into_month(7, day(5), may(), now).await.unwrap();
        let pruned = store
            .prune_daily(now - Duration::days(30), now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.find(7, Period::Daily, day(5).start).await.unwrap().is_none());
        assert!(store.find(7, Period::Daily, day(10).start).await.unwrap().is_some());
    }
}
