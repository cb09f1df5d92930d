pub mod cadence;
pub mod models;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use cadence::{calculate_next_run_time, NextRun};
pub use models::{DateRangeMode, RunUpdate, Schedule, SyncType};

/// key: schedule-registry -> due scan, compare-and-advance claim, run tracking
#[async_trait]
pub trait ScheduleRegistry: Send + Sync {
    async fn get(&self, schedule_id: Uuid) -> Result<Option<Schedule>>;

    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<Schedule>>;

    /// Active schedules with `next_run_at <= now` and room left under today's cap,
    /// oldest first.
    async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Schedule>>;

    /// Advances `next_run_at` to `next` only if the stored row still has
    /// `expected_version` and is still due at `now`. A passed reset marker is applied
    /// in the same write. Returns the claimed row, or `None` when another claimant won.
    async fn claim(
        &self,
        schedule_id: Uuid,
        expected_version: i64,
        next: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Schedule>>;

    /// Persists run tracking for a dispatched run, guarded by `expected_version`.
    async fn record_run(
        &self,
        schedule_id: Uuid,
        expected_version: i64,
        update: RunUpdate,
    ) -> Result<Option<Schedule>>;

    /// Zeroes `runs_today` on every schedule whose reset marker has passed.
    async fn reset_daily_runs(&self, now: DateTime<Utc>) -> Result<u64>;
}
