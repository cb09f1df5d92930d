pub mod enforcer;
pub mod models;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use enforcer::{DataBudget, QuotaDecision, QuotaEnforcer, QuotaExceeded, QuotaUsage};
pub use models::{Period, QuotaBucket, UsageDelta, Window};

/// key: quota-ledger -> bucketed usage counters
///
/// Every write is an atomic add or a single guarded statement; callers never
/// read-modify-write counters.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Returns the bucket for `window`, creating it with zero counters if absent.
    async fn get_or_create(
        &self,
        owner_id: i64,
        period: Period,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<QuotaBucket>;

    async fn find(
        &self,
        owner_id: i64,
        period: Period,
        window_start: DateTime<Utc>,
    ) -> Result<Option<QuotaBucket>>;

    /// Most recent buckets first.
    async fn list(&self, owner_id: i64, period: Period, limit: i64) -> Result<Vec<QuotaBucket>>;

    /// Adds `delta` to the daily and monthly buckets in one atomic step. The daily
    /// bucket records the same amount as folded so rotation does not count it twice.
    async fn increment_usage(
        &self,
        owner_id: i64,
        daily: Window,
        monthly: Window,
        delta: UsageDelta,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Daily buckets of the owner not yet rotated whose window ended at or before `before`.
    async fn unrotated_daily(
        &self,
        owner_id: i64,
        before: DateTime<Utc>,
    ) -> Result<Vec<QuotaBucket>>;

    /// Adds the unfolded remainder of the daily bucket at `daily` to the monthly bucket
    /// at `monthly` (created if absent), marks the day fully folded and stamps
    /// `rotated_at`. Returns the amount folded; zero when already folded or absent.
    async fn fold_into_month(
        &self,
        owner_id: i64,
        daily: Window,
        monthly: Window,
        now: DateTime<Utc>,
    ) -> Result<UsageDelta>;

    /// Get-or-create that also zeroes counters last written before the window opened.
    /// Usage recorded inside the window is left untouched. Returns the bucket when it
    /// was created or zeroed, `None` when it was kept as is.
    async fn reset_stale(
        &self,
        owner_id: i64,
        period: Period,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaBucket>>;

    /// Drops daily buckets that ended before `unrotated_before`, or before
    /// `rotated_before` once rotated.
    async fn prune_daily(
        &self,
        unrotated_before: DateTime<Utc>,
        rotated_before: DateTime<Utc>,
    ) -> Result<u64>;

    async fn prune_monthly(&self, before: DateTime<Utc>) -> Result<u64>;
}
