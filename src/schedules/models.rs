use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::windows::{first_of_month, local_date, next_local_midnight};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    All,
    Campaigns,
    Coupons,
    Purchases,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::All => "all",
            SyncType::Campaigns => "campaigns",
            SyncType::Coupons => "coupons",
            SyncType::Purchases => "purchases",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(SyncType::All),
            "campaigns" => Some(SyncType::Campaigns),
            "coupons" => Some(SyncType::Coupons),
            "purchases" => Some(SyncType::Purchases),
            _ => None,
        }
    }
}

/// Which owner-local dates a scheduled sync pulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateRangeMode {
    Today,
    Yesterday,
    #[serde(rename = "last_7_days")]
    Last7Days,
    #[serde(rename = "last_30_days")]
    Last30Days,
    MonthToDate,
}

impl DateRangeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DateRangeMode::Today => "today",
            DateRangeMode::Yesterday => "yesterday",
            DateRangeMode::Last7Days => "last_7_days",
            DateRangeMode::Last30Days => "last_30_days",
            DateRangeMode::MonthToDate => "month_to_date",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "today" => Some(DateRangeMode::Today),
            "yesterday" => Some(DateRangeMode::Yesterday),
            "last_7_days" => Some(DateRangeMode::Last7Days),
            "last_30_days" => Some(DateRangeMode::Last30Days),
            "month_to_date" => Some(DateRangeMode::MonthToDate),
            _ => None,
        }
    }

    /// Inclusive `(from, to)` owner-local dates.
    pub fn resolve(&self, now: DateTime<Utc>, tz: Tz) -> (NaiveDate, NaiveDate) {
        let today = local_date(now, tz);
        match self {
            DateRangeMode::Today => (today, today),
            DateRangeMode::Yesterday => {
                let yesterday = today - Duration::days(1);
                (yesterday, yesterday)
            }
            DateRangeMode::Last7Days => (today - Duration::days(6), today),
            DateRangeMode::Last30Days => (today - Duration::days(29), today),
            DateRangeMode::MonthToDate => (first_of_month(today), today),
        }
    }
}

/// key: schedule-model -> recurring sync definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub owner_id: i64,
    pub network_targets: Vec<i64>,
    pub sync_type: SyncType,
    pub date_range_mode: Option<DateRangeMode>,
    pub interval_minutes: i32,
    pub max_runs_per_day: i32,
    pub runs_today: i32,
    /// Instant at which `runs_today` falls back to zero.
    pub runs_reset_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub active: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(
        owner_id: i64,
        network_targets: Vec<i64>,
        sync_type: SyncType,
        interval_minutes: i32,
        max_runs_per_day: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            network_targets,
            sync_type,
            date_range_mode: None,
            interval_minutes: interval_minutes.max(1),
            max_runs_per_day: max_runs_per_day.max(0),
            runs_today: 0,
            runs_reset_at: None,
            last_run_at: None,
            next_run_at: now,
            active: true,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn reset_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.runs_reset_at, Some(at) if at <= now)
    }

    /// Runs counted against today's cap once a passed reset marker is applied.
    pub fn effective_runs_today(&self, now: DateTime<Utc>) -> i32 {
        if self.reset_due(now) {
            0
        } else {
            self.runs_today
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.next_run_at <= now
            && self.effective_runs_today(now) < self.max_runs_per_day
    }

    pub fn interval(&self) -> Duration {
        Duration::minutes(i64::from(self.interval_minutes.max(1)))
    }

    /// Cadence view of a tick at `now` that ends without a run: the interval restarts
    /// from `now` and the run count is left alone.
    pub fn with_tick_skipped(&self, now: DateTime<Utc>) -> Schedule {
        let mut idle = self.clone();
        if idle.reset_due(now) {
            idle.runs_today = 0;
            idle.runs_reset_at = None;
        }
        idle.last_run_at = Some(now);
        idle
    }

    /// The run-tracking fields as they will read once a run at `now` is recorded.
    pub fn with_run_recorded(&self, now: DateTime<Utc>, tz: Tz) -> Schedule {
        let mut projected = self.clone();
        if projected.reset_due(now) {
            projected.runs_today = 0;
        }
        if projected.runs_reset_at.map_or(true, |at| at <= now) {
            projected.runs_reset_at = Some(next_local_midnight(now, tz));
        }
        projected.runs_today = (projected.runs_today + 1).min(projected.max_runs_per_day);
        projected.last_run_at = Some(now);
        projected
    }
}

/// Persisted outcome of `record_run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunUpdate {
    pub runs_today: i32,
    pub runs_reset_at: Option<DateTime<Utc>>,
    pub last_run_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, h, 0, 0).unwrap()
    }

    #[test]
    fn inactive_schedule_is_never_due() {
        let mut schedule = Schedule::new(1, vec![10], SyncType::All, 60, 5, at(8));
        assert!(schedule.is_due(at(9)));
        schedule.active = false;
        assert!(!schedule.is_due(at(9)));
    }

    #[test]
    fn capped_schedule_becomes_due_after_reset_marker() {
        let mut schedule = Schedule::new(1, vec![10], SyncType::All, 60, 2, at(8));
        schedule.runs_today = 2;
        schedule.runs_reset_at = Some(at(12));
        assert!(!schedule.is_due(at(10)));
        assert!(schedule.is_due(at(12)));
        assert_eq!(schedule.effective_runs_today(at(12)), 0);
    }

    #[test]
    fn recorded_run_never_exceeds_cap() {
        let mut schedule = Schedule::new(1, vec![10], SyncType::All, 60, 2, at(8));
        schedule.runs_today = 2;
        schedule.runs_reset_at = Some(at(23));
        let projected = schedule.with_run_recorded(at(9), Tz::UTC);
        assert_eq!(projected.runs_today, 2);
        assert_eq!(projected.last_run_at, Some(at(9)));
    }

    #[test]
    fn skipped_tick_keeps_run_count() {
        let mut schedule = Schedule::new(1, vec![10], SyncType::All, 60, 3, at(8));
        schedule.runs_today = 2;
        schedule.runs_reset_at = Some(at(23));
        let idle = schedule.with_tick_skipped(at(10));
        assert_eq!(idle.runs_today, 2);
        assert_eq!(idle.runs_reset_at, Some(at(23)));
        assert_eq!(idle.last_run_at, Some(at(10)));
    }

    #[test]
    fn first_run_of_day_sets_midnight_marker() {
        let schedule = Schedule::new(1, vec![10], SyncType::All, 60, 5, at(8));
        let projected = schedule.with_run_recorded(at(9), Tz::UTC);
        assert_eq!(projected.runs_today, 1);
        assert_eq!(
            projected.runs_reset_at,
            Some(Utc.with_ymd_and_hms(2024, 6, 4, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn month_to_date_starts_on_the_first() {
        let (from, to) = DateRangeMode::MonthToDate.resolve(at(9), Tz::UTC);
        assert_eq!(from, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
    }
}
