use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Stored value meaning "no limit" for any cap column.
pub const UNLIMITED: i64 = -1;

/// Maps the storage sentinel onto `None` = unlimited.
pub fn limit_from_sentinel(value: i64) -> Option<i64> {
    if value < 0 {
        None
    } else {
        Some(value)
    }
}

pub fn limit_to_sentinel(limit: Option<i64>) -> i64 {
    limit.unwrap_or(UNLIMITED)
}

/// key: plan-model -> caps, rate limit, allowed window
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    pub code: String,
    pub daily_sync_limit: Option<i64>,
    pub monthly_sync_limit: Option<i64>,
    pub revenue_cap: Option<i64>,
    pub orders_cap: Option<i64>,
    pub rate_limit: Option<RateLimit>,
    pub allowed_window: Option<AllowedWindow>,
    pub timezone: Tz,
}

impl SyncPlan {
    /// A plan with every cap unlimited, no window and UTC as its zone.
    pub fn unlimited(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            daily_sync_limit: None,
            monthly_sync_limit: None,
            revenue_cap: None,
            orders_cap: None,
            rate_limit: None,
            allowed_window: None,
            timezone: Tz::UTC,
        }
    }
}

/// Time-of-day range (owner-local) in which syncs may start. `to` is exclusive.
/// When `from > to` the window wraps past midnight; `from == to` spans the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedWindow {
    pub from: NaiveTime,
    pub to: NaiveTime,
}

impl AllowedWindow {
    pub fn new(from: NaiveTime, to: NaiveTime) -> Self {
        Self { from, to }
    }

    pub fn wraps_midnight(&self) -> bool {
        self.from > self.to
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.from == self.to {
            return true;
        }
        if self.wraps_midnight() {
            time >= self.from || time < self.to
        } else {
            time >= self.from && time < self.to
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitUnit {
    Minute,
    Hour,
    Day,
}

impl RateLimitUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitUnit::Minute => "minute",
            RateLimitUnit::Hour => "hour",
            RateLimitUnit::Day => "day",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minute" | "minutes" => Some(RateLimitUnit::Minute),
            "hour" | "hours" => Some(RateLimitUnit::Hour),
            "day" | "days" => Some(RateLimitUnit::Day),
            _ => None,
        }
    }
}

/// At most `max_syncs` dispatched syncs per rolling `size` × `unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub unit: RateLimitUnit,
    pub size: u32,
    pub max_syncs: i64,
}

impl RateLimit {
    pub fn span(&self) -> Duration {
        let size = i64::from(self.size.max(1));
        match self.unit {
            RateLimitUnit::Minute => Duration::minutes(size),
            RateLimitUnit::Hour => Duration::hours(size),
            RateLimitUnit::Day => Duration::days(size),
        }
    }
}

/// Subscription states that keep an owner eligible for syncs and housekeeping.
pub fn is_subscription_active(
    status: &str,
    current_period_end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if status != "active" && status != "trialing" {
        return false;
    }
    if let Some(end) = current_period_end {
        if end < now {
            return false;
        }
    }
    true
}

/// key: plan-directory -> subscriber plan lookup (external settings store)
#[async_trait]
pub trait PlanDirectory: Send + Sync {
    /// Plan of an owner whose subscription is active or trialing at `now`.
    async fn plan_for_owner(&self, owner_id: i64, now: DateTime<Utc>) -> Result<Option<SyncPlan>>;

    /// Owners with an active or trialing subscription at `now`.
    async fn active_owners(&self, now: DateTime<Utc>) -> Result<Vec<i64>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn window_end_is_exclusive() {
        let window = AllowedWindow::new(t(9, 0), t(18, 0));
        assert!(window.contains(t(9, 0)));
        assert!(window.contains(t(17, 59)));
        assert!(!window.contains(t(18, 0)));
        assert!(!window.contains(t(8, 59)));
    }

    #[test]
    fn overnight_window_spans_midnight() {
        let window = AllowedWindow::new(t(22, 0), t(6, 0));
        assert!(window.contains(t(23, 30)));
        assert!(window.contains(t(2, 0)));
        assert!(!window.contains(t(6, 0)));
        assert!(!window.contains(t(12, 0)));
    }

    #[test]
    fn sentinel_maps_to_unlimited() {
        assert_eq!(limit_from_sentinel(UNLIMITED), None);
        assert_eq!(limit_from_sentinel(0), Some(0));
        assert_eq!(limit_to_sentinel(None), UNLIMITED);
    }

    #[test]
    fn subscription_activity_follows_status_and_period() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert!(is_subscription_active("trialing", None, now));
        assert!(!is_subscription_active("past_due", None, now));
        assert!(!is_subscription_active(
            "active",
            Some(now - Duration::days(1)),
            now
        ));
    }

    #[test]
    fn rate_limit_span_uses_unit_and_size() {
        let limit = RateLimit {
            unit: RateLimitUnit::Hour,
            size: 6,
            max_syncs: 2,
        };
        assert_eq!(limit.span(), Duration::hours(6));
        assert_eq!(RateLimitUnit::parse("Minutes"), Some(RateLimitUnit::Minute));
    }
}
