use std::ops::Add;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::SyncStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Daily,
    Monthly,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Monthly => "monthly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(Period::Daily),
            "monthly" => Some(Period::Monthly),
            _ => None,
        }
    }
}

/// `[start, end)` of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

impl From<(DateTime<Utc>, DateTime<Utc>)> for Window {
    fn from((start, end): (DateTime<Utc>, DateTime<Utc>)) -> Self {
        Self { start, end }
    }
}

/// Counter triple carried by buckets, increments and folds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    pub sync: i64,
    pub revenue: i64,
    pub orders: i64,
}

impl UsageDelta {
    pub fn new(sync: i64, revenue: i64, orders: i64) -> Self {
        Self {
            sync,
            revenue,
            orders,
        }
    }

    /// One completed sync plus the revenue and order units it pulled.
    pub fn from_stats(stats: &SyncStats) -> Self {
        Self {
            sync: 1,
            revenue: stats.revenue_units(),
            orders: stats.order_units(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.sync == 0 && self.revenue == 0 && self.orders == 0
    }

    /// Component-wise `self - other`, floored at zero.
    pub fn saturating_sub(&self, other: &UsageDelta) -> UsageDelta {
        UsageDelta {
            sync: (self.sync - other.sync).max(0),
            revenue: (self.revenue - other.revenue).max(0),
            orders: (self.orders - other.orders).max(0),
        }
    }
}

impl Add for UsageDelta {
    type Output = UsageDelta;

    fn add(self, rhs: UsageDelta) -> UsageDelta {
        UsageDelta {
            sync: self.sync + rhs.sync,
            revenue: self.revenue + rhs.revenue,
            orders: self.orders + rhs.orders,
        }
    }
}

/// key: quota-bucket -> per-owner usage window
///
/// `folded_*` only matter on daily buckets: the part of the day's counters that is
/// already reflected in the monthly bucket, either through live increments or a
/// rotation fold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaBucket {
    pub id: Uuid,
    pub owner_id: i64,
    pub period: Period,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub sync_count: i64,
    pub revenue_count: i64,
    pub orders_count: i64,
    pub folded_sync_count: i64,
    pub folded_revenue_count: i64,
    pub folded_orders_count: i64,
    pub rotated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaBucket {
    pub fn empty(owner_id: i64, period: Period, window: Window, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            period,
            window_start: window.start,
            window_end: window.end,
            sync_count: 0,
            revenue_count: 0,
            orders_count: 0,
            folded_sync_count: 0,
            folded_revenue_count: 0,
            folded_orders_count: 0,
            rotated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn window(&self) -> Window {
        Window::new(self.window_start, self.window_end)
    }

    pub fn usage(&self) -> UsageDelta {
        UsageDelta::new(self.sync_count, self.revenue_count, self.orders_count)
    }

    pub fn folded(&self) -> UsageDelta {
        UsageDelta::new(
            self.folded_sync_count,
            self.folded_revenue_count,
            self.folded_orders_count,
        )
    }

    /// Counters not yet carried into the month.
    pub fn unfolded(&self) -> UsageDelta {
        self.usage().saturating_sub(&self.folded())
    }
}
