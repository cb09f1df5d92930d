pub mod models;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::executor::SyncStats;
use crate::quota::{UsageDelta, Window};

pub use models::{merge_metadata, ExecutionRecord, ExecutionStatus, Transition, TransitionError};

/// Quota effect of a completed sync, applied in the same write as the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageIncrement {
    pub owner_id: i64,
    pub daily: Window,
    pub monthly: Window,
    pub delta: UsageDelta,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub stats: SyncStats,
    pub attempts: i32,
    pub usage: UsageIncrement,
}

#[derive(Debug, Clone)]
pub struct Failure {
    pub message: String,
    /// Merged into the record's metadata.
    pub diagnostics: Option<Value>,
    pub attempts: i32,
}

impl Failure {
    pub fn new(message: impl Into<String>, attempts: i32) -> Self {
        Self {
            message: message.into(),
            diagnostics: None,
            attempts,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Value) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionFilter {
    pub owner_id: Option<i64>,
    pub status: Option<ExecutionStatus>,
    pub schedule_id: Option<Uuid>,
    /// Inclusive lower bound on `created_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl ExecutionFilter {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 500;

    pub fn effective_limit(&self) -> i64 {
        self.limit
            .filter(|limit| *limit > 0)
            .unwrap_or(Self::DEFAULT_LIMIT)
            .min(Self::MAX_LIMIT)
    }

    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.owner_id.map_or(true, |owner| record.owner_id == owner)
            && self.status.map_or(true, |status| record.status == status)
            && self
                .schedule_id
                .map_or(true, |id| record.schedule_id == Some(id))
            && self.from.map_or(true, |from| record.created_at >= from)
            && self.to.map_or(true, |to| record.created_at < to)
    }
}

/// How a record came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Schedule,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Schedule => "schedule",
            Trigger::Manual => "manual",
        }
    }
}

/// Metadata stamped on a record at dispatch.
pub fn dispatch_metadata(date_from: NaiveDate, date_to: NaiveDate, trigger: Trigger) -> Value {
    json!({
        "dateFrom": date_from.to_string(),
        "dateTo": date_to.to_string(),
        "trigger": trigger.as_str(),
    })
}

/// The `(dateFrom, dateTo)` a record was dispatched with.
pub fn dispatch_dates(metadata: &Value) -> Option<(NaiveDate, NaiveDate)> {
    let parse = |key: &str| {
        metadata
            .get(key)
            .and_then(Value::as_str)
            .and_then(|value| NaiveDate::parse_from_str(value, "%Y-%m-%d").ok())
    };
    Some((parse("dateFrom")?, parse("dateTo")?))
}

/// key: execution-store -> durable execution records with guarded transitions
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create(&self, record: &ExecutionRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<ExecutionRecord>>;

    /// `pending -> processing`. `None` when the record is missing or not pending.
    async fn mark_processing(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<ExecutionRecord>>;

    /// `processing -> completed` plus the quota increment, in one atomic step. The
    /// increment is applied only when the transition is. `None` when nothing changed.
    async fn complete(
        &self,
        id: Uuid,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>>;

    /// `processing -> failed`. Never overwrites a terminal record. `None` when
    /// nothing changed.
    async fn fail(
        &self,
        id: Uuid,
        failure: Failure,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>>;

    /// Newest first.
    async fn query(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>>;

    /// Records of the owner created at or after `since` that did not fail.
    async fn count_dispatched_since(&self, owner_id: i64, since: DateTime<Utc>) -> Result<i64>;

    /// Pending or processing records of the owner created at or after `since`.
    async fn count_in_flight_since(&self, owner_id: i64, since: DateTime<Utc>) -> Result<i64>;

    /// Records in `status` last touched before `before`, oldest first.
    async fn find_stale(
        &self,
        status: ExecutionStatus,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>>;
}
