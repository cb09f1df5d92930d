use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::executor::SyncStats;
use crate::schedules::SyncType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Processing => "processing",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "processing" => Some(ExecutionStatus::Processing),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("execution {id} cannot move from {from} to {to}")]
    Invalid {
        id: Uuid,
        from: &'static str,
        to: &'static str,
    },
}

/// Whether a transition call changed the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Record already terminal; the call had no effect.
    Ignored,
}

/// key: execution-record -> one sync attempt, pending -> processing -> completed|failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub owner_id: i64,
    pub network_id: i64,
    /// `None` for manual runs.
    pub schedule_id: Option<Uuid>,
    pub sync_type: SyncType,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub records_synced: i64,
    pub campaigns_count: i64,
    pub coupons_count: i64,
    pub purchases_count: i64,
    pub error_message: Option<String>,
    pub metadata: Value,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn pending(
        owner_id: i64,
        network_id: i64,
        schedule_id: Option<Uuid>,
        sync_type: SyncType,
        metadata: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            network_id,
            schedule_id,
            sync_type,
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            records_synced: 0,
            campaigns_count: 0,
            coupons_count: 0,
            purchases_count: 0,
            error_message: None,
            metadata,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn invalid(&self, to: ExecutionStatus) -> TransitionError {
        TransitionError::Invalid {
            id: self.id,
            from: self.status.as_str(),
            to: to.as_str(),
        }
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<Transition, TransitionError> {
        if self.status != ExecutionStatus::Pending {
            return Err(self.invalid(ExecutionStatus::Processing));
        }
        self.status = ExecutionStatus::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(Transition::Applied)
    }

    pub fn mark_completed(
        &mut self,
        stats: &SyncStats,
        attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        match self.status {
            ExecutionStatus::Processing => {}
            status if status.is_terminal() => return Ok(Transition::Ignored),
            _ => return Err(self.invalid(ExecutionStatus::Completed)),
        }
        let started_at = self.started_at.unwrap_or(now);
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(now);
        self.duration_seconds = Some((now - started_at).num_seconds().max(0));
        self.records_synced = stats.total_records;
        self.campaigns_count = stats.campaigns_count;
        self.coupons_count = stats.coupons_count;
        self.purchases_count = stats.purchases_count;
        self.attempts = attempts;
        merge_metadata(
            &mut self.metadata,
            json!({ "executor": stats.metadata, "attempts": attempts }),
        );
        self.updated_at = now;
        Ok(Transition::Applied)
    }

    /// Only the first terminal call has effect; later calls are ignored.
    pub fn mark_failed(
        &mut self,
        message: &str,
        diagnostics: Option<Value>,
        attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        match self.status {
            ExecutionStatus::Processing => {}
            status if status.is_terminal() => return Ok(Transition::Ignored),
            _ => return Err(self.invalid(ExecutionStatus::Failed)),
        }
        self.status = ExecutionStatus::Failed;
        self.completed_at = Some(now);
        self.duration_seconds = self
            .started_at
            .map(|started_at| (now - started_at).num_seconds().max(0));
        self.error_message = Some(message.to_string());
        self.attempts = attempts;
        merge_metadata(&mut self.metadata, json!({ "attempts": attempts }));
        if let Some(diagnostics) = diagnostics {
            merge_metadata(&mut self.metadata, diagnostics);
        }
        self.updated_at = now;
        Ok(Transition::Applied)
    }
}

/// Shallow merge of `extra`'s keys into `target` (which becomes an object if needed).
pub fn merge_metadata(target: &mut Value, extra: Value) {
    let Value::Object(extra) = extra else {
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    if let Value::Object(map) = target {
        for (key, value) in extra {
            map.insert(key, value);
        }
    }
}
