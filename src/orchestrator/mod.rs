pub mod retry;
pub mod tick;
pub mod worker;

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::connections::ConnectionResolver;
use crate::executions::ExecutionStore;
use crate::executor::SyncExecutor;
use crate::plans::PlanDirectory;
use crate::quota::{QuotaEnforcer, QuotaExceeded, QuotaLedger};
use crate::schedules::{ScheduleRegistry, SyncType};

pub use retry::{run_with_retry, RetryOutcome, RetryPolicy};
pub use tick::{RecoverySummary, TickSummary};
pub use worker::start_worker_pool;

const DEFAULT_DUE_BATCH: i64 = 200;

/// Unit of work handed to the worker pool. Everything else is read back from the
/// execution record, so a job can be rebuilt from storage after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncJob {
    pub execution_id: Uuid,
}

/// "Run now" request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualRun {
    pub owner_id: i64,
    pub network_id: i64,
    pub sync_type: SyncType,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("owner {0} has no active subscription plan")]
    NoPlan(i64),
    #[error("owner {owner_id} has no active connection to network {network_id}")]
    NoConnection { owner_id: i64, network_id: i64 },
    #[error("invalid date range: {0}")]
    InvalidRange(String),
    #[error("sync not permitted: {0}")]
    QuotaDenied(QuotaExceeded),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// key: job-orchestrator -> wiring of every collaborator the engine talks to
#[derive(Clone)]
pub struct SyncEngine {
    pub clock: Arc<dyn Clock>,
    pub schedules: Arc<dyn ScheduleRegistry>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub executions: Arc<dyn ExecutionStore>,
    pub plans: Arc<dyn PlanDirectory>,
    pub connections: Arc<dyn ConnectionResolver>,
    pub executor: Arc<dyn SyncExecutor>,
    pub enforcer: QuotaEnforcer,
    pub retry: RetryPolicy,
    pub due_batch: i64,
}

impl SyncEngine {
    /// Wires the engine against one store backing every repository.
    pub fn from_store<S>(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn SyncExecutor>,
        retry: RetryPolicy,
    ) -> Self
    where
        S: ScheduleRegistry
            + QuotaLedger
            + ExecutionStore
            + PlanDirectory
            + ConnectionResolver
            + 'static,
    {
        let ledger: Arc<dyn QuotaLedger> = store.clone();
        let executions: Arc<dyn ExecutionStore> = store.clone();
        Self {
            clock,
            schedules: store.clone(),
            enforcer: QuotaEnforcer::new(ledger.clone(), executions.clone()),
            ledger,
            executions,
            plans: store.clone(),
            connections: store,
            executor,
            retry,
            due_batch: DEFAULT_DUE_BATCH,
        }
    }

    pub fn with_due_batch(mut self, due_batch: i64) -> Self {
        self.due_batch = due_batch.max(1);
        self
    }
}
