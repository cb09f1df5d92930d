use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::executions::{dispatch_dates, Completion, ExecutionRecord, Failure, UsageIncrement};
use crate::executor::SyncRequest;
use crate::quota::{UsageDelta, Window};
use crate::windows::{daily_window, local_date, monthly_window};

use super::retry::run_with_retry;
use super::{SyncEngine, SyncJob};

/// key: job-orchestrator-worker -> bounded pool draining the job channel
///
/// Jobs whose execution id is already held by a worker are dropped.
pub fn start_worker_pool(engine: SyncEngine, concurrency: usize, queue_depth: usize) -> Sender<SyncJob> {
    let (tx, mut rx): (Sender<SyncJob>, Receiver<SyncJob>) = channel(queue_depth.max(1));
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let in_flight: Arc<DashMap<Uuid, ()>> = Arc::new(DashMap::new());

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            if in_flight.insert(job.execution_id, ()).is_some() {
                debug!(execution_id = %job.execution_id, "duplicate sync job delivery dropped");
                continue;
            }
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let engine = engine.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.run_sync_job(job).await {
                    warn!(?err, execution_id = %job.execution_id, "sync job failed to settle");
                }
                in_flight.remove(&job.execution_id);
                drop(permit);
            });
        }
    });

    tx
}

impl SyncEngine {
    /// key: job-orchestrator -> worker task
    ///
    /// Returns the settled record, or `None` when the job was no longer runnable.
    pub async fn run_sync_job(&self, job: SyncJob) -> Result<Option<ExecutionRecord>> {
        let started = self.clock.now();
        let Some(record) = self
            .executions
            .mark_processing(job.execution_id, started)
            .await?
        else {
            debug!(execution_id = %job.execution_id, "execution no longer pending; skipping");
            return Ok(None);
        };

        let Some(plan) = self.plans.plan_for_owner(record.owner_id, started).await? else {
            return self
                .settle_failure(&record, Failure::new("owner has no active plan", 0))
                .await;
        };
        let Some(connection) = self
            .connections
            .active_connection(record.owner_id, record.network_id)
            .await?
        else {
            return self
                .settle_failure(
                    &record,
                    Failure::new("network connection is not active", 0)
                        .with_diagnostics(json!({ "errorKind": "auth" })),
                )
                .await;
        };

        let tz = plan.timezone;
        let (date_from, date_to) = dispatch_dates(&record.metadata).unwrap_or_else(|| {
            let today = local_date(started, tz);
            (today, today)
        });
        let budget = self
            .enforcer
            .remaining_data_budget(record.owner_id, &plan, started)
            .await?;

        let request = SyncRequest {
            execution_id: record.id,
            owner_id: record.owner_id,
            network_id: record.network_id,
            sync_type: record.sync_type,
            date_from,
            date_to,
            connection,
            budget,
        };

        let executor = self.executor.clone();
        let outcome = run_with_retry(&self.retry, record.id, |_attempt| {
            executor.execute(&request)
        })
        .await;
        let attempts = i32::try_from(outcome.attempts).unwrap_or(i32::MAX);

        match outcome.result {
            Ok(stats) => {
                let now = self.clock.now();
                let usage = UsageIncrement {
                    owner_id: record.owner_id,
                    daily: Window::from(daily_window(now, tz)),
                    monthly: Window::from(monthly_window(now, tz)),
                    delta: UsageDelta::from_stats(&stats),
                };
                let completion = Completion {
                    stats,
                    attempts,
                    usage,
                };
                match self.executions.complete(record.id, completion, now).await? {
                    Some(completed) => {
                        info!(
                            execution_id = %completed.id,
                            owner_id = completed.owner_id,
                            network_id = completed.network_id,
                            records = completed.records_synced,
                            attempts,
                            "sync execution completed"
                        );
                        Ok(Some(completed))
                    }
                    None => {
                        warn!(
                            execution_id = %record.id,
                            "sync result discarded; execution already settled"
                        );
                        Ok(None)
                    }
                }
            }
            Err(err) => {
                let mut diagnostics = json!({ "errorKind": err.kind() });
                if let Some(payload) = err.payload() {
                    diagnostics["payload"] = payload.clone();
                }
                let failure = Failure::new(err.to_string(), attempts).with_diagnostics(diagnostics);
                self.settle_failure(&record, failure).await
            }
        }
    }

    async fn settle_failure(
        &self,
        record: &ExecutionRecord,
        failure: Failure,
    ) -> Result<Option<ExecutionRecord>> {
        let now = self.clock.now();
        let message = failure.message.clone();
        let attempts = failure.attempts;
        let failed = self.executions.fail(record.id, failure, now).await?;
        if failed.is_some() {
            error!(
                execution_id = %record.id,
                owner_id = record.owner_id,
                network_id = record.network_id,
                attempts,
                error = %message,
                "sync execution failed"
            );
        }
        Ok(failed)
    }
}
