use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::mpsc::Sender;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::executions::{
    dispatch_metadata, ExecutionRecord, ExecutionStatus, Failure, Trigger,
};
use crate::plans::SyncPlan;
use crate::schedules::{calculate_next_run_time, DateRangeMode, RunUpdate, Schedule};
use crate::windows::local_date;

use super::{ManualRun, SyncEngine, SyncJob, TriggerError};

const ORPHAN_SCAN_LIMIT: i64 = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub due: usize,
    pub claimed: usize,
    pub lost_claims: usize,
    pub dispatched: usize,
    pub quota_denied: usize,
    pub missing_connection: usize,
    pub missing_plan: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub requeued: usize,
    pub failed: usize,
}

/// key: job-orchestrator-driver -> fixed-cadence scheduler tick
///
/// Every `sweep_every` ticks the loop also sweeps for records that lost their worker.
pub fn spawn(engine: SyncEngine, queue: Sender<SyncJob>, interval: Duration, sweep_every: u64) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        let mut ticks: u64 = 0;
        loop {
            ticker.tick().await;
            if let Err(err) = engine.process_tick(&queue).await {
                warn!(?err, "sync scheduler tick failed");
            }
            ticks += 1;
            if sweep_every > 0 && ticks % sweep_every == 0 {
                if let Err(err) = engine.sweep_orphans(&queue).await {
                    warn!(?err, "orphan sweep failed");
                }
            }
        }
    });
}

async fn enqueue(queue: &Sender<SyncJob>, job: SyncJob) {
    if let Err(err) = queue.send(job).await {
        // Record stays pending; the next orphan sweep picks it up.
        warn!(execution_id = %err.0.execution_id, "sync worker queue closed");
    }
}

impl SyncEngine {
    /// key: job-orchestrator -> tick handler
    ///
    /// Each due schedule is claimed before anything is dispatched; a lost claim means
    /// another tick owns that run.
    pub async fn process_tick(&self, queue: &Sender<SyncJob>) -> Result<TickSummary> {
        let now = self.clock.now();
        let due = self.schedules.find_due(now, self.due_batch).await?;
        let mut summary = TickSummary {
            due: due.len(),
            ..TickSummary::default()
        };

        for schedule in due {
            if let Err(err) = self.dispatch_schedule(&schedule, now, queue, &mut summary).await {
                warn!(
                    ?err,
                    schedule_id = %schedule.id,
                    owner_id = schedule.owner_id,
                    "failed to dispatch due schedule"
                );
            }
        }

        if summary.due > 0 {
            info!(
                due = summary.due,
                claimed = summary.claimed,
                dispatched = summary.dispatched,
                quota_denied = summary.quota_denied,
                lost_claims = summary.lost_claims,
                "sync scheduler tick processed"
            );
        }
        Ok(summary)
    }

    async fn dispatch_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        queue: &Sender<SyncJob>,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let plan = self.plans.plan_for_owner(schedule.owner_id, now).await?;
        let cadence_plan = plan
            .clone()
            .unwrap_or_else(|| SyncPlan::unlimited("inactive"));
        let tz = cadence_plan.timezone;

        // Claim with the no-run cadence; `record_run` moves it on if a run happens.
        let idle = calculate_next_run_time(&schedule.with_tick_skipped(now), &cadence_plan, now);
        let Some(claimed) = self
            .schedules
            .claim(schedule.id, schedule.version, idle.at, now)
            .await?
        else {
            summary.lost_claims += 1;
            debug!(schedule_id = %schedule.id, "schedule already claimed elsewhere");
            return Ok(());
        };
        summary.claimed += 1;

        let Some(plan) = plan else {
            summary.missing_plan += 1;
            debug!(
                schedule_id = %schedule.id,
                owner_id = schedule.owner_id,
                "owner has no active plan; skipping run"
            );
            return Ok(());
        };

        let (date_from, date_to) = schedule
            .date_range_mode
            .unwrap_or(DateRangeMode::Today)
            .resolve(now, tz);

        let mut dispatched = 0;
        let mut outcome = Ok(());
        for &network_id in &schedule.network_targets {
            let job = match self
                .dispatch_target(schedule, &plan, network_id, (date_from, date_to), now, summary)
                .await
            {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            };
            dispatched += 1;
            summary.dispatched += 1;
            info!(
                schedule_id = %schedule.id,
                execution_id = %job.execution_id,
                network_id,
                "dispatched scheduled sync"
            );
            enqueue(queue, job).await;
        }

        if dispatched > 0 {
            let projected = schedule.with_run_recorded(now, tz);
            let next = calculate_next_run_time(&projected, &plan, now);
            let update = RunUpdate {
                runs_today: projected.runs_today,
                runs_reset_at: next.runs_reset_at,
                last_run_at: now,
                next_run_at: next.at,
            };
            if self
                .schedules
                .record_run(claimed.id, claimed.version, update)
                .await?
                .is_none()
            {
                warn!(schedule_id = %claimed.id, "schedule changed before run was recorded");
            }
        }
        outcome
    }

    /// Creates the pending record for one target, or `None` when the target is skipped.
    async fn dispatch_target(
        &self,
        schedule: &Schedule,
        plan: &SyncPlan,
        network_id: i64,
        (date_from, date_to): (NaiveDate, NaiveDate),
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<Option<SyncJob>> {
        if self
            .connections
            .active_connection(schedule.owner_id, network_id)
            .await?
            .is_none()
        {
            summary.missing_connection += 1;
            debug!(
                schedule_id = %schedule.id,
                network_id,
                "no active connection for schedule target"
            );
            return Ok(None);
        }

        let decision = self.enforcer.check(schedule.owner_id, plan, now).await?;
        if let Some(reason) = decision.reason {
            summary.quota_denied += 1;
            info!(
                schedule_id = %schedule.id,
                owner_id = schedule.owner_id,
                network_id,
                %reason,
                "quota denied scheduled sync"
            );
            return Ok(None);
        }

        let record = ExecutionRecord::pending(
            schedule.owner_id,
            network_id,
            Some(schedule.id),
            schedule.sync_type,
            dispatch_metadata(date_from, date_to, Trigger::Schedule),
            now,
        );
        self.executions.create(&record).await?;
        Ok(Some(SyncJob {
            execution_id: record.id,
        }))
    }

    /// key: job-orchestrator -> manual "run now" trigger
    pub async fn run_manual(
        &self,
        request: ManualRun,
        queue: &Sender<SyncJob>,
    ) -> Result<ExecutionRecord, TriggerError> {
        let now = self.clock.now();
        let plan = self
            .plans
            .plan_for_owner(request.owner_id, now)
            .await?
            .ok_or(TriggerError::NoPlan(request.owner_id))?;

        if self
            .connections
            .active_connection(request.owner_id, request.network_id)
            .await?
            .is_none()
        {
            return Err(TriggerError::NoConnection {
                owner_id: request.owner_id,
                network_id: request.network_id,
            });
        }

        let today = local_date(now, plan.timezone);
        let date_from = request.date_from.unwrap_or(today);
        let date_to = request.date_to.unwrap_or(today);
        if date_from > date_to {
            return Err(TriggerError::InvalidRange(format!(
                "dateFrom {date_from} is after dateTo {date_to}"
            )));
        }

        let decision = self.enforcer.check(request.owner_id, &plan, now).await?;
        if let Some(reason) = decision.reason {
            info!(
                owner_id = request.owner_id,
                network_id = request.network_id,
                %reason,
                "quota denied manual sync"
            );
            return Err(TriggerError::QuotaDenied(reason));
        }

        let record = ExecutionRecord::pending(
            request.owner_id,
            request.network_id,
            None,
            request.sync_type,
            dispatch_metadata(date_from, date_to, Trigger::Manual),
            now,
        );
        self.executions.create(&record).await?;
        info!(
            owner_id = record.owner_id,
            network_id = record.network_id,
            execution_id = %record.id,
            "dispatched manual sync"
        );
        enqueue(
            queue,
            SyncJob {
                execution_id: record.id,
            },
        )
        .await;
        Ok(record)
    }

    /// key: job-orchestrator -> orphan recovery after a restart
    ///
    /// Every pending record lost its queue entry with the old process and is sent again.
    pub async fn recover_orphans(&self, queue: &Sender<SyncJob>) -> Result<RecoverySummary> {
        let now = self.clock.now();
        self.recover(queue, now, now).await
    }

    /// Periodic variant of `recover_orphans`. Only pending records older than the
    /// worst-case retry budget are resent; younger ones may still be queued.
    pub async fn sweep_orphans(&self, queue: &Sender<SyncJob>) -> Result<RecoverySummary> {
        let now = self.clock.now();
        self.recover(queue, now - self.orphan_budget(), now).await
    }

    fn orphan_budget(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.retry.worst_case_runtime())
            .unwrap_or_else(|_| chrono::Duration::hours(1))
    }

    /// Pending records last touched at or before `pending_before` are sent again.
    /// Processing records older than the worst-case retry budget lost their worker
    /// and are failed.
    async fn recover(
        &self,
        queue: &Sender<SyncJob>,
        pending_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RecoverySummary> {
        let mut summary = RecoverySummary::default();

        let pending = self
            .executions
            .find_stale(ExecutionStatus::Pending, pending_before, ORPHAN_SCAN_LIMIT)
            .await?;
        for record in pending {
            summary.requeued += 1;
            enqueue(
                queue,
                SyncJob {
                    execution_id: record.id,
                },
            )
            .await;
        }

        let stuck = self
            .executions
            .find_stale(
                ExecutionStatus::Processing,
                now - self.orphan_budget(),
                ORPHAN_SCAN_LIMIT,
            )
            .await?;
        for record in stuck {
            let failure = Failure::new("worker lost before completion", record.attempts);
            if self.executions.fail(record.id, failure, now).await?.is_some() {
                summary.failed += 1;
                warn!(
                    execution_id = %record.id,
                    owner_id = record.owner_id,
                    "failed orphaned sync execution"
                );
            }
        }

        if summary.requeued > 0 || summary.failed > 0 {
            info!(
                requeued = summary.requeued,
                failed = summary.failed,
                "recovered orphaned sync executions"
            );
        }
        Ok(summary)
    }
}
