use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::executions::{ExecutionFilter, ExecutionRecord, ExecutionStatus};
use crate::housekeeping::{Housekeeping, HousekeepingReport};
use crate::orchestrator::{ManualRun, SyncEngine, SyncJob, TickSummary};
use crate::plans::limit_to_sentinel;
use crate::quota::{DataBudget, Period, QuotaBucket, QuotaDecision, QuotaEnforcer, Window};
use crate::schedules::Schedule;
use crate::windows::{daily_window, monthly_window};

const DEFAULT_BUCKET_LIMIT: i64 = 31;

/// Everything the handlers need, shared through an `Extension` layer.
#[derive(Clone)]
pub struct ApiState {
    pub engine: SyncEngine,
    pub queue: Sender<SyncJob>,
    pub housekeeping: Housekeeping,
}

/// key: sync-api -> dashboard reads and trigger endpoints
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/owners/:owner_id/schedules", get(list_schedules))
        .route("/api/owners/:owner_id/quota", get(owner_quota))
        .route("/api/owners/:owner_id/quota/buckets", get(list_buckets))
        .route("/api/schedules/:id", get(get_schedule))
        .route("/api/executions", get(list_executions))
        .route("/api/executions/:id", get(get_execution))
        .route("/api/sync/tick", post(trigger_tick))
        .route("/api/sync/run", post(run_sync))
        .route("/api/housekeeping/tick", post(trigger_housekeeping))
        .layer(Extension(state))
}

pub async fn list_schedules(
    Extension(state): Extension<ApiState>,
    Path(owner_id): Path<i64>,
) -> AppResult<Json<Vec<Schedule>>> {
    let schedules = state.engine.schedules.list_for_owner(owner_id).await?;
    Ok(Json(schedules))
}

pub async fn get_schedule(
    Extension(state): Extension<ApiState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Schedule>> {
    state
        .engine
        .schedules
        .get(id)
        .await?
        .map(Json)
        .ok_or(AppError::NotFound)
}

#[derive(Debug, Serialize)]
pub struct QuotaOverview {
    pub owner_id: i64,
    pub plan: String,
    pub timezone: String,
    /// Plan limits as stored; `-1` means unlimited.
    pub daily_sync_limit: i64,
    pub monthly_sync_limit: i64,
    pub revenue_cap: i64,
    pub orders_cap: i64,
    pub daily: QuotaBucket,
    pub monthly: QuotaBucket,
    pub rolling_syncs: i64,
    /// Dispatched today and not yet settled.
    pub in_flight: i64,
    pub decision: QuotaDecision,
    pub remaining: DataBudget,
}

pub async fn owner_quota(
    Extension(state): Extension<ApiState>,
    Path(owner_id): Path<i64>,
) -> AppResult<Json<QuotaOverview>> {
    let engine = &state.engine;
    let now = engine.clock.now();
    let plan = engine
        .plans
        .plan_for_owner(owner_id, now)
        .await?
        .ok_or(AppError::NotFound)?;

    let usage = engine.enforcer.usage(owner_id, &plan, now).await?;
    let daily = Window::from(daily_window(now, plan.timezone));
    let monthly = Window::from(monthly_window(now, plan.timezone));
    let daily = engine
        .ledger
        .find(owner_id, Period::Daily, daily.start)
        .await?
        .unwrap_or_else(|| QuotaBucket::empty(owner_id, Period::Daily, daily, now));
    let monthly = engine
        .ledger
        .find(owner_id, Period::Monthly, monthly.start)
        .await?
        .unwrap_or_else(|| QuotaBucket::empty(owner_id, Period::Monthly, monthly, now));

    Ok(Json(QuotaOverview {
        owner_id,
        plan: plan.code.clone(),
        timezone: plan.timezone.name().to_string(),
        daily_sync_limit: limit_to_sentinel(plan.daily_sync_limit),
        monthly_sync_limit: limit_to_sentinel(plan.monthly_sync_limit),
        revenue_cap: limit_to_sentinel(plan.revenue_cap),
        orders_cap: limit_to_sentinel(plan.orders_cap),
        daily,
        monthly,
        rolling_syncs: usage.rolling_syncs,
        in_flight: usage.daily_in_flight,
        decision: QuotaEnforcer::evaluate(&plan, &usage),
        remaining: QuotaEnforcer::budget(&plan, &usage),
    }))
}

#[derive(Debug, Deserialize)]
pub struct BucketQuery {
    pub period: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_buckets(
    Extension(state): Extension<ApiState>,
    Path(owner_id): Path<i64>,
    Query(query): Query<BucketQuery>,
) -> AppResult<Json<Vec<QuotaBucket>>> {
    let period = match query.period.as_deref() {
        None => Period::Daily,
        Some(raw) => Period::parse(raw)
            .ok_or_else(|| AppError::BadRequest(format!("unknown period `{raw}`")))?,
    };
    let limit = query
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_BUCKET_LIMIT)
        .min(ExecutionFilter::MAX_LIMIT);
    let buckets = state.engine.ledger.list(owner_id, period, limit).await?;
    Ok(Json(buckets))
}

pub async fn get_execution(
    Extension(state): Extension<ApiState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ExecutionRecord>> {
    state
        .engine
        .executions
        .get(id)
        .await?
        .map(Json)
        .ok_or(AppError::NotFound)
}

#[derive(Debug, Deserialize)]
pub struct ExecutionQuery {
    pub owner_id: Option<i64>,
    pub status: Option<String>,
    pub schedule_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn list_executions(
    Extension(state): Extension<ApiState>,
    Query(query): Query<ExecutionQuery>,
) -> AppResult<Json<Vec<ExecutionRecord>>> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            ExecutionStatus::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("unknown status `{raw}`")))
        })
        .transpose()?;
    let filter = ExecutionFilter {
        owner_id: query.owner_id,
        status,
        schedule_id: query.schedule_id,
        from: query.from,
        to: query.to,
        limit: query.limit,
    };
    let records = state.engine.executions.query(&filter).await?;
    Ok(Json(records))
}

pub async fn trigger_tick(Extension(state): Extension<ApiState>) -> AppResult<Json<TickSummary>> {
    let summary = state.engine.process_tick(&state.queue).await?;
    Ok(Json(summary))
}

pub async fn run_sync(
    Extension(state): Extension<ApiState>,
    Json(request): Json<ManualRun>,
) -> AppResult<(StatusCode, Json<ExecutionRecord>)> {
    let record = state.engine.run_manual(request, &state.queue).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

pub async fn trigger_housekeeping(
    Extension(state): Extension<ApiState>,
) -> AppResult<Json<HousekeepingReport>> {
    let report = state.housekeeping.run().await?;
    Ok(Json(report))
}
