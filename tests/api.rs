mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use sync_engine::api::{router, ApiState};
use sync_engine::housekeeping::{Housekeeping, RetentionPolicy};
use sync_engine::plans::SyncPlan;
use sync_engine::schedules::{Schedule, SyncType};
use tower::ServiceExt; // for `oneshot`

use common::*;

fn app(harness: &Harness) -> Router {
    router(ApiState {
        engine: harness.engine.clone(),
        queue: harness.queue.clone(),
        housekeeping: Housekeeping::new(&harness.engine, RetentionPolicy::default()),
    })
}

async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn lists_owner_schedules_and_fetches_one() {
    let now = utc(2024, 6, 3, 10, 0);
    let harness =
        Harness::with_owner(now, SyncPlan::unlimited("pro"), ScriptedExecutor::default()).await;
    let schedule = Schedule::new(OWNER, vec![NETWORK], SyncType::Coupons, 60, 4, now);
    harness.store.insert_schedule(schedule.clone()).await;

    let (status, body) = call(app(&harness), get(&format!("/api/owners/{OWNER}/schedules"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["sync_type"], "coupons");

    let (status, body) = call(app(&harness), get(&format!("/api/schedules/{}", schedule.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max_runs_per_day"], 4);

    let (status, body) = call(
        app(&harness),
        get(&format!("/api/schedules/{}", uuid::Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not found");
}

#[tokio::test]
async fn manual_run_is_accepted_and_queryable() {
    let now = utc(2024, 6, 3, 10, 0);
    let mut harness =
        Harness::with_owner(now, SyncPlan::unlimited("pro"), ScriptedExecutor::default()).await;

    let (status, record) = call(
        app(&harness),
        post(
            "/api/sync/run",
            json!({ "ownerId": OWNER, "networkId": NETWORK, "syncType": "campaigns" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(record["status"], "pending");
    assert_eq!(harness.queued().len(), 1);

    let id = record["id"].as_str().unwrap().to_string();
    let (status, fetched) = call(app(&harness), get(&format!("/api/executions/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["sync_type"], "campaigns");

    let (status, listed) = call(
        app(&harness),
        get(&format!("/api/executions?owner_id={OWNER}&status=pending")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, listed) = call(app(&harness), get("/api/executions?status=completed")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn trigger_errors_map_to_status_codes() {
    let now = utc(2024, 6, 3, 10, 0);
    let mut plan = SyncPlan::unlimited("frozen");
    plan.daily_sync_limit = Some(0);
    let harness = Harness::with_owner(now, plan, ScriptedExecutor::default()).await;

    let (status, body) = call(
        app(&harness),
        post(
            "/api/sync/run",
            json!({ "ownerId": OWNER, "networkId": NETWORK, "syncType": "all" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("daily sync limit"));

    let (status, _) = call(
        app(&harness),
        post(
            "/api/sync/run",
            json!({ "ownerId": OWNER, "networkId": 99, "syncType": "all" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(
        app(&harness),
        post(
            "/api/sync/run",
            json!({
                "ownerId": OWNER,
                "networkId": NETWORK,
                "syncType": "all",
                "dateFrom": "2024-06-03",
                "dateTo": "2024-06-01"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(app(&harness), get("/api/executions?status=bogus")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn quota_overview_reports_usage_and_decision() {
    let now = utc(2024, 6, 3, 10, 0);
    let mut plan = SyncPlan::unlimited("growth");
    plan.daily_sync_limit = Some(10);
    plan.revenue_cap = Some(500);
    let mut harness = Harness::with_owner(now, plan, ScriptedExecutor::default()).await;
    harness
        .engine
        .run_manual(
            sync_engine::ManualRun {
                owner_id: OWNER,
                network_id: NETWORK,
                sync_type: SyncType::All,
                date_from: None,
                date_to: None,
            },
            &harness.queue,
        )
        .await
        .unwrap();
    harness.drain().await;

    let (status, body) = call(app(&harness), get(&format!("/api/owners/{OWNER}/quota"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"], "growth");
    assert_eq!(body["timezone"], "UTC");
    assert_eq!(body["daily_sync_limit"], 10);
    assert_eq!(body["monthly_sync_limit"], -1);
    assert_eq!(body["daily"]["sync_count"], 1);
    assert_eq!(body["monthly"]["sync_count"], 1);
    assert_eq!(body["decision"]["allowed"], true);
    assert_eq!(body["remaining"]["revenue"], 500);
    assert_eq!(body["remaining"]["orders"], Value::Null);

    let (status, _) = call(app(&harness), get("/api/owners/5/quota")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, buckets) = call(
        app(&harness),
        get(&format!("/api/owners/{OWNER}/quota/buckets?period=monthly")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(buckets.as_array().unwrap().len(), 1);

    let (status, _) = call(
        app(&harness),
        get(&format!("/api/owners/{OWNER}/quota/buckets?period=weekly")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn tick_and_housekeeping_endpoints_report_summaries() {
    let now = utc(2024, 6, 3, 10, 0);
    let harness =
        Harness::with_owner(now, SyncPlan::unlimited("pro"), ScriptedExecutor::default()).await;
    harness
        .store
        .insert_schedule(Schedule::new(OWNER, vec![NETWORK], SyncType::All, 60, 4, now))
        .await;

    let (status, tick) = call(app(&harness), post("/api/sync/tick", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tick["due"], 1);
    assert_eq!(tick["dispatched"], 1);

    let (status, report) = call(app(&harness), post("/api/housekeeping/tick", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["daily_reset"]["owners"], 1);
    assert_eq!(report["rotation"]["owners"], 1);
}
