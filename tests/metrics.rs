mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use sync_engine::api::{self, ApiState};
use sync_engine::housekeeping::{Housekeeping, RetentionPolicy};
use sync_engine::plans::SyncPlan;
use tower::ServiceExt;

use common::*;

#[tokio::test]
async fn api_requests_show_up_in_metrics() {
    let harness = Harness::with_owner(
        utc(2024, 6, 3, 10, 0),
        SyncPlan::unlimited("pro"),
        ScriptedExecutor::default(),
    )
    .await;
    let (layer, handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/metrics", get(move || async move { handle.render() }))
        .merge(api::router(ApiState {
            engine: harness.engine.clone(),
            queue: harness.queue.clone(),
            housekeeping: Housekeeping::new(&harness.engine, RetentionPolicy::default()),
        }))
        .layer(layer);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/owners/{OWNER}/quota"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("axum_http_requests_total"));
}
