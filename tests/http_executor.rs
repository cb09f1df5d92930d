mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use httpmock::prelude::*;
use serde_json::json;
use sync_engine::executions::{ExecutionStatus, ExecutionStore};
use sync_engine::executor::{HttpSyncExecutor, SyncError, SyncExecutor, SyncRequest};
use sync_engine::memory::MemoryStore;
use sync_engine::plans::SyncPlan;
use sync_engine::quota::DataBudget;
use sync_engine::schedules::SyncType;
use sync_engine::{ManualClock, ManualRun, SyncEngine};
use tokio::sync::mpsc::channel;
use uuid::Uuid;

use common::*;

fn request() -> SyncRequest {
    SyncRequest {
        execution_id: Uuid::new_v4(),
        owner_id: OWNER,
        network_id: NETWORK,
        sync_type: SyncType::Coupons,
        date_from: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        date_to: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
        connection: connection(OWNER, NETWORK),
        budget: DataBudget {
            revenue: Some(250),
            orders: None,
        },
    }
}

fn executor(server: &MockServer) -> HttpSyncExecutor {
    HttpSyncExecutor::new(
        server.base_url(),
        Some("executor-token".to_string()),
        Duration::from_secs(2),
    )
    .unwrap()
}

#[tokio::test]
async fn successful_sync_returns_reported_counts() {
    let server = MockServer::start_async().await;
    let sync_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/networks/7/sync")
            .header("authorization", "Bearer executor-token")
            .body_contains("\"syncType\":\"coupons\"")
            .body_contains("\"dateFrom\":\"2024-06-01\"")
            .body_contains("\"revenue\":250");
        then.status(200).json_body(json!({
            "success": true,
            "totalRecords": 9,
            "couponsCount": 9,
            "metadata": { "pages": 2 }
        }));
    });

    let stats = executor(&server).execute(&request()).await.unwrap();
    assert_eq!(stats.total_records, 9);
    assert_eq!(stats.coupons_count, 9);
    assert_eq!(stats.metadata["pages"], 2);
    sync_mock.assert();
}

#[tokio::test]
async fn status_codes_map_to_error_kinds() {
    let server = MockServer::start_async().await;
    let request = request();

    let mut unauthorized = server.mock(|when, then| {
        when.method(POST).path("/networks/7/sync");
        then.status(401).body("credentials revoked");
    });
    let err = executor(&server).execute(&request).await.unwrap_err();
    assert!(matches!(err, SyncError::AuthOrPermission(_)));
    unauthorized.delete();

    let mut unavailable = server.mock(|when, then| {
        when.method(POST).path("/networks/7/sync");
        then.status(503);
    });
    let err = executor(&server).execute(&request).await.unwrap_err();
    assert!(err.is_transient());
    unavailable.delete();

    server.mock(|when, then| {
        when.method(POST).path("/networks/7/sync");
        then.status(200).body("<html>oops</html>");
    });
    let err = executor(&server).execute(&request).await.unwrap_err();
    match err {
        SyncError::DataIntegrity { payload, .. } => assert_eq!(payload, "<html>oops</html>"),
        other => panic!("expected data integrity error, got {other:?}"),
    }
}

#[tokio::test]
async fn reported_failure_without_kind_is_classified_from_message() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/networks/7/sync");
        then.status(200)
            .json_body(json!({ "success": false, "message": "Invalid token for account" }));
    });

    let err = executor(&server).execute(&request()).await.unwrap_err();
    assert!(matches!(err, SyncError::AuthOrPermission(_)));
}

#[tokio::test]
async fn unreachable_executor_is_transient() {
    let executor =
        HttpSyncExecutor::new("http://127.0.0.1:1", None, Duration::from_millis(500)).unwrap();
    let err = executor.execute(&request()).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn engine_records_executor_reported_failures() {
    let server = MockServer::start_async().await;
    let sync_mock = server.mock(|when, then| {
        when.method(POST).path("/networks/7/sync");
        then.status(200).json_body(json!({
            "success": false,
            "message": "rate limited upstream",
            "errorKind": "transient"
        }));
    });

    let now = utc(2024, 6, 3, 10, 0);
    let store = Arc::new(MemoryStore::new());
    store.set_plan(OWNER, SyncPlan::unlimited("pro")).await;
    store.insert_connection(connection(OWNER, NETWORK)).await;
    let engine = SyncEngine::from_store(
        store.clone(),
        Arc::new(ManualClock::new(now)),
        Arc::new(executor(&server)),
        fast_retry(),
    );
    let (queue, mut jobs) = channel(4);

    let record = engine
        .run_manual(
            ManualRun {
                owner_id: OWNER,
                network_id: NETWORK,
                sync_type: SyncType::Purchases,
                date_from: None,
                date_to: None,
            },
            &queue,
        )
        .await
        .unwrap();
    let job = jobs.recv().await.unwrap();
    engine.run_sync_job(job).await.unwrap();

    let record = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.error_message.as_deref(), Some("transient executor failure: rate limited upstream"));
    sync_mock.assert_hits(3);
}
