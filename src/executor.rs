use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::connections::NetworkConnection;
use crate::quota::DataBudget;
use crate::schedules::SyncType;

/// key: sync-executor-request -> what to pull and how much may be pulled
#[derive(Debug, Clone, Serialize)]
pub struct SyncRequest {
    pub execution_id: Uuid,
    pub owner_id: i64,
    pub network_id: i64,
    pub sync_type: SyncType,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub connection: NetworkConnection,
    pub budget: DataBudget,
}

/// Counts reported by a successful sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_records: i64,
    pub campaigns_count: i64,
    pub coupons_count: i64,
    pub purchases_count: i64,
    /// Revenue units pulled; purchases stand in when the executor does not say.
    pub revenue_count: Option<i64>,
    /// Order units pulled; purchases stand in when the executor does not say.
    pub orders_count: Option<i64>,
    pub metadata: Value,
}

impl SyncStats {
    pub fn revenue_units(&self) -> i64 {
        self.revenue_count.unwrap_or(self.purchases_count).max(0)
    }

    pub fn order_units(&self) -> i64 {
        self.orders_count.unwrap_or(self.purchases_count).max(0)
    }
}

/// Executor failure taxonomy. Only `Transient` and `Timeout` are retried.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("transient executor failure: {0}")]
    Transient(String),
    #[error("connection rejected: {0}")]
    AuthOrPermission(String),
    #[error("unexpected executor result: {message}")]
    DataIntegrity { message: String, payload: Value },
    #[error("sync attempt timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::Timeout(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Transient(_) => "transient",
            SyncError::AuthOrPermission(_) => "auth",
            SyncError::DataIntegrity { .. } => "data_integrity",
            SyncError::Timeout(_) => "timeout",
        }
    }

    /// Raw payload kept for diagnosis, if any.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            SyncError::DataIntegrity { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

/// key: sync-executor -> network-specific fetch (external collaborator)
#[async_trait]
pub trait SyncExecutor: Send + Sync {
    async fn execute(&self, request: &SyncRequest) -> Result<SyncStats, SyncError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutorSuccess {
    total_records: i64,
    #[serde(default)]
    campaigns_count: i64,
    #[serde(default)]
    coupons_count: i64,
    #[serde(default)]
    purchases_count: i64,
    #[serde(default)]
    revenue_count: Option<i64>,
    #[serde(default)]
    orders_count: Option<i64>,
    #[serde(default)]
    metadata: Option<Value>,
}

const AUTH_MARKERS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "revoked",
    "invalid token",
    "invalid credentials",
    "permission",
    "expired token",
];

/// Classifies a failure message that came without an explicit kind.
pub fn infer_error_kind(message: &str) -> &'static str {
    let normalized = message.to_ascii_lowercase();
    if AUTH_MARKERS.iter().any(|marker| normalized.contains(marker)) {
        "auth"
    } else {
        "transient"
    }
}

/// Interprets an executor result document
/// (`{success: true, totalRecords, ...}` or `{success: false, message, errorKind?}`).
pub fn parse_executor_response(payload: Value) -> Result<SyncStats, SyncError> {
    let Some(success) = payload.get("success").and_then(Value::as_bool) else {
        return Err(SyncError::DataIntegrity {
            message: "executor result is missing `success`".to_string(),
            payload,
        });
    };

    if !success {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("executor reported failure without a message")
            .to_string();
        let kind = payload
            .get("errorKind")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| infer_error_kind(&message).to_string());
        return Err(match kind.as_str() {
            "auth" | "permission" | "connection_revoked" => SyncError::AuthOrPermission(message),
            "data_integrity" => SyncError::DataIntegrity { message, payload },
            _ => SyncError::Transient(message),
        });
    }

    match serde_json::from_value::<ExecutorSuccess>(payload.clone()) {
        Ok(body) => {
            let counts = [
                body.total_records,
                body.campaigns_count,
                body.coupons_count,
                body.purchases_count,
            ];
            if counts.iter().any(|count| *count < 0) {
                return Err(SyncError::DataIntegrity {
                    message: "executor reported negative counts".to_string(),
                    payload,
                });
            }
            Ok(SyncStats {
                total_records: body.total_records,
                campaigns_count: body.campaigns_count,
                coupons_count: body.coupons_count,
                purchases_count: body.purchases_count,
                revenue_count: body.revenue_count,
                orders_count: body.orders_count,
                metadata: body.metadata.unwrap_or_else(|| json!({})),
            })
        }
        Err(err) => Err(SyncError::DataIntegrity {
            message: format!("malformed executor result: {err}"),
            payload,
        }),
    }
}

/// key: sync-executor-http -> executor deployed as its own service
pub struct HttpSyncExecutor {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpSyncExecutor {
    /// `request_timeout` should not undercut the orchestrator's per-attempt timeout.
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build sync executor client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            auth_token,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth_token {
            request.bearer_auth(token)
        } else {
            request
        }
    }
}

#[async_trait]
impl SyncExecutor for HttpSyncExecutor {
    async fn execute(&self, request: &SyncRequest) -> Result<SyncStats, SyncError> {
        let body = json!({
            "executionId": request.execution_id,
            "ownerId": request.owner_id,
            "networkId": request.network_id,
            "syncType": request.sync_type.as_str(),
            "dateFrom": request.date_from.to_string(),
            "dateTo": request.date_to.to_string(),
            "connection": request.connection,
            "budget": {
                "revenue": request.budget.revenue,
                "orders": request.budget.orders,
            },
        });

        let response = self
            .auth(self.client.post(self.endpoint(&format!(
                "networks/{}/sync",
                request.network_id
            ))))
            .json(&body)
            .send()
            .await
            .map_err(|err| SyncError::Transient(format!("executor unreachable: {err}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| SyncError::Transient(format!("executor response interrupted: {err}")))?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(SyncError::AuthOrPermission(format!(
                "executor returned {status}: {text}"
            )));
        }
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            return Err(SyncError::Transient(format!(
                "executor returned {status}: {text}"
            )));
        }

        let payload: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                return Err(SyncError::DataIntegrity {
                    message: format!("executor returned non-JSON body ({status}): {err}"),
                    payload: Value::String(text),
                })
            }
        };

        if !status.is_success() {
            return Err(SyncError::DataIntegrity {
                message: format!("executor rejected request with {status}"),
                payload,
            });
        }

        parse_executor_response(payload)
    }
}
