#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::mpsc::{channel, Receiver, Sender};

use sync_engine::connections::NetworkConnection;
use sync_engine::executor::{SyncError, SyncExecutor, SyncRequest, SyncStats};
use sync_engine::memory::MemoryStore;
use sync_engine::plans::{AllowedWindow, SyncPlan};
use sync_engine::{ManualClock, RetryPolicy, SyncEngine, SyncJob};

pub const OWNER: i64 = 41;
pub const NETWORK: i64 = 7;

pub fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

pub fn time(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

pub fn business_hours_plan() -> SyncPlan {
    let mut plan = SyncPlan::unlimited("pro");
    plan.allowed_window = Some(AllowedWindow::new(time(9, 0), time(18, 0)));
    plan
}

pub fn connection(owner_id: i64, network_id: i64) -> NetworkConnection {
    NetworkConnection {
        id: owner_id * 1000 + network_id,
        owner_id,
        network_id,
        status: "active".to_string(),
        credentials: json!({ "token": "secret" }),
    }
}

pub fn stats(records: i64) -> SyncStats {
    SyncStats {
        total_records: records,
        campaigns_count: 0,
        coupons_count: records,
        purchases_count: 0,
        revenue_count: None,
        orders_count: None,
        metadata: json!({ "pages": 1 }),
    }
}

/// Executor answering from a script; succeeds with one record once the script runs out.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<SyncStats, SyncError>>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<SyncRequest>>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Result<SyncStats, SyncError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SyncRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncExecutor for ScriptedExecutor {
    async fn execute(&self, request: &SyncRequest) -> Result<SyncStats, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(stats(1)))
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        attempt_timeout: Duration::from_millis(200),
        backoff: Duration::from_millis(1),
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: ManualClock,
    pub executor: Arc<ScriptedExecutor>,
    pub engine: SyncEngine,
    pub queue: Sender<SyncJob>,
    pub jobs: Receiver<SyncJob>,
}

impl Harness {
    pub async fn new(now: DateTime<Utc>, executor: ScriptedExecutor) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(now);
        let executor = Arc::new(executor);
        let engine = SyncEngine::from_store(
            store.clone(),
            Arc::new(clock.clone()),
            executor.clone(),
            fast_retry(),
        );
        let (queue, jobs) = channel(64);
        Self {
            store,
            clock,
            executor,
            engine,
            queue,
            jobs,
        }
    }

    /// Owner with an active plan and a connection to `NETWORK`.
    pub async fn with_owner(now: DateTime<Utc>, plan: SyncPlan, executor: ScriptedExecutor) -> Self {
        let harness = Self::new(now, executor).await;
        harness.store.set_plan(OWNER, plan).await;
        harness
            .store
            .insert_connection(connection(OWNER, NETWORK))
            .await;
        harness
    }

    pub fn queued(&mut self) -> Vec<SyncJob> {
        let mut jobs = Vec::new();
        while let Ok(job) = self.jobs.try_recv() {
            jobs.push(job);
        }
        jobs
    }

    /// Runs every queued job to completion on the calling task.
    pub async fn drain(&mut self) -> usize {
        let jobs = self.queued();
        for job in &jobs {
            self.engine.run_sync_job(*job).await.unwrap();
        }
        jobs.len()
    }
}
