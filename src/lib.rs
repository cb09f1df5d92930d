pub mod api;
pub mod clock;
pub mod config;
pub mod connections;
pub mod error;
pub mod executions;
pub mod executor;
pub mod housekeeping;
pub mod memory;
pub mod orchestrator;
pub mod plans;
pub mod quota;
pub mod schedules;
pub mod store;
pub mod windows;

pub use clock::{Clock, ManualClock, SystemClock};
pub use orchestrator::{ManualRun, RetryPolicy, SyncEngine, SyncJob, TriggerError};
