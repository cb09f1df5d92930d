use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An owner's link to one affiliate network. Credentials stay opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConnection {
    pub id: i64,
    pub owner_id: i64,
    pub network_id: i64,
    pub status: String,
    pub credentials: Value,
}

impl NetworkConnection {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// key: connection-resolver -> active network connection lookup (external)
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    /// The owner's active connection to `network_id`, if any.
    async fn active_connection(
        &self,
        owner_id: i64,
        network_id: i64,
    ) -> Result<Option<NetworkConnection>>;
}
