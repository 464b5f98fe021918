//! Redis dead letter store.
//!
//! Each namespace is one string key holding the JSON entry list, so several
//! processes can inspect the same dead letters.

use super::DeadLetterStore;
use crate::core::dead_letter::DeadLetterEntry;
use crate::error::{LaunchError, LaunchResult};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use std::time::Duration;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stores each namespace under `<prefix>:dead_letter:<namespace>`.
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis, e.g. `redis://localhost:6379`.
    pub async fn connect(connection_string: &str, key_prefix: impl Into<String>) -> LaunchResult<Self> {
        let client = Client::open(connection_string)?;
        let conn = timeout(CONNECT_TIMEOUT, client.get_connection_manager())
            .await
            .map_err(|e| LaunchError::QueueError {
                message: "Timed out connecting to Redis".to_string(),
                source: Some(Box::new(e)),
            })??;

        let key_prefix = key_prefix.into();
        tracing::info!("🗄️ Dead letter store connected to Redis (prefix {})", key_prefix);
        Ok(Self { conn, key_prefix })
    }

    fn key(&self, namespace: &str) -> String {
        format!("{}:dead_letter:{}", self.key_prefix, namespace)
    }
}

#[async_trait]
impl DeadLetterStore for RedisStore {
    async fn load(&self, namespace: &str) -> LaunchResult<Vec<DeadLetterEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key(namespace)).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, namespace: &str, entries: &[DeadLetterEntry]) -> LaunchResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(entries)?;
        let _: () = conn.set(self.key(namespace), json).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
