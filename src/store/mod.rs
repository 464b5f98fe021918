//! Dead letter persistence.
//!
//! The dead letter queue is the only durable component. It saves its full
//! entry list under a namespace after every change and reloads it on start.
//! Three stores are available:
//!
//! - [`FileStore`]: one JSON file per namespace (default)
//! - [`MemoryStore`]: process-local, for tests and embedders
//! - `RedisStore`: one key per namespace (feature `redis-store`)

use crate::core::dead_letter::DeadLetterEntry;
use crate::error::LaunchResult;
use async_trait::async_trait;

pub mod file;
pub mod memory;

#[cfg(feature = "redis-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-store")))]
pub mod redis;

pub use file::FileStore;
pub use memory::MemoryStore;

#[cfg(feature = "redis-store")]
pub use self::redis::RedisStore;

/// Snapshot storage for dead letter entries.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Load the entries saved under `namespace`. A namespace that was never
    /// saved yields an empty list.
    async fn load(&self, namespace: &str) -> LaunchResult<Vec<DeadLetterEntry>>;

    /// Replace the entries saved under `namespace`.
    async fn save(&self, namespace: &str, entries: &[DeadLetterEntry]) -> LaunchResult<()>;

    /// Short store name for logs.
    fn name(&self) -> &'static str;
}
