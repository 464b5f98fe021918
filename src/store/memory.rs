use super::DeadLetterStore;
use crate::core::dead_letter::DeadLetterEntry;
use crate::error::LaunchResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-local store. Clones share the same contents, so a test can keep
/// a handle and inspect what the dead letter queue saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    namespaces: Arc<Mutex<HashMap<String, Vec<DeadLetterEntry>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries saved under `namespace`.
    pub fn len(&self, namespace: &str) -> usize {
        self.namespaces.lock().get(namespace).map_or(0, Vec::len)
    }
}

#[async_trait]
impl DeadLetterStore for MemoryStore {
    async fn load(&self, namespace: &str) -> LaunchResult<Vec<DeadLetterEntry>> {
        Ok(self.namespaces.lock().get(namespace).cloned().unwrap_or_default())
    }

    async fn save(&self, namespace: &str, entries: &[DeadLetterEntry]) -> LaunchResult<()> {
        self.namespaces
            .lock()
            .insert(namespace.to_string(), entries.to_vec());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
