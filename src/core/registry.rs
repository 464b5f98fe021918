//! Operation registry used to rehydrate persisted tasks.
//!
//! Dead-lettered tasks are persisted as [`TaskSnapshot`]s, which carry a
//! `task_type` but no code. Registering an operation under that type makes
//! such tasks runnable again after a restart.
//!
//! The registry is an ordinary value owned by the runtime and handed to the
//! components that need it; there is no process-wide instance.

use crate::error::{LaunchError, LaunchResult};
use crate::task::{FnOperation, Task, TaskContext, TaskOperation, TaskSnapshot};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Maps task type names to operations.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: Arc<RwLock<HashMap<String, Arc<dyn TaskOperation>>>>,
}

impl OperationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the operation for a task type.
    pub async fn register(&self, task_type: impl Into<String>, operation: Arc<dyn TaskOperation>) {
        let task_type = task_type.into();
        tracing::debug!("📒 Registered operation for task type '{}'", task_type);
        self.operations.write().await.insert(task_type, operation);
    }

    /// Register an async closure for a task type.
    pub async fn register_fn<F, Fut>(&self, task_type: impl Into<String>, f: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LaunchResult<Value>> + Send + 'static,
    {
        self.register(task_type, Arc::new(FnOperation::new(f))).await;
    }

    /// Remove a task type. Returns whether it was registered.
    pub async fn unregister(&self, task_type: &str) -> bool {
        self.operations.write().await.remove(task_type).is_some()
    }

    /// Operation registered for a task type.
    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn TaskOperation>> {
        self.operations.read().await.get(task_type).cloned()
    }

    /// Whether a task type is registered.
    pub async fn is_registered(&self, task_type: &str) -> bool {
        self.operations.read().await.contains_key(task_type)
    }

    /// All registered task types, sorted.
    pub async fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.operations.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Build a runnable task from a snapshot.
    pub async fn rehydrate(&self, snapshot: TaskSnapshot) -> LaunchResult<Task> {
        let operation = self
            .get(&snapshot.task_type)
            .await
            .ok_or_else(|| LaunchError::TaskNotFound {
                task_id: snapshot.task_type.clone(),
            })?;
        Ok(Task::from_snapshot(snapshot, operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_register_and_rehydrate() {
        let registry = OperationRegistry::new();
        registry
            .register_fn("double", |ctx| async move {
                let n = ctx.payload.as_i64().unwrap_or(0);
                Ok(json!(n * 2))
            })
            .await;

        assert!(registry.is_registered("double").await);
        assert_eq!(registry.registered_types().await, vec!["double".to_string()]);

        let original = Task::from_fn(|_| async { Ok(Value::Null) })
            .with_type("double")
            .with_payload(json!(21));
        let task = registry.rehydrate(original.snapshot()).await.unwrap();

        let value = task
            .operation()
            .run(task.context(CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(value, json!(42));
    }

    #[tokio::test]
    async fn test_unknown_type_is_not_found() {
        let registry = OperationRegistry::new();
        let snapshot = Task::from_fn(|_| async { Ok(Value::Null) })
            .with_type("missing")
            .snapshot();

        let result = registry.rehydrate(snapshot).await;
        assert!(matches!(result, Err(LaunchError::TaskNotFound { .. })));
        assert!(!registry.unregister("missing").await);
    }
}
