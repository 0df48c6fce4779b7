//! Future registry
//!
//! Maps every outstanding task id to its promise. An id is present exactly
//! while its task is pending or running; resolution and cancellation remove
//! it. Operations on unknown ids are logged and otherwise ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::future::{Promise, TaskFuture};
use crate::protocol::TaskId;

/// Registry of outstanding futures
#[derive(Debug, Default)]
pub struct FutureRegistry {
    entries: Mutex<HashMap<TaskId, Promise>>,
}

impl FutureRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a fresh pending future for `id`
    pub fn register(self: &Arc<Self>, id: TaskId) -> TaskFuture {
        let promise = Promise::new();
        let future = promise.future(id, Arc::downgrade(self));
        if self.entries.lock().insert(id, promise).is_some() {
            warn!(task_id = %id, "Task id registered twice, replacing previous future");
        }
        future
    }

    /// Mark a pending task as running
    ///
    /// Returns `false` if the task was cancelled or is unknown, in which case
    /// it must not be dispatched.
    pub fn mark_running(&self, id: TaskId) -> bool {
        let entries = self.entries.lock();
        match entries.get(&id) {
            Some(promise) => promise.set_running(),
            None => false,
        }
    }

    /// Resolve and remove an outstanding task
    pub fn resolve(&self, id: TaskId, outcome: Result<Value, TaskError>) -> bool {
        let promise = self.entries.lock().remove(&id);
        match promise {
            Some(promise) => {
                debug!(task_id = %id, ok = outcome.is_ok(), "Resolving task");
                promise.finish(outcome)
            }
            None => {
                warn!(task_id = %id, "Resolve for unknown task ignored");
                false
            }
        }
    }

    /// Cancel a task that has not started yet
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&id) {
            Some(promise) if promise.is_pending() => {
                let cancelled = promise.cancel(false);
                entries.remove(&id);
                debug!(task_id = %id, "Cancelled queued task");
                cancelled
            }
            Some(_) => false,
            None => {
                warn!(task_id = %id, "Cancel for unknown task ignored");
                false
            }
        }
    }

    /// Cancel every task that has not started yet
    pub fn cancel_pending(&self) -> usize {
        let mut entries = self.entries.lock();
        let mut cancelled = 0;
        entries.retain(|_, promise| {
            if promise.cancel(false) {
                cancelled += 1;
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Cancel every outstanding task, running ones included
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Promise> = self.entries.lock().drain().map(|(_, p)| p).collect();
        drained
            .into_iter()
            .filter(|promise| promise.cancel(true))
            .count()
    }

    /// Ids of all outstanding tasks
    pub fn snapshot_ids(&self) -> HashSet<TaskId> {
        self.entries.lock().keys().copied().collect()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureState;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = FutureRegistry::new();
        let id = TaskId::new();
        let future = registry.register(id);
        assert_eq!(registry.len(), 1);

        assert!(registry.mark_running(id));
        assert!(registry.resolve(id, Ok(json!(1))));
        assert!(registry.is_empty());
        assert_eq!(future.result().await, Ok(json!(1)));
    }

    #[test]
    fn test_unknown_ids_are_no_ops() {
        let registry = FutureRegistry::new();
        let id = TaskId::new();
        assert!(!registry.resolve(id, Ok(json!(1))));
        assert!(!registry.cancel(id));
        assert!(!registry.mark_running(id));
    }

    #[test]
    fn test_future_cancel_removes_entry() {
        let registry = FutureRegistry::new();
        let id = TaskId::new();
        let future = registry.register(id);

        assert!(future.cancel());
        assert!(!registry.contains(id));
        assert!(!registry.mark_running(id));
    }

    #[test]
    fn test_running_task_survives_cancel() {
        let registry = FutureRegistry::new();
        let id = TaskId::new();
        let future = registry.register(id);
        registry.mark_running(id);

        assert!(!future.cancel());
        assert!(registry.contains(id));
    }

    #[test]
    fn test_cancel_pending_keeps_running() {
        let registry = FutureRegistry::new();
        let running = TaskId::new();
        let queued = TaskId::new();
        let running_future = registry.register(running);
        let queued_future = registry.register(queued);
        registry.mark_running(running);

        assert_eq!(registry.cancel_pending(), 1);
        assert_eq!(registry.snapshot_ids(), HashSet::from([running]));
        assert!(running_future.running());
        assert!(queued_future.cancelled());
    }

    #[test]
    fn test_cancel_all() {
        let registry = FutureRegistry::new();
        let a = TaskId::new();
        let b = TaskId::new();
        let fa = registry.register(a);
        let fb = registry.register(b);
        registry.mark_running(a);

        assert_eq!(registry.cancel_all(), 2);
        assert!(registry.is_empty());
        assert_eq!(fa.state(), FutureState::Cancelled);
        assert_eq!(fb.state(), FutureState::Cancelled);

        // late resolution from a killed worker is ignored
        assert!(!registry.resolve(a, Ok(json!(1))));
        assert!(fa.cancelled());
    }
}
