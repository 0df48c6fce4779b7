//! Caller-held task futures
//!
//! A [`TaskFuture`] moves through `Pending → Running → Finished | Cancelled`.
//! The broker holds the matching [`Promise`] only while the task is
//! outstanding; every transition goes through a `watch` channel so any
//! number of clones can wait on it.

use std::future::IntoFuture;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::TaskError;
use crate::protocol::TaskId;
use crate::registry::FutureRegistry;

/// Observable state of a task
#[derive(Debug, Clone, PartialEq)]
pub enum FutureState {
    /// Queued, not yet handed to a worker
    Pending,
    /// Dispatched to a worker
    Running,
    /// Resolved with a value or an error
    Finished(Result<Value, TaskError>),
    /// Cancelled before or during execution
    Cancelled,
}

impl FutureState {
    /// Whether the state is terminal
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Finished(_) | Self::Cancelled)
    }
}

/// Broker-side half of a future
#[derive(Debug, Clone)]
pub(crate) struct Promise {
    state: Arc<watch::Sender<FutureState>>,
}

impl Promise {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(FutureState::Pending);
        Self {
            state: Arc::new(state),
        }
    }

    pub(crate) fn future(&self, id: TaskId, registry: Weak<FutureRegistry>) -> TaskFuture {
        TaskFuture {
            id,
            state: Arc::clone(&self.state),
            registry,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), FutureState::Pending)
    }

    /// Pending → Running
    pub(crate) fn set_running(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, FutureState::Pending) {
                *state = FutureState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Pending | Running → Finished
    pub(crate) fn finish(&self, outcome: Result<Value, TaskError>) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_done() {
                false
            } else {
                *state = FutureState::Finished(outcome);
                true
            }
        })
    }

    /// Pending (and Running, if `include_running`) → Cancelled
    pub(crate) fn cancel(&self, include_running: bool) -> bool {
        self.state.send_if_modified(|state| match state {
            FutureState::Pending => {
                *state = FutureState::Cancelled;
                true
            }
            FutureState::Running if include_running => {
                *state = FutureState::Cancelled;
                true
            }
            _ => false,
        })
    }
}

/// Eventual outcome of a submitted task
///
/// Cloning is cheap; every clone observes the same state.
///
/// # Example
///
/// ```ignore
/// let future = pool.submit(Call::new("square").arg(4))?;
/// assert_eq!(future.result().await?, json!(16));
/// ```
#[derive(Debug, Clone)]
pub struct TaskFuture {
    id: TaskId,
    state: Arc<watch::Sender<FutureState>>,
    registry: Weak<FutureRegistry>,
}

impl TaskFuture {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Snapshot of the current state
    pub fn state(&self) -> FutureState {
        self.state.borrow().clone()
    }

    /// Finished or cancelled
    pub fn done(&self) -> bool {
        self.state.borrow().is_done()
    }

    pub fn running(&self) -> bool {
        matches!(*self.state.borrow(), FutureState::Running)
    }

    pub fn cancelled(&self) -> bool {
        matches!(*self.state.borrow(), FutureState::Cancelled)
    }

    /// Cancel the task if it has not started yet
    ///
    /// Returns `true` if the future is cancelled after the call. A task that
    /// is already running or finished cannot be cancelled this way.
    pub fn cancel(&self) -> bool {
        if self.done() {
            return self.cancelled();
        }
        match self.registry.upgrade() {
            Some(registry) => registry.cancel(self.id),
            None => Promise {
                state: Arc::clone(&self.state),
            }
            .cancel(false),
        }
    }

    /// Wait for the outcome
    pub async fn result(&self) -> Result<Value, TaskError> {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(FutureState::is_done).await {
            Ok(state) => state.clone(),
            Err(_) => FutureState::Cancelled,
        };
        match state {
            FutureState::Finished(outcome) => outcome,
            _ => Err(TaskError::Cancelled),
        }
    }

    /// Block the current thread until the outcome is available
    ///
    /// Must not be called from inside an async task; use [`TaskFuture::result`]
    /// there.
    pub fn blocking_result(&self) -> Result<Value, TaskError> {
        futures::executor::block_on(self.result())
    }

    /// The outcome if already available
    pub fn try_result(&self) -> Option<Result<Value, TaskError>> {
        match &*self.state.borrow() {
            FutureState::Finished(outcome) => Some(outcome.clone()),
            FutureState::Cancelled => Some(Err(TaskError::Cancelled)),
            _ => None,
        }
    }
}

impl IntoFuture for TaskFuture {
    type Output = Result<Value, TaskError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.result().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use serde_json::json;
    use std::time::Duration;

    fn detached() -> (Promise, TaskFuture) {
        let promise = Promise::new();
        let future = promise.future(TaskId::new(), Weak::new());
        (promise, future)
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (promise, future) = detached();
        assert_eq!(future.state(), FutureState::Pending);

        assert!(promise.set_running());
        assert!(future.running());
        assert!(!promise.set_running());

        assert!(promise.finish(Ok(json!(4))));
        assert!(future.done());
        assert_eq!(future.result().await, Ok(json!(4)));

        // terminal states never change
        assert!(!promise.finish(Ok(json!(5))));
        assert!(!promise.cancel(true));
        assert_eq!(future.try_result(), Some(Ok(json!(4))));
    }

    #[tokio::test]
    async fn test_result_waits_for_resolution() {
        let (promise, future) = detached();
        let waiter = tokio::spawn({
            let future = future.clone();
            async move { future.result().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        promise.finish(Err(TaskError::Remote(RemoteError::value_error("bad"))));
        let outcome = waiter.await.unwrap();
        assert_eq!(
            outcome.unwrap_err().remote(),
            Some(&RemoteError::value_error("bad"))
        );
    }

    #[tokio::test]
    async fn test_cancel_only_before_running() {
        let (promise, future) = detached();
        promise.set_running();
        assert!(!future.cancel());
        assert!(future.running());

        let (_promise, queued) = detached();
        assert!(queued.cancel());
        assert!(queued.cancelled());
        assert_eq!(queued.result().await, Err(TaskError::Cancelled));
    }

    #[tokio::test]
    async fn test_forced_cancel_of_running_task() {
        let (promise, future) = detached();
        promise.set_running();
        assert!(promise.cancel(true));
        assert_eq!(future.await, Err(TaskError::Cancelled));
    }

    #[test]
    fn test_blocking_result() {
        let (promise, future) = detached();
        let handle = std::thread::spawn(move || future.blocking_result());
        promise.finish(Ok(json!("done")));
        assert_eq!(handle.join().unwrap(), Ok(json!("done")));
    }
}
