//! Worker handles and the worker-side server
//!
//! This module provides:
//! - [`WorkerHandle`] - broker-side view of one running worker
//! - [`ChannelWorker`] - the handle implementation shared by every backend
//! - [`WorkerUnit`] - the execution unit behind a handle (thread or process)
//! - [`serve`] - the loop a worker runs on its end of the channel
//!
//! # Lifecycle
//!
//! ```text
//! block-allocated:  start ─▶ idle ─▶ dispatch ─▶ busy ─▶ outcome ─▶ idle ─▶ ... ─▶ terminate
//! one-shot:         start ─▶ dispatch ─▶ busy ─▶ outcome ─▶ terminate
//! ```

mod handle;
mod server;

pub use handle::{ChannelWorker, WorkerUnit};
pub use server::{serve, serve_tcp};

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::duration_millis;
use crate::error::{RemoteError, WorkerError};
use crate::function::Call;
use crate::protocol::TaskId;

/// Result of one task as reported by a worker
pub type Outcome = Result<Value, RemoteError>;

/// Resource shape and startup options for one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Cores (MPI ranks / allocated CPUs) per worker
    pub cores: usize,

    /// Threads per core
    pub threads_per_core: usize,

    /// GPUs per worker
    pub gpus: usize,

    /// Allow more ranks than physical cores
    pub oversubscribe: bool,

    /// Working directory of the worker
    pub cwd: Option<PathBuf>,

    /// Initializer run once before the first task
    pub init_function: Option<Call>,

    /// Worker serves exactly one task
    pub one_shot: bool,

    /// How long a worker may take to come up
    #[serde(with = "duration_millis")]
    pub startup_timeout: Duration,

    /// How often background task results are collected
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for WorkerSpec {
    fn default() -> Self {
        Self {
            cores: 1,
            threads_per_core: 1,
            gpus: 0,
            oversubscribe: false,
            cwd: None,
            init_function: None,
            one_shot: false,
            startup_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Broker-side handle to one running worker
///
/// Handles are owned by exactly one broker slot; no two tasks are ever in
/// flight on the same handle.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Worker identifier, used in logs
    fn id(&self) -> &str;

    /// A task is in flight
    fn is_busy(&self) -> bool;

    /// Worker serves a single task
    fn is_one_shot(&self) -> bool;

    /// Send one task; only valid while idle
    async fn dispatch(&mut self, task_id: TaskId, call: &Call) -> Result<(), WorkerError>;

    /// Non-blocking check for the in-flight task's outcome
    fn poll_result(&mut self) -> Result<Option<Outcome>, WorkerError>;

    /// Wait for the in-flight task's outcome
    async fn next_result(&mut self) -> Result<Outcome, WorkerError>;

    /// Start a task in the background on the worker
    ///
    /// Returns once the worker has accepted it; the handle stays idle.
    async fn submit(&mut self, task_id: TaskId, call: &Call) -> Result<(), WorkerError>;

    /// Collect finished background tasks among `task_ids`
    ///
    /// Each result is returned once; unfinished ids are left out.
    async fn update(
        &mut self,
        task_ids: &[TaskId],
    ) -> Result<HashMap<TaskId, Outcome>, WorkerError>;

    /// Shut the worker down
    ///
    /// With `wait`, an in-flight task is allowed to finish and the worker
    /// exits through the protocol. Without it, the unit is torn down at once.
    async fn terminate(&mut self, wait: bool);
}
