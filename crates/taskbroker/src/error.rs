//! Error taxonomy
//!
//! Configuration and launch errors surface from `Pool::start`. Remote and
//! transport errors only surface when a caller reads a task's future.

use serde::{Deserialize, Serialize};

/// Invalid pool setup, raised before any worker starts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// A count that must be at least one was zero
    #[error("{field} must be at least 1")]
    ZeroCount { field: &'static str },

    /// Backend only runs one thread per core
    #[error(
        "the {backend} backend only supports threads_per_core=1, got threads_per_core={requested}"
    )]
    ThreadsNotSupported {
        backend: &'static str,
        requested: usize,
    },

    /// Backend cannot assign GPUs
    #[error("the {backend} backend does not support GPU assignment, got gpus_per_worker={requested}")]
    GpusNotSupported {
        backend: &'static str,
        requested: usize,
    },

    /// Backend cannot oversubscribe cores
    #[error("the {backend} backend does not support oversubscribe=true")]
    OversubscribeNotSupported { backend: &'static str },

    /// Initializer requested for workers that are not block allocated
    #[error("init_function requires block_allocation=true")]
    InitWithoutBlockAllocation,

    /// Local-thread backend started without functions to run
    #[error("the local-thread backend requires a function registry")]
    MissingFunctions,

    /// Process backend started without a worker command
    #[error("the {backend} backend requires a worker command")]
    MissingWorkerCommand { backend: &'static str },

    /// Environment variable could not be parsed
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

/// Worker unit failed to start
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    /// Spawning the thread or process failed
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// Worker did not connect within the startup timeout
    #[error("worker did not connect within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Worker initializer raised
    #[error("worker initializer failed: {0}")]
    Initializer(RemoteError),

    /// Transport failed during the startup handshake
    #[error("worker handshake failed: {0}")]
    Handshake(#[from] TransportError),
}

/// Broken or closed channel
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Peer closed the channel
    #[error("channel closed")]
    Closed,

    /// Socket I/O failed
    #[error("channel i/o error: {0}")]
    Io(String),

    /// Payload could not be encoded or decoded
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Worker handle misuse or failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// Dispatch attempted while a task is in flight
    #[error("worker {0} is busy")]
    Busy(String),

    /// Result requested while no task is in flight
    #[error("worker {0} is idle")]
    Idle(String),

    /// Channel failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error raised by a user function on the worker, preserved across the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// Error type name, e.g. `ValueError`
    pub kind: String,
    /// Error message
    pub message: String,
}

impl RemoteError {
    /// Create a remote error of the given kind
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new("RuntimeError", message)
    }

    /// Check the error kind
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// What a task future resolves to when it does not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// User function raised on the worker
    #[error("remote execution failed: {0}")]
    Remote(RemoteError),

    /// Channel broke while the task was in flight
    #[error("transport failed: {0}")]
    Transport(TransportError),

    /// No worker could be started for the task
    #[error("worker launch failed: {0}")]
    Launch(LaunchError),

    /// Future was cancelled before or during execution
    #[error("task was cancelled")]
    Cancelled,
}

impl TaskError {
    /// The remote error, if the task failed on the worker
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors returned by pool and broker operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A worker failed to start
    #[error("launch error: {0}")]
    Launch(#[from] LaunchError),

    /// Pool no longer accepts submissions
    #[error("pool is shut down")]
    ShutDown,

    /// Dispatch loop exited unexpectedly
    #[error("dispatch loop failed: {0}")]
    DispatchLoop(String),

    /// A task failed inside a scoped block
    #[error(transparent)]
    Task(#[from] TaskError),
}
