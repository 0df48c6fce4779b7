//! Broker ↔ worker wire messages
//!
//! Messages are tagged enums, JSON-encoded into opaque frames. The channel
//! only sees bytes; both sides decode with exhaustive matching.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{RemoteError, TransportError};
use crate::function::Call;

/// Opaque task identifier, time-ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Messages sent from the broker to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Run the initializer once, before any task
    Init { call: Call },

    /// Run a task and reply with its outcome
    Task { task_id: TaskId, call: Call },

    /// Start a task in the background and acknowledge immediately
    Submit { task_id: TaskId, call: Call },

    /// Collect finished background tasks among `task_ids`
    Update { task_ids: Vec<TaskId> },

    /// Exit the worker loop
    Close,
}

/// Messages sent from a worker back to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Successful outcome
    Result { value: Value },

    /// Failed outcome
    Error { error: RemoteError },

    /// Background task accepted
    Submitted { task_id: TaskId },

    /// Finished background tasks, each fetched exactly once
    Updated {
        results: HashMap<TaskId, Result<Value, RemoteError>>,
    },
}

impl WorkerResponse {
    /// Build the response for a task outcome
    pub fn from_outcome(outcome: Result<Value, RemoteError>) -> Self {
        match outcome {
            Ok(value) => Self::Result { value },
            Err(error) => Self::Error { error },
        }
    }

    /// Interpret this response as a task outcome
    pub fn into_outcome(self) -> Result<Result<Value, RemoteError>, TransportError> {
        match self {
            Self::Result { value } => Ok(Ok(value)),
            Self::Error { error } => Ok(Err(error)),
            other => Err(TransportError::Protocol(format!(
                "expected a task outcome, got {:?}",
                other
            ))),
        }
    }
}

/// Encode a message into a frame payload
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, TransportError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decode a frame payload
pub fn decode<T: for<'de> Deserialize<'de>>(frame: &[u8]) -> Result<T, TransportError> {
    Ok(serde_json::from_slice(frame)?)
}
