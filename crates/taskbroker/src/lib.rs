//! # Task Broker
//!
//! A lightweight broker that dispatches named function calls to a pool of
//! worker units (local threads, MPI ranks, queuing-system allocations) and
//! hands back futures for their results.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Pool                               │
//! │  (validates config against backend, submit / map / scope)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TaskBroker                             │
//! │  FIFO queue ─▶ dispatch loop ─▶ worker slots                │
//! │  FutureRegistry (task id ─▶ promise)                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 WorkerHandle (via Launcher)                  │
//! │  Channel: in-memory queue pair or length-delimited TCP      │
//! │  Worker side: protocol server + FunctionRegistry            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use taskbroker::prelude::*;
//!
//! let functions = FunctionRegistry::new();
//! functions.register("square", |args| {
//!     let x: i64 = args.get(0, "x")?;
//!     Ok(json!(x * x))
//! });
//!
//! let config = PoolConfig::new(BackendKind::LocalThread).with_max_workers(2);
//! let squares: Vec<_> = Pool::scope(config, Some(functions.into_shared()), |pool| async move {
//!     let results = pool.map("square", vec![1, 2, 3, 4])?;
//!     Ok(results.collect::<Vec<_>>().await)
//! })
//! .await?;
//! ```

pub mod backend;
pub mod broker;
pub mod config;
pub mod error;
pub mod function;
pub mod future;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod telemetry;
pub mod transport;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::backend::{BackendCapabilities, BackendKind, Launcher};
    pub use crate::config::PoolConfig;
    pub use crate::error::{
        ConfigurationError, LaunchError, PoolError, RemoteError, TaskError, TransportError,
    };
    pub use crate::function::{Call, CallArgs, FunctionRegistry};
    pub use crate::future::{FutureState, TaskFuture};
    pub use crate::pool::Pool;
    pub use crate::protocol::TaskId;
    pub use serde_json::json;
}

// Re-export key types at crate root
pub use backend::{BackendCapabilities, BackendKind, Launcher};
pub use broker::{BrokerState, TaskBroker};
pub use config::PoolConfig;
pub use error::{
    ConfigurationError, LaunchError, PoolError, RemoteError, TaskError, TransportError,
    WorkerError,
};
pub use function::{Call, CallArgs, FunctionRegistry};
pub use future::{FutureState, TaskFuture};
pub use pool::{Pool, PoolInfo};
pub use protocol::{TaskId, WorkerRequest, WorkerResponse};
pub use registry::FutureRegistry;
