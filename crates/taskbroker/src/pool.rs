//! Executor pool
//!
//! User-facing entry point: validates the configuration against the
//! backend, starts the broker and exposes `submit`, `map` and `shutdown`.

use std::future::{Future, IntoFuture};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

use crate::backend::{launcher_for, BackendCapabilities, BackendKind, Launcher};
use crate::broker::{BrokerState, TaskBroker};
use crate::config::PoolConfig;
use crate::error::{PoolError, TaskError};
use crate::function::{Call, FunctionRegistry};
use crate::future::TaskFuture;

/// Snapshot of a pool for logs and status output
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub backend: BackendKind,
    pub capabilities: BackendCapabilities,
    pub max_workers: usize,
    pub block_allocation: bool,
    pub state: BrokerState,
    pub outstanding: usize,
    pub started_at: DateTime<Utc>,
}

struct PoolInner {
    config: PoolConfig,
    capabilities: BackendCapabilities,
    broker: TaskBroker,
    started_at: DateTime<Utc>,
}

/// Pool of workers executing submitted calls
///
/// Cheap to clone; clones share the same broker.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Validate `config` and start the pool
    ///
    /// The local-thread backend runs functions from `functions`; process
    /// backends resolve names in the worker binary and ignore it.
    pub async fn start(
        config: PoolConfig,
        functions: Option<Arc<FunctionRegistry>>,
    ) -> Result<Self, PoolError> {
        config.validate(&config.backend.capabilities())?;
        let launcher = launcher_for(&config, functions)?;
        Self::with_launcher(config, launcher).await
    }

    /// Start the pool on a custom launcher
    #[instrument(skip_all, fields(backend = %config.backend, max_workers = config.max_workers))]
    pub async fn with_launcher(
        config: PoolConfig,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self, PoolError> {
        let capabilities = launcher.capabilities();
        config.validate(&capabilities)?;

        let broker = TaskBroker::start(
            launcher,
            config.worker_spec(),
            config.max_workers,
            config.block_allocation,
        )
        .await?;
        info!(cores_per_worker = config.cores_per_worker, "Pool started");

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                capabilities,
                broker,
                started_at: Utc::now(),
            }),
        })
    }

    /// Run `body` against a fresh pool, then shut it down gracefully
    ///
    /// The pool is shut down with `wait = true` whether or not `body`
    /// succeeds; an error from `body` takes precedence.
    pub async fn scope<F, Fut, T>(
        config: PoolConfig,
        functions: Option<Arc<FunctionRegistry>>,
        body: F,
    ) -> Result<T, PoolError>
    where
        F: FnOnce(Pool) -> Fut,
        Fut: Future<Output = Result<T, PoolError>>,
    {
        let pool = Self::start(config, functions).await?;
        let result = body(pool.clone()).await;
        let shutdown = pool.shutdown(true, false).await;
        let value = result?;
        shutdown?;
        Ok(value)
    }

    /// Enqueue a call
    pub fn submit(&self, call: Call) -> Result<TaskFuture, PoolError> {
        self.inner.broker.submit(call)
    }

    /// Enqueue a call that runs in the background on its worker
    ///
    /// See [`TaskBroker::submit_background`].
    pub fn submit_background(&self, call: Call) -> Result<TaskFuture, PoolError> {
        self.inner.broker.submit_background(call)
    }

    /// Collect finished background tasks now; returns how many resolved
    pub async fn update(&self) -> Result<usize, PoolError> {
        self.inner.broker.update().await
    }

    /// Apply `function` to every input, yielding results in input order
    ///
    /// All calls are submitted before the stream is returned.
    pub fn map<I, V>(
        &self,
        function: &str,
        inputs: I,
    ) -> Result<impl Stream<Item = Result<Value, TaskError>> + Send + 'static, PoolError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let mut futures = Vec::new();
        for input in inputs {
            match self.submit(Call::new(function).arg(input)) {
                Ok(future) => futures.push(future),
                Err(e) => {
                    for future in &futures {
                        future.cancel();
                    }
                    return Err(e);
                }
            }
        }
        Ok(stream::iter(futures).then(|future| future.into_future()))
    }

    /// Stop the pool; see [`TaskBroker::shutdown`]
    pub async fn shutdown(&self, wait: bool, cancel_futures: bool) -> Result<(), PoolError> {
        self.inner.broker.shutdown(wait, cancel_futures).await
    }

    /// Number of queued or running tasks
    pub fn len(&self) -> usize {
        self.inner.broker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.broker.is_empty()
    }

    pub fn state(&self) -> BrokerState {
        self.inner.broker.state()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            backend: self.inner.config.backend,
            capabilities: self.inner.capabilities,
            max_workers: self.inner.config.max_workers,
            block_allocation: self.inner.config.block_allocation,
            state: self.state(),
            outstanding: self.len(),
            started_at: self.inner.started_at,
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("backend", &self.inner.config.backend)
            .field("state", &self.state())
            .field("outstanding", &self.len())
            .finish()
    }
}
