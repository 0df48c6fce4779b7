//! Task broker
//!
//! Owns the FIFO queue, the future registry and the dispatch loop for one
//! pool.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  shutdown(wait)   ┌──────────┐  drained / killed  ┌────────┐
//! │ Running │ ────────────────▶ │ Draining │ ─────────────────▶ │ Closed │
//! └─────────┘                   └──────────┘                    └────────┘
//! ```
//!
//! Submissions are accepted only while `Running`.

mod dispatch;
mod slot;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::backend::Launcher;
use crate::error::{LaunchError, PoolError};
use crate::function::Call;
use crate::future::TaskFuture;
use crate::protocol::TaskId;
use crate::registry::FutureRegistry;
use crate::worker::{WorkerHandle, WorkerSpec};

use dispatch::{Control, DispatchLoop};
use slot::{QueuedTask, SlotContext};

/// Broker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerState {
    /// Accepting submissions
    Running,
    /// Shutdown requested; finishing or cancelling outstanding work
    Draining,
    /// Dispatch loop exited, all workers terminated
    Closed,
}

/// Dispatches submitted calls to workers and resolves their futures
pub struct TaskBroker {
    registry: Arc<FutureRegistry>,
    queue: mpsc::UnboundedSender<QueuedTask>,
    control: mpsc::UnboundedSender<Control>,
    state: RwLock<BrokerState>,
    closed: watch::Receiver<bool>,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
}

impl TaskBroker {
    /// Start the broker
    ///
    /// With block allocation, `max_workers` workers are launched up front
    /// and any launch failure aborts the start. Otherwise workers are
    /// launched per task, at most `max_workers` at a time.
    #[instrument(skip(launcher, spec), fields(backend = launcher.capabilities().name))]
    pub async fn start(
        launcher: Arc<dyn Launcher>,
        spec: WorkerSpec,
        max_workers: usize,
        block_allocation: bool,
    ) -> Result<Self, PoolError> {
        let registry = FutureRegistry::new();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let ctx = SlotContext {
            launcher: Arc::clone(&launcher),
            spec,
            registry: Arc::clone(&registry),
            events: events_tx,
            kill: CancellationToken::new(),
        };

        let dispatch = if block_allocation {
            let workers = launch_all(launcher.as_ref(), &ctx.spec, max_workers).await?;
            DispatchLoop::with_workers(
                Arc::clone(&registry),
                queue_rx,
                control_rx,
                events_rx,
                ctx,
                workers,
                closed_tx,
            )
        } else {
            DispatchLoop::one_shot(
                Arc::clone(&registry),
                queue_rx,
                control_rx,
                events_rx,
                ctx,
                max_workers,
                closed_tx,
            )
        };

        let handle = tokio::spawn(dispatch.run());
        info!(max_workers, block_allocation, "Broker started");

        Ok(Self {
            registry,
            queue: queue_tx,
            control: control_tx,
            state: RwLock::new(BrokerState::Running),
            closed: closed_rx,
            dispatch_loop: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue a call and return its future
    ///
    /// Never blocks; the call waits in FIFO order for an idle worker.
    pub fn submit(&self, call: Call) -> Result<TaskFuture, PoolError> {
        self.enqueue(call, false)
    }

    /// Enqueue a call that runs in the background on its worker
    ///
    /// The worker is free for further tasks as soon as it has accepted the
    /// call. The result is collected by the next [`update`](Self::update)
    /// or by the slot's periodic poll. One-shot brokers run it like any
    /// other task.
    pub fn submit_background(&self, call: Call) -> Result<TaskFuture, PoolError> {
        self.enqueue(call, true)
    }

    fn enqueue(&self, call: Call, background: bool) -> Result<TaskFuture, PoolError> {
        let state = self.state.read();
        if *state != BrokerState::Running {
            return Err(PoolError::ShutDown);
        }

        let id = TaskId::new();
        let future = self.registry.register(id);
        let task = QueuedTask {
            id,
            call,
            background,
        };
        if self.queue.send(task).is_err() {
            self.registry.cancel(id);
            return Err(PoolError::DispatchLoop("dispatch loop is gone".to_string()));
        }
        Ok(future)
    }

    /// Collect finished background tasks from every worker now
    ///
    /// Returns how many background futures were resolved. They are all
    /// resolved by the time this returns.
    pub async fn update(&self) -> Result<usize, PoolError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.control
            .send(Control::Update { done: done_tx })
            .map_err(|_| PoolError::ShutDown)?;
        done_rx.await.map_err(|_| PoolError::ShutDown)
    }

    /// Stop the broker
    ///
    /// - `wait = true`: queued and running tasks finish, then workers exit
    ///   gracefully. With `cancel_futures`, queued tasks are cancelled first.
    /// - `wait = false`: every outstanding future is cancelled, running ones
    ///   included, and workers are terminated at once.
    ///
    /// Returns once the dispatch loop has exited. Calling it again is a no-op.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, wait: bool, cancel_futures: bool) -> Result<(), PoolError> {
        {
            let mut state = self.state.write();
            if *state == BrokerState::Closed {
                return Ok(());
            }
            *state = BrokerState::Draining;
        }

        if !wait {
            let cancelled = self.registry.cancel_all();
            info!(cancelled, "Cancelled outstanding tasks");
        } else if cancel_futures {
            let cancelled = self.registry.cancel_pending();
            info!(cancelled, "Cancelled queued tasks");
        }

        let (done_tx, done_rx) = oneshot::channel();
        if self
            .control
            .send(Control::Shutdown {
                wait,
                done: done_tx,
            })
            .is_ok()
        {
            let _ = done_rx.await;
        }

        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;

        let handle = self.dispatch_loop.lock().take();
        let joined = match handle {
            Some(handle) => handle.await,
            None => Ok(()),
        };
        *self.state.write() = BrokerState::Closed;

        joined.map_err(|e| PoolError::DispatchLoop(e.to_string()))
    }

    /// Number of outstanding (queued or running) tasks
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn state(&self) -> BrokerState {
        *self.state.read()
    }

    /// Registry of outstanding futures
    pub fn registry(&self) -> &Arc<FutureRegistry> {
        &self.registry
    }
}

impl Drop for TaskBroker {
    fn drop(&mut self) {
        if *self.state.get_mut() != BrokerState::Closed {
            let cancelled = self.registry.cancel_all();
            if cancelled > 0 {
                warn!(cancelled, "Broker dropped with outstanding tasks");
            }
        }
        // the loop notices the dropped control channel and kills its workers
    }
}

/// Launch `count` workers concurrently; on any failure terminate the rest
async fn launch_all(
    launcher: &dyn Launcher,
    spec: &WorkerSpec,
    count: usize,
) -> Result<Vec<Box<dyn WorkerHandle>>, LaunchError> {
    let results = futures::future::join_all((0..count).map(|_| launcher.launch(spec))).await;

    let mut workers = Vec::with_capacity(count);
    let mut failure = None;
    for result in results {
        match result {
            Ok(worker) => workers.push(worker),
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }

    if let Some(error) = failure {
        warn!(error = %error, started = workers.len(), "Worker launch failed, aborting start");
        for worker in workers.iter_mut() {
            worker.terminate(false).await;
        }
        return Err(error);
    }
    Ok(workers)
}
