//! Local-thread backend

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::{BackendCapabilities, BackendKind, Launcher};
use crate::error::LaunchError;
use crate::function::FunctionRegistry;
use crate::transport::MemoryChannel;
use crate::worker::{serve, ChannelWorker, WorkerHandle, WorkerSpec, WorkerUnit};

/// Runs each worker on a dedicated OS thread with its own runtime
pub struct LocalThreadLauncher {
    functions: Arc<FunctionRegistry>,
    launched: AtomicUsize,
}

impl LocalThreadLauncher {
    pub fn new(functions: Arc<FunctionRegistry>) -> Self {
        Self {
            functions,
            launched: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Launcher for LocalThreadLauncher {
    fn capabilities(&self) -> BackendCapabilities {
        BackendKind::LocalThread.capabilities()
    }

    async fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerHandle>, LaunchError> {
        let n = self.launched.fetch_add(1, Ordering::Relaxed);
        let id = format!("local-{n}");
        let (broker_end, worker_end) = MemoryChannel::pair();
        let functions = Arc::clone(&self.functions);

        let thread = std::thread::Builder::new()
            .name(format!("taskbroker-{id}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "Failed to build worker runtime");
                        return;
                    }
                };
                if let Err(e) = runtime.block_on(serve(worker_end, functions)) {
                    warn!(error = %e, "Worker server stopped with error");
                }
            })
            .map_err(|e| LaunchError::Spawn(e.to_string()))?;

        let unit = ThreadUnit {
            thread: Some(thread),
        };
        let worker = ChannelWorker::start(id, broker_end, Box::new(unit), spec).await?;
        Ok(Box::new(worker))
    }
}

struct ThreadUnit {
    thread: Option<JoinHandle<()>>,
}

#[async_trait]
impl WorkerUnit for ThreadUnit {
    async fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("Worker thread panicked"),
            Err(e) => warn!(error = %e, "Failed to join worker thread"),
        }
    }

    async fn kill(&mut self) {
        // Threads cannot be stopped from outside; the closed channel makes
        // the server exit once its current function returns.
        if let Some(thread) = self.thread.take() {
            debug!(
                thread = thread.thread().name().unwrap_or("unnamed"),
                "Detaching worker thread"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Call;
    use crate::protocol::TaskId;
    use serde_json::json;

    fn launcher() -> LocalThreadLauncher {
        let functions = FunctionRegistry::new();
        functions.register("square", |args| {
            let x: i64 = args.get(0, "x")?;
            Ok(json!(x * x))
        });
        LocalThreadLauncher::new(functions.into_shared())
    }

    #[tokio::test]
    async fn test_launch_and_run_task() {
        let launcher = launcher();
        let mut worker = launcher.launch(&WorkerSpec::default()).await.unwrap();
        assert_eq!(worker.id(), "local-0");

        worker
            .dispatch(TaskId::new(), &Call::new("square").arg(5))
            .await
            .unwrap();
        assert_eq!(worker.next_result().await.unwrap(), Ok(json!(25)));
        worker.terminate(true).await;
    }

    #[tokio::test]
    async fn test_worker_ids_are_unique() {
        let launcher = launcher();
        let mut a = launcher.launch(&WorkerSpec::default()).await.unwrap();
        let mut b = launcher.launch(&WorkerSpec::default()).await.unwrap();
        assert_ne!(a.id(), b.id());
        a.terminate(true).await;
        b.terminate(false).await;
    }
}
