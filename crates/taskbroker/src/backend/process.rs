//! Process backends: MPI and queuing-system launches
//!
//! The broker listens on an ephemeral local port and starts the worker
//! command behind the backend's launcher program. The worker connects back;
//! the accepted socket becomes the worker's channel.

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use super::{BackendCapabilities, BackendKind, Launcher};
use crate::error::LaunchError;
use crate::transport::SocketChannel;
use crate::worker::{ChannelWorker, WorkerHandle, WorkerSpec, WorkerUnit};

/// Launches workers as child processes
#[derive(Debug)]
pub struct ProcessLauncher {
    kind: BackendKind,
    program: Option<String>,
    worker_command: Vec<String>,
    host: String,
    launched: AtomicUsize,
}

impl ProcessLauncher {
    pub fn new(kind: BackendKind, worker_command: Vec<String>) -> Self {
        Self {
            kind,
            program: kind.launcher_program().map(String::from),
            worker_command,
            host: "127.0.0.1".to_string(),
            launched: AtomicUsize::new(0),
        }
    }

    /// Use a different launcher program, e.g. `mpirun`
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Start the worker command without a launcher program
    pub fn with_direct_launch(mut self) -> Self {
        self.program = None;
        self
    }

    /// Address the worker connects back to
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Full argument vector for one worker listening on `port`
    pub fn command_line(&self, spec: &WorkerSpec, port: u16) -> Vec<String> {
        let mut argv = Vec::new();

        if let Some(program) = &self.program {
            argv.push(program.clone());
            argv.push("-n".to_string());
            argv.push(spec.cores.to_string());
            match self.kind {
                BackendKind::QueuingSystem => {
                    argv.push("--cpus-per-task".to_string());
                    argv.push(spec.threads_per_core.to_string());
                    if spec.gpus > 0 {
                        argv.push("--gpus-per-task".to_string());
                        argv.push(spec.gpus.to_string());
                    }
                }
                _ => {
                    if spec.oversubscribe {
                        argv.push("--oversubscribe".to_string());
                    }
                }
            }
        }

        argv.extend(self.worker_command.iter().cloned());
        argv.push("--host".to_string());
        argv.push(self.host.clone());
        argv.push("--port".to_string());
        argv.push(port.to_string());
        argv
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn capabilities(&self) -> BackendCapabilities {
        self.kind.capabilities()
    }

    #[instrument(skip_all, fields(backend = %self.kind))]
    async fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerHandle>, LaunchError> {
        let n = self.launched.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{n}", self.kind.name());

        let listener = TcpListener::bind((self.host.as_str(), 0))
            .await
            .map_err(|e| LaunchError::Spawn(format!("failed to bind listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| LaunchError::Spawn(e.to_string()))?
            .port();

        let argv = self.command_line(spec, port);
        let Some((program, args)) = argv.split_first() else {
            return Err(LaunchError::Spawn("empty worker command".to_string()));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .env("TASKBROKER_WORKER_ID", &id)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        debug!(worker_id = %id, command = ?argv, "Spawning worker process");
        let mut child = command
            .spawn()
            .map_err(|e| LaunchError::Spawn(format!("{program}: {e}")))?;

        let accepted = tokio::select! {
            accepted = tokio::time::timeout(spec.startup_timeout, listener.accept()) => accepted,
            status = child.wait() => {
                let detail = match status {
                    Ok(status) => format!("worker exited with {status} before connecting"),
                    Err(e) => format!("worker exited before connecting: {e}"),
                };
                return Err(LaunchError::Spawn(detail));
            }
        };

        let stream = match accepted {
            Ok(Ok((stream, peer))) => {
                info!(worker_id = %id, %peer, "Worker connected");
                stream
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(LaunchError::Spawn(format!("accept failed: {e}")));
            }
            Err(_) => {
                warn!(worker_id = %id, "Worker did not connect in time");
                let _ = child.kill().await;
                return Err(LaunchError::Timeout {
                    timeout_ms: spec.startup_timeout.as_millis() as u64,
                });
            }
        };

        let unit = ProcessUnit { child };
        let worker = ChannelWorker::start(id, SocketChannel::new(stream), Box::new(unit), spec).await?;
        Ok(Box::new(worker))
    }
}

struct ProcessUnit {
    child: Child,
}

#[async_trait]
impl WorkerUnit for ProcessUnit {
    async fn join(&mut self) {
        match self.child.wait().await {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(%status, "Worker process exited abnormally"),
            Err(e) => warn!(error = %e, "Failed to wait for worker process"),
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Worker process already gone");
        }
    }
}
