//! Worker backends
//!
//! A backend knows how to bring a worker up and what resource shapes it can
//! honour. Every launcher hands back a [`WorkerHandle`]; the broker never
//! sees whether a thread or a process sits behind it.

mod local;
mod process;

pub use local::LocalThreadLauncher;
pub use process::ProcessLauncher;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{ConfigurationError, LaunchError};
use crate::function::FunctionRegistry;
use crate::worker::{WorkerHandle, WorkerSpec};

/// Available backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Workers are threads in this process
    #[default]
    LocalThread,
    /// Workers are `mpiexec`-launched process groups
    MpiProcess,
    /// Workers are `srun` allocations on a queuing system
    QueuingSystem,
}

impl BackendKind {
    /// Short name used in logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            Self::LocalThread => "local",
            Self::MpiProcess => "mpi",
            Self::QueuingSystem => "slurm",
        }
    }

    /// What this backend can honour
    pub fn capabilities(&self) -> BackendCapabilities {
        match self {
            Self::LocalThread => BackendCapabilities {
                name: self.name(),
                supports_threads: true,
                supports_gpus: false,
                supports_oversubscribe: true,
                spawns_processes: false,
            },
            Self::MpiProcess => BackendCapabilities {
                name: self.name(),
                supports_threads: false,
                supports_gpus: false,
                supports_oversubscribe: true,
                spawns_processes: true,
            },
            Self::QueuingSystem => BackendCapabilities {
                name: self.name(),
                supports_threads: true,
                supports_gpus: true,
                supports_oversubscribe: false,
                spawns_processes: true,
            },
        }
    }

    /// Pick a process backend from the programs on `PATH`
    ///
    /// A queuing system is preferred when `srun` is installed; otherwise
    /// workers go through `mpiexec`.
    pub fn detect() -> Self {
        Self::detect_with(program_on_path)
    }

    fn detect_with(installed: impl Fn(&str) -> bool) -> Self {
        let kind = match Self::QueuingSystem.launcher_program() {
            Some(program) if installed(program) => Self::QueuingSystem,
            _ => Self::MpiProcess,
        };
        debug!(backend = %kind, "Detected backend");
        kind
    }

    /// Default launcher program for process backends
    pub fn launcher_program(&self) -> Option<&'static str> {
        match self {
            Self::LocalThread => None,
            Self::MpiProcess => Some("mpiexec"),
            Self::QueuingSystem => Some("srun"),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "local_thread" | "thread" => Ok(Self::LocalThread),
            "mpi" | "mpi_process" => Ok(Self::MpiProcess),
            "slurm" | "queuing_system" => Ok(Self::QueuingSystem),
            "auto" => Ok(Self::detect()),
            _ => Err(ConfigurationError::InvalidEnv {
                name: "TASKBROKER_BACKEND".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// `program` is a file in one of the `PATH` directories
pub fn program_on_path(program: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
}

/// Resource features a backend supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendCapabilities {
    pub name: &'static str,
    /// More than one thread per core
    pub supports_threads: bool,
    /// GPU assignment
    pub supports_gpus: bool,
    /// More ranks than physical cores
    pub supports_oversubscribe: bool,
    /// Workers are separate processes that need a worker command
    pub spawns_processes: bool,
}

/// Starts workers for a backend
#[async_trait]
pub trait Launcher: Send + Sync {
    fn capabilities(&self) -> BackendCapabilities;

    /// Bring up one worker and run its initializer
    ///
    /// Returns only once the worker is ready to accept a task.
    async fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerHandle>, LaunchError>;
}

/// Build the launcher for a validated configuration
pub fn launcher_for(
    config: &PoolConfig,
    functions: Option<Arc<FunctionRegistry>>,
) -> Result<Arc<dyn Launcher>, ConfigurationError> {
    match config.backend {
        BackendKind::LocalThread => {
            let functions = functions.ok_or(ConfigurationError::MissingFunctions)?;
            Ok(Arc::new(LocalThreadLauncher::new(functions)))
        }
        kind => {
            if config.worker_command.is_empty() {
                return Err(ConfigurationError::MissingWorkerCommand { backend: kind.name() });
            }
            let mut launcher = ProcessLauncher::new(kind, config.worker_command.clone());
            if let Some(program) = &config.launcher_program {
                launcher = launcher.with_program(program.clone());
            }
            if config.direct_launch {
                launcher = launcher.with_direct_launch();
            }
            Ok(Arc::new(launcher))
        }
    }
}
