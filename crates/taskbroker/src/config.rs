//! Pool configuration
//!
//! Built with `with_*` methods or read from `TASKBROKER_*` environment
//! variables. Validation against the selected backend happens in
//! [`PoolConfig::validate`], before any worker is launched.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendCapabilities, BackendKind};
use crate::error::ConfigurationError;
use crate::function::Call;
use crate::worker::WorkerSpec;

/// Executor pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Backend used to launch workers
    pub backend: BackendKind,

    /// Number of workers (block allocation) or concurrent one-shot workers
    pub max_workers: usize,

    /// Cores per worker
    pub cores_per_worker: usize,

    /// Threads per core
    pub threads_per_core: usize,

    /// GPUs per worker
    pub gpus_per_worker: usize,

    /// Allow more ranks than physical cores
    pub oversubscribe: bool,

    /// Working directory for workers
    pub cwd: Option<PathBuf>,

    /// Initializer run once on every worker (block allocation only)
    pub init_function: Option<Call>,

    /// Keep workers alive across tasks
    pub block_allocation: bool,

    /// How long a worker may take to come up
    #[serde(with = "duration_millis")]
    pub startup_timeout: Duration,

    /// Worker executable and arguments for process backends
    pub worker_command: Vec<String>,

    /// Override for the backend's launcher program (`mpiexec`, `srun`)
    pub launcher_program: Option<String>,

    /// Run `worker_command` directly instead of through the launcher program
    pub direct_launch: bool,

    /// How often workers are polled for background task results
    #[serde(with = "duration_millis", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(50)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::LocalThread,
            max_workers: 1,
            cores_per_worker: 1,
            threads_per_core: 1,
            gpus_per_worker: 0,
            oversubscribe: false,
            cwd: None,
            init_function: None,
            block_allocation: true,
            startup_timeout: Duration::from_secs(30),
            worker_command: vec![],
            launcher_program: None,
            direct_launch: false,
            poll_interval: default_poll_interval(),
        }
    }
}

impl PoolConfig {
    /// Create a configuration for the given backend
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }

    /// Read configuration from environment variables
    ///
    /// Environment variables:
    /// - `TASKBROKER_BACKEND`: `local`, `mpi`, `slurm` or `auto` (default: `local`)
    /// - `TASKBROKER_MAX_WORKERS`: number of workers (default: 1)
    /// - `TASKBROKER_CORES_PER_WORKER`, `TASKBROKER_THREADS_PER_CORE`,
    ///   `TASKBROKER_GPUS_PER_WORKER`: resource shape
    /// - `TASKBROKER_OVERSUBSCRIBE`, `TASKBROKER_BLOCK_ALLOCATION`: `true`/`1`
    /// - `TASKBROKER_CWD`: worker working directory
    /// - `TASKBROKER_STARTUP_TIMEOUT_MS`: worker startup timeout
    /// - `TASKBROKER_WORKER_COMMAND`: whitespace-separated worker command
    /// - `TASKBROKER_LAUNCHER`: launcher program override
    /// - `TASKBROKER_DIRECT_LAUNCH`: `true`/`1` to skip the launcher program
    /// - `TASKBROKER_POLL_INTERVAL_MS`: background result poll interval
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let mut config = Self::default();

        if let Some(value) = lookup("TASKBROKER_BACKEND") {
            config.backend = value.parse()?;
        }
        if let Some(value) = lookup("TASKBROKER_MAX_WORKERS") {
            config.max_workers = parse_env("TASKBROKER_MAX_WORKERS", &value)?;
        }
        if let Some(value) = lookup("TASKBROKER_CORES_PER_WORKER") {
            config.cores_per_worker = parse_env("TASKBROKER_CORES_PER_WORKER", &value)?;
        }
        if let Some(value) = lookup("TASKBROKER_THREADS_PER_CORE") {
            config.threads_per_core = parse_env("TASKBROKER_THREADS_PER_CORE", &value)?;
        }
        if let Some(value) = lookup("TASKBROKER_GPUS_PER_WORKER") {
            config.gpus_per_worker = parse_env("TASKBROKER_GPUS_PER_WORKER", &value)?;
        }
        if let Some(value) = lookup("TASKBROKER_OVERSUBSCRIBE") {
            config.oversubscribe = parse_flag(&value);
        }
        if let Some(value) = lookup("TASKBROKER_BLOCK_ALLOCATION") {
            config.block_allocation = parse_flag(&value);
        }
        if let Some(value) = lookup("TASKBROKER_CWD") {
            config.cwd = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("TASKBROKER_STARTUP_TIMEOUT_MS") {
            let millis: u64 = parse_env("TASKBROKER_STARTUP_TIMEOUT_MS", &value)?;
            config.startup_timeout = Duration::from_millis(millis);
        }
        if let Some(value) = lookup("TASKBROKER_WORKER_COMMAND") {
            config.worker_command = value.split_whitespace().map(String::from).collect();
        }
        if let Some(value) = lookup("TASKBROKER_LAUNCHER") {
            config.launcher_program = Some(value);
        }
        if let Some(value) = lookup("TASKBROKER_DIRECT_LAUNCH") {
            config.direct_launch = parse_flag(&value);
        }
        if let Some(value) = lookup("TASKBROKER_POLL_INTERVAL_MS") {
            let millis: u64 = parse_env("TASKBROKER_POLL_INTERVAL_MS", &value)?;
            config.poll_interval = Duration::from_millis(millis);
        }

        Ok(config)
    }

    /// Set the number of workers
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set cores per worker
    pub fn with_cores_per_worker(mut self, cores: usize) -> Self {
        self.cores_per_worker = cores;
        self
    }

    /// Set threads per core
    pub fn with_threads_per_core(mut self, threads: usize) -> Self {
        self.threads_per_core = threads;
        self
    }

    /// Set GPUs per worker
    pub fn with_gpus_per_worker(mut self, gpus: usize) -> Self {
        self.gpus_per_worker = gpus;
        self
    }

    pub fn with_oversubscribe(mut self, oversubscribe: bool) -> Self {
        self.oversubscribe = oversubscribe;
        self
    }

    /// Set the worker working directory
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the per-worker initializer
    pub fn with_init_function(mut self, init: Call) -> Self {
        self.init_function = Some(init);
        self
    }

    /// Enable or disable block allocation
    pub fn with_block_allocation(mut self, block_allocation: bool) -> Self {
        self.block_allocation = block_allocation;
        self
    }

    /// Set the worker startup timeout
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the worker command for process backends
    pub fn with_worker_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Override the launcher program
    pub fn with_launcher_program(mut self, program: impl Into<String>) -> Self {
        self.launcher_program = Some(program.into());
        self
    }

    /// Start `worker_command` directly, without a launcher program
    pub fn with_direct_launch(mut self, direct: bool) -> Self {
        self.direct_launch = direct;
        self
    }

    /// Set how often background task results are collected
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Reject combinations the backend cannot honour
    pub fn validate(&self, capabilities: &BackendCapabilities) -> Result<(), ConfigurationError> {
        if self.max_workers == 0 {
            return Err(ConfigurationError::ZeroCount {
                field: "max_workers",
            });
        }
        if self.cores_per_worker == 0 {
            return Err(ConfigurationError::ZeroCount {
                field: "cores_per_worker",
            });
        }
        if self.threads_per_core == 0 {
            return Err(ConfigurationError::ZeroCount {
                field: "threads_per_core",
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigurationError::ZeroCount {
                field: "poll_interval",
            });
        }
        if self.threads_per_core != 1 && !capabilities.supports_threads {
            return Err(ConfigurationError::ThreadsNotSupported {
                backend: capabilities.name,
                requested: self.threads_per_core,
            });
        }
        if self.gpus_per_worker != 0 && !capabilities.supports_gpus {
            return Err(ConfigurationError::GpusNotSupported {
                backend: capabilities.name,
                requested: self.gpus_per_worker,
            });
        }
        if self.oversubscribe && !capabilities.supports_oversubscribe {
            return Err(ConfigurationError::OversubscribeNotSupported {
                backend: capabilities.name,
            });
        }
        if self.init_function.is_some() && !self.block_allocation {
            return Err(ConfigurationError::InitWithoutBlockAllocation);
        }
        if capabilities.spawns_processes && self.worker_command.is_empty() {
            return Err(ConfigurationError::MissingWorkerCommand {
                backend: capabilities.name,
            });
        }
        Ok(())
    }

    /// Resource shape handed to the launcher for each worker
    pub fn worker_spec(&self) -> WorkerSpec {
        WorkerSpec {
            cores: self.cores_per_worker,
            threads_per_core: self.threads_per_core,
            gpus: self.gpus_per_worker,
            oversubscribe: self.oversubscribe,
            cwd: self.cwd.clone(),
            init_function: self.init_function.clone(),
            one_shot: !self.block_allocation,
            startup_timeout: self.startup_timeout,
            poll_interval: self.poll_interval,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigurationError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigurationError::InvalidEnv {
            name: name.to_string(),
            value: value.to_string(),
        })
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
