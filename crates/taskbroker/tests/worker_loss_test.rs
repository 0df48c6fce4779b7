//! Integration tests for workers that die mid-task
//!
//! The first worker drops its channel as soon as it receives a task. What
//! happens on relaunch (delay, failure) is set per test.
//!
//! Run with: cargo test -p taskbroker --test worker_loss_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;

use taskbroker::backend::LocalThreadLauncher;
use taskbroker::prelude::*;
use taskbroker::transport::{Channel, MemoryChannel};
use taskbroker::worker::{ChannelWorker, WorkerHandle, WorkerSpec, WorkerUnit};
use taskbroker::BrokerState;

struct CrashUnit(Option<JoinHandle<()>>);

#[async_trait]
impl WorkerUnit for CrashUnit {
    async fn join(&mut self) {
        if let Some(handle) = self.0.take() {
            let _ = handle.await;
        }
    }

    async fn kill(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// First launch yields a worker that dies on its first task
struct CrashingLauncher {
    healthy: LocalThreadLauncher,
    launches: AtomicUsize,
    relaunch_delay: Duration,
    relaunch_fails: bool,
}

impl CrashingLauncher {
    fn new(relaunch_delay: Duration, relaunch_fails: bool) -> Arc<Self> {
        let functions = FunctionRegistry::new();
        functions.register("square", |args| {
            let x: i64 = args.get(0, "x")?;
            Ok(json!(x * x))
        });
        Arc::new(Self {
            healthy: LocalThreadLauncher::new(functions.into_shared()),
            launches: AtomicUsize::new(0),
            relaunch_delay,
            relaunch_fails,
        })
    }

    async fn crashing_worker(
        &self,
        spec: &WorkerSpec,
    ) -> Result<Box<dyn WorkerHandle>, LaunchError> {
        let (broker_end, mut worker_end) = MemoryChannel::pair();
        let server = tokio::spawn(async move {
            let _ = worker_end.receive().await;
            worker_end.close().await;
        });
        let unit = Box::new(CrashUnit(Some(server)));
        let worker = ChannelWorker::start("crashing-0".to_string(), broker_end, unit, spec).await?;
        Ok(Box::new(worker))
    }
}

#[async_trait]
impl Launcher for CrashingLauncher {
    fn capabilities(&self) -> BackendCapabilities {
        BackendKind::LocalThread.capabilities()
    }

    async fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerHandle>, LaunchError> {
        if self.launches.fetch_add(1, Ordering::SeqCst) == 0 {
            return self.crashing_worker(spec).await;
        }
        tokio::time::sleep(self.relaunch_delay).await;
        if self.relaunch_fails {
            return Err(LaunchError::Spawn("allocation revoked".to_string()));
        }
        self.healthy.launch(spec).await
    }
}

async fn start(launcher: Arc<CrashingLauncher>) -> Pool {
    Pool::with_launcher(PoolConfig::default(), launcher)
        .await
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_lost_task_fails_before_relaunch_completes() {
    let launcher = CrashingLauncher::new(Duration::from_secs(1), false);
    let pool = start(Arc::clone(&launcher)).await;

    let lost = pool.submit(Call::new("square").arg(3)).unwrap();
    let result = tokio::time::timeout(Duration::from_millis(500), lost.result())
        .await
        .expect("lost task must resolve without waiting for the relaunch");
    assert!(matches!(result, Err(TaskError::Transport(_))));

    // the relaunched worker picks up later work
    let value = assert_ok!(pool.submit(Call::new("square").arg(4)).unwrap().await);
    assert_eq!(value, json!(16));
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    pool.shutdown(true, false).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_forced_shutdown_does_not_wait_for_relaunch() {
    let pool = start(CrashingLauncher::new(Duration::from_secs(30), false)).await;

    let lost = pool.submit(Call::new("square").arg(3)).unwrap();
    assert!(matches!(lost.result().await, Err(TaskError::Transport(_))));
    let queued = pool.submit(Call::new("square").arg(5)).unwrap();

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(5), pool.shutdown(false, false))
        .await
        .expect("shutdown must not wait for the relaunch")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(pool.state(), BrokerState::Closed);
    assert_eq!(queued.result().await, Err(TaskError::Cancelled));
}

#[test_log::test(tokio::test)]
async fn test_failed_relaunch_fails_remaining_tasks() {
    let pool = start(CrashingLauncher::new(Duration::from_millis(50), true)).await;

    let lost = pool.submit(Call::new("square").arg(3)).unwrap();
    let queued = pool.submit(Call::new("square").arg(4)).unwrap();
    assert!(matches!(lost.result().await, Err(TaskError::Transport(_))));

    let expected = Err(TaskError::Launch(LaunchError::Spawn(
        "allocation revoked".to_string(),
    )));
    assert_eq!(queued.result().await, expected);

    let later = pool.submit(Call::new("square").arg(5)).unwrap();
    assert_eq!(later.result().await, expected);

    pool.shutdown(true, false).await.unwrap();
    assert!(pool.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_lost_worker_fails_its_background_tasks() {
    let pool = start(CrashingLauncher::new(Duration::from_millis(50), false)).await;

    // the crashing worker dies on the submission itself
    let background = pool.submit_background(Call::new("square").arg(2)).unwrap();
    assert!(matches!(
        background.result().await,
        Err(TaskError::Transport(_))
    ));

    let background = pool.submit_background(Call::new("square").arg(6)).unwrap();
    while !background.done() {
        pool.update().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(background.try_result(), Some(Ok(json!(36))));
    pool.shutdown(true, false).await.unwrap();
}
