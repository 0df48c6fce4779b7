//! Integration tests for process-backed workers
//!
//! Workers are the crate's `taskbroker-worker` binary, started directly
//! (no `mpiexec`/`srun`) and connected over TCP.

use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use taskbroker::prelude::*;
use taskbroker::BrokerState;

fn worker_config() -> PoolConfig {
    PoolConfig::new(BackendKind::MpiProcess)
        .with_worker_command([env!("CARGO_BIN_EXE_taskbroker-worker")])
        .with_direct_launch(true)
        .with_startup_timeout(Duration::from_secs(10))
}

#[test_log::test(tokio::test)]
async fn test_process_workers_run_builtin_functions() {
    let pool = Pool::start(worker_config().with_max_workers(2), None)
        .await
        .unwrap();

    let results: Vec<_> = pool.map("square", [1, 2, 3, 4]).unwrap().collect().await;
    assert_eq!(
        results,
        vec![Ok(json!(1)), Ok(json!(4)), Ok(json!(9)), Ok(json!(16))]
    );

    let sum = pool
        .submit(Call::new("sum").arg(json!([1, 1])))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(sum, json!(2));

    pool.shutdown(true, false).await.unwrap();
    assert_eq!(pool.state(), BrokerState::Closed);
}

#[test_log::test(tokio::test)]
async fn test_remote_errors_cross_the_process_boundary() {
    let pool = Pool::start(worker_config(), None).await.unwrap();

    let err = pool
        .submit(Call::new("fail").arg("calc_error value error"))
        .unwrap()
        .result()
        .await
        .unwrap_err();
    assert_eq!(
        err.remote(),
        Some(&RemoteError::value_error("calc_error value error"))
    );

    let echoed = pool
        .submit(Call::new("echo").arg("still alive"))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(echoed, json!("still alive"));
    pool.shutdown(true, false).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_one_shot_process_workers() {
    let pool = Pool::start(
        worker_config()
            .with_block_allocation(false)
            .with_max_workers(2),
        None,
    )
    .await
    .unwrap();

    let ids: Vec<_> = (0..3)
        .map(|_| pool.submit(Call::new("worker_id")).unwrap())
        .collect();
    let mut seen = Vec::new();
    for future in ids {
        seen.push(future.await.unwrap());
    }
    seen.sort_by_key(|v| v.to_string());
    seen.dedup();
    assert_eq!(seen.len(), 3, "each task gets a fresh worker");
    pool.shutdown(true, false).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_forced_shutdown_kills_worker_processes() {
    let pool = Pool::start(worker_config(), None).await.unwrap();
    let running = pool.submit(Call::new("sleep").arg(5_000)).unwrap();
    while !running.running() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = std::time::Instant::now();
    pool.shutdown(false, false).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(running.cancelled());
}

#[test_log::test(tokio::test)]
async fn test_missing_worker_binary_fails_start() {
    let config = PoolConfig::new(BackendKind::MpiProcess)
        .with_worker_command(["/nonexistent/taskbroker-worker"])
        .with_direct_launch(true);
    let err = Pool::start(config, None).await.unwrap_err();
    assert!(matches!(err, PoolError::Launch(LaunchError::Spawn(_))));
}
