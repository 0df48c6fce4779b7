//! Integration tests for the executor pool on the local-thread backend
//!
//! Run with: cargo test -p taskbroker --test pool_test

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use taskbroker::prelude::*;
use taskbroker::BrokerState;

/// Functions shared by every test; `record` appends its argument to `log`
fn functions(log: Arc<Mutex<Vec<i64>>>) -> Arc<FunctionRegistry> {
    let functions = FunctionRegistry::new();
    functions.register("square", |args| {
        let x: i64 = args.get(0, "x")?;
        Ok(json!(x * x))
    });
    functions.register("calc", |args| {
        let i: i64 = args.get(0, "i")?;
        if i < 0 {
            return Err(RemoteError::value_error("calc_error value error"));
        }
        Ok(json!(i))
    });
    functions.register("sleep", |args| {
        let millis: u64 = args.get(0, "millis")?;
        std::thread::sleep(Duration::from_millis(millis));
        Ok(json!(millis))
    });
    functions.register("record", move |args| {
        let i: i64 = args.get(0, "i")?;
        log.lock().push(i);
        Ok(json!(i))
    });
    functions.register("scaled", |args| {
        let x: i64 = args.get(0, "x")?;
        let factor: i64 = args.get(1, "factor")?;
        Ok(json!(x * factor))
    });
    functions.register("setup", |_| Ok(json!({ "factor": 3 })));
    functions.into_shared()
}

async fn start(config: PoolConfig) -> Pool {
    Pool::start(config, Some(functions(Arc::default())))
        .await
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_map_squares_in_order() {
    let results = Pool::scope(
        PoolConfig::default().with_max_workers(2),
        Some(functions(Arc::default())),
        |pool| async move {
            let results: Vec<_> = pool.map("square", [1, 2, 3, 4])?.collect().await;
            Ok(results)
        },
    )
    .await
    .unwrap();

    assert_eq!(
        results,
        vec![Ok(json!(1)), Ok(json!(4)), Ok(json!(9)), Ok(json!(16))]
    );
}

#[test_log::test(tokio::test)]
async fn test_single_worker_runs_tasks_in_submission_order() {
    let log: Arc<Mutex<Vec<i64>>> = Arc::default();
    let pool = Pool::start(PoolConfig::default(), Some(functions(Arc::clone(&log))))
        .await
        .unwrap();

    let futures: Vec<_> = (0..10)
        .map(|i| pool.submit(Call::new("record").arg(i)).unwrap())
        .collect();
    for future in futures {
        assert_ok!(future.result().await);
    }

    assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    pool.shutdown(true, false).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_remote_error_propagates_and_pool_survives() {
    let pool = start(PoolConfig::default()).await;

    let err = assert_err!(pool.submit(Call::new("calc").arg(-1)).unwrap().await);
    let remote = err.remote().unwrap();
    assert!(remote.is("ValueError"));
    assert_eq!(remote.message, "calc_error value error");

    let value = assert_ok!(pool.submit(Call::new("calc").arg(4)).unwrap().await);
    assert_eq!(value, json!(4));
    pool.shutdown(true, false).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_unknown_function_is_name_error() {
    let pool = start(PoolConfig::default()).await;
    let err = pool
        .submit(Call::new("missing"))
        .unwrap()
        .result()
        .await
        .unwrap_err();
    assert!(err.remote().unwrap().is("NameError"));
    pool.shutdown(true, false).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_len_tracks_outstanding_tasks() {
    let pool = start(PoolConfig::default()).await;
    assert!(pool.is_empty());

    let future = pool.submit(Call::new("sleep").arg(100)).unwrap();
    assert_eq!(pool.len(), 1);

    future.result().await.unwrap();
    assert_eq!(pool.len(), 0);
    pool.shutdown(true, false).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_shutdown_without_wait_cancels_outstanding_tasks() {
    let pool = start(PoolConfig::default()).await;
    let running = pool.submit(Call::new("sleep").arg(500)).unwrap();
    let queued = pool.submit(Call::new("square").arg(2)).unwrap();

    while !running.running() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    pool.shutdown(false, false).await.unwrap();

    assert_eq!(pool.state(), BrokerState::Closed);
    assert!(running.cancelled());
    assert_eq!(queued.result().await, Err(TaskError::Cancelled));
    assert!(matches!(
        pool.submit(Call::new("square").arg(1)),
        Err(PoolError::ShutDown)
    ));
}

#[test_log::test(tokio::test)]
async fn test_shutdown_with_cancel_futures_finishes_running_task() {
    let pool = start(PoolConfig::default()).await;
    let running = pool.submit(Call::new("sleep").arg(200)).unwrap();
    let queued: Vec<_> = (0..3)
        .map(|i| pool.submit(Call::new("square").arg(i)).unwrap())
        .collect();

    while !running.running() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    pool.shutdown(true, true).await.unwrap();

    assert_eq!(running.try_result(), Some(Ok(json!(200))));
    assert!(queued.iter().all(TaskFuture::cancelled));
}

#[test_log::test(tokio::test)]
async fn test_forced_shutdown_keeps_completed_results() {
    let pool = start(PoolConfig::default().with_max_workers(2)).await;
    let quick = pool.submit(Call::new("square").arg(7)).unwrap();
    let slow = pool.submit(Call::new("sleep").arg(1_000)).unwrap();

    assert_eq!(quick.result().await, Ok(json!(49)));
    while !slow.running() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    pool.shutdown(false, true).await.unwrap();

    assert_eq!(quick.try_result(), Some(Ok(json!(49))));
    assert_eq!(slow.try_result(), Some(Err(TaskError::Cancelled)));
}

#[test_log::test(tokio::test)]
async fn test_graceful_shutdown_resolves_every_future() {
    let pool = start(PoolConfig::default().with_max_workers(3)).await;
    let futures: Vec<_> = (0..20)
        .map(|i| pool.submit(Call::new("calc").arg(if i % 5 == 0 { -1 } else { i })).unwrap())
        .collect();

    pool.shutdown(true, false).await.unwrap();

    assert!(futures.iter().all(TaskFuture::done));
    let failures = futures
        .iter()
        .filter(|f| matches!(f.try_result(), Some(Err(TaskError::Remote(_)))))
        .count();
    assert_eq!(failures, 4);
    assert!(pool.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_threads_per_core_rejected_on_mpi_backend() {
    let config = PoolConfig::new(BackendKind::MpiProcess)
        .with_threads_per_core(2)
        .with_worker_command(["taskbroker-worker"]);
    let err = Pool::start(config, None).await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::Configuration(ConfigurationError::ThreadsNotSupported {
            backend: "mpi",
            requested: 2
        })
    ));
}

#[test_log::test(tokio::test)]
async fn test_initializer_results_become_default_kwargs() {
    let pool = start(PoolConfig::default().with_init_function(Call::new("setup"))).await;

    let value = pool
        .submit(Call::new("scaled").arg(5))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(value, json!(15));

    // explicit arguments win over initializer defaults
    let value = pool
        .submit(Call::new("scaled").arg(5).kwarg("factor", 10))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(value, json!(50));
    pool.shutdown(true, false).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_one_shot_workers_run_every_task() {
    let pool = start(
        PoolConfig::default()
            .with_block_allocation(false)
            .with_max_workers(3),
    )
    .await;

    let results: Vec<_> = pool.map("square", 1..=6).unwrap().collect().await;
    let values: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(values, vec![json!(1), json!(4), json!(9), json!(16), json!(25), json!(36)]);
    pool.shutdown(true, false).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_scope_shuts_pool_down_on_error() {
    let mut kept = None;
    let result: Result<(), PoolError> = Pool::scope(
        PoolConfig::default(),
        Some(functions(Arc::default())),
        |pool| {
            kept = Some(pool.clone());
            async move {
                pool.submit(Call::new("calc").arg(-1))?.await?;
                Ok(())
            }
        },
    )
    .await;

    assert!(matches!(result, Err(PoolError::Task(TaskError::Remote(_)))));
    assert_eq!(kept.unwrap().state(), BrokerState::Closed);
}

#[test]
fn test_blocking_result_outside_runtime() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let pool = runtime.block_on(start(PoolConfig::default()));

    let future = {
        let _guard = runtime.enter();
        pool.submit(Call::new("square").arg(12)).unwrap()
    };
    assert_eq!(future.blocking_result(), Ok(json!(144)));

    runtime.block_on(pool.shutdown(true, false)).unwrap();
}
