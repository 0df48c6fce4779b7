//! Worker process for the MPI and queuing-system backends
//!
//! Started by the broker behind `mpiexec`/`srun`; connects back to the
//! broker's port and serves the built-in functions until closed.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use taskbroker::{worker, FunctionRegistry, RemoteError};

#[derive(Parser, Debug)]
#[command(name = "taskbroker-worker", about = "Task broker worker process")]
struct Args {
    /// Broker host to connect to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Broker port to connect to
    #[arg(long)]
    port: u16,
}

fn builtin_functions() -> FunctionRegistry {
    let functions = FunctionRegistry::new();
    functions.register("square", |args| {
        let x: f64 = args.get(0, "x")?;
        Ok(number(x * x))
    });
    functions.register("sum", |args| {
        let values: Vec<f64> = args.get(0, "values")?;
        Ok(number(values.iter().sum()))
    });
    functions.register("echo", |args| {
        Ok(match args.args() {
            [single] if args.kwargs().is_empty() => single.clone(),
            _ => json!({ "args": args.args(), "kwargs": args.kwargs() }),
        })
    });
    functions.register("sleep", |args| {
        let millis: u64 = args.get(0, "millis")?;
        std::thread::sleep(Duration::from_millis(millis));
        Ok(json!(millis))
    });
    functions.register("fail", |args| {
        let message: String = args
            .get_opt(0, "message")?
            .unwrap_or_else(|| "requested failure".to_string());
        Err(RemoteError::value_error(message))
    });
    functions.register("worker_id", |_| {
        Ok(std::env::var("TASKBROKER_WORKER_ID").map_or(Value::Null, Value::String))
    });
    functions
}

/// Integral floats go back as integers
fn number(x: f64) -> Value {
    if x.fract() == 0.0 && x.abs() < i64::MAX as f64 {
        json!(x as i64)
    } else {
        json!(x)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    taskbroker::telemetry::init_tracing("taskbroker=info");

    let args = Args::parse();
    let functions = builtin_functions().into_shared();
    tracing::info!(host = %args.host, port = args.port, functions = ?functions.names(), "Worker starting");

    worker::serve_tcp(&args.host, args.port, functions)
        .await
        .with_context(|| format!("worker connection to {}:{} failed", args.host, args.port))?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
