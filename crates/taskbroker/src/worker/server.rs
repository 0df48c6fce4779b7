//! Worker-side protocol loop
//!
//! Runs on the far end of a channel: decodes requests, executes registered
//! functions on the blocking pool, and replies. Local-thread workers run it
//! in-process; process workers run it through [`serve_tcp`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::Outcome;
use crate::error::{RemoteError, TransportError};
use crate::function::{Call, FunctionRegistry};
use crate::protocol::{TaskId, WorkerRequest, WorkerResponse};
use crate::transport::{receive_message, send_message, Channel, SocketChannel};

/// Serve requests on `channel` until `Close` or until the broker goes away
pub async fn serve<C: Channel>(
    mut channel: C,
    functions: Arc<FunctionRegistry>,
) -> Result<(), TransportError> {
    let mut defaults: Map<String, Value> = Map::new();
    let mut background: HashMap<TaskId, JoinHandle<Outcome>> = HashMap::new();

    loop {
        let request: WorkerRequest = match receive_message(&mut channel).await {
            Ok(request) => request,
            Err(TransportError::Closed) => {
                debug!("Broker closed the channel");
                break;
            }
            Err(e) => return Err(e),
        };

        match request {
            WorkerRequest::Init { call } => {
                let outcome = execute(&functions, call).await;
                if let Ok(Value::Object(values)) = &outcome {
                    defaults = values.clone();
                }
                send_message(&mut channel, &WorkerResponse::from_outcome(outcome)).await?;
            }
            WorkerRequest::Task { task_id, mut call } => {
                call.merge_defaults(&defaults);
                debug!(%task_id, function = %call.function, "Executing task");
                let outcome = execute(&functions, call).await;
                send_message(&mut channel, &WorkerResponse::from_outcome(outcome)).await?;
            }
            WorkerRequest::Submit { task_id, mut call } => {
                call.merge_defaults(&defaults);
                let functions = Arc::clone(&functions);
                let handle = tokio::task::spawn_blocking(move || functions.execute(&call));
                background.insert(task_id, handle);
                send_message(&mut channel, &WorkerResponse::Submitted { task_id }).await?;
            }
            WorkerRequest::Update { task_ids } => {
                let results = collect_finished(&mut background, &task_ids).await;
                send_message(&mut channel, &WorkerResponse::Updated { results }).await?;
            }
            WorkerRequest::Close => {
                debug!("Close requested");
                break;
            }
        }
    }

    for (task_id, handle) in background {
        if !handle.is_finished() {
            warn!(%task_id, "Abandoning unfinished background task");
        }
    }
    Ok(())
}

/// Connect to a broker at `host:port` and serve until closed
#[instrument(skip(functions))]
pub async fn serve_tcp(
    host: &str,
    port: u16,
    functions: Arc<FunctionRegistry>,
) -> Result<(), TransportError> {
    let channel = SocketChannel::connect((host, port)).await?;
    info!(functions = functions.len(), "Connected to broker");
    serve(channel, functions).await
}

async fn execute(functions: &Arc<FunctionRegistry>, call: Call) -> Outcome {
    let functions = Arc::clone(functions);
    match tokio::task::spawn_blocking(move || functions.execute(&call)).await {
        Ok(outcome) => outcome,
        Err(e) => Err(RemoteError::new("Panic", e.to_string())),
    }
}

/// Take every finished background task among `task_ids`
async fn collect_finished(
    background: &mut HashMap<TaskId, JoinHandle<Outcome>>,
    task_ids: &[TaskId],
) -> HashMap<TaskId, Outcome> {
    let mut results = HashMap::new();
    for task_id in task_ids {
        let finished = background
            .get(task_id)
            .map(JoinHandle::is_finished)
            .unwrap_or(false);
        if !finished {
            continue;
        }
        if let Some(handle) = background.remove(task_id) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(RemoteError::new("Panic", e.to_string())),
            };
            results.insert(*task_id, outcome);
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryChannel;
    use serde_json::json;
    use std::time::Duration;

    fn functions() -> Arc<FunctionRegistry> {
        let functions = FunctionRegistry::new();
        functions.register("sum", |args| {
            let values: Vec<i64> = args.get(0, "values")?;
            Ok(json!(values.iter().sum::<i64>()))
        });
        functions.register("fail", |_| Err(RemoteError::value_error("calc_error value error")));
        functions.into_shared()
    }

    async fn request(channel: &mut MemoryChannel, request: WorkerRequest) -> WorkerResponse {
        send_message(channel, &request).await.unwrap();
        receive_message(channel).await.unwrap()
    }

    #[tokio::test]
    async fn test_task_round_trip() {
        let (mut broker, worker) = MemoryChannel::pair();
        let server = tokio::spawn(serve(worker, functions()));

        let reply = request(
            &mut broker,
            WorkerRequest::Task {
                task_id: TaskId::new(),
                call: Call::new("sum").arg(json!([1, 1])),
            },
        )
        .await;
        assert_eq!(reply, WorkerResponse::Result { value: json!(2) });

        let reply = request(
            &mut broker,
            WorkerRequest::Task {
                task_id: TaskId::new(),
                call: Call::new("fail"),
            },
        )
        .await;
        assert_eq!(
            reply,
            WorkerResponse::Error {
                error: RemoteError::value_error("calc_error value error")
            }
        );

        send_message(&mut broker, &WorkerRequest::Close).await.unwrap();
        assert_eq!(server.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_submit_then_update() {
        let (mut broker, worker) = MemoryChannel::pair();
        tokio::spawn(serve(worker, functions()));

        let task_id = TaskId::new();
        let reply = request(
            &mut broker,
            WorkerRequest::Submit {
                task_id,
                call: Call::new("sum").arg(json!([1, 1])),
            },
        )
        .await;
        assert_eq!(reply, WorkerResponse::Submitted { task_id });

        let mut results = HashMap::new();
        for _ in 0..100 {
            let reply = request(
                &mut broker,
                WorkerRequest::Update {
                    task_ids: vec![task_id],
                },
            )
            .await;
            let WorkerResponse::Updated { results: found } = reply else {
                panic!("expected updated");
            };
            if !found.is_empty() {
                results = found;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(results.get(&task_id), Some(&Ok(json!(2))));

        // fetched results are forgotten
        let reply = request(
            &mut broker,
            WorkerRequest::Update {
                task_ids: vec![task_id],
            },
        )
        .await;
        assert_eq!(
            reply,
            WorkerResponse::Updated {
                results: HashMap::new()
            }
        );
    }

    #[tokio::test]
    async fn test_server_exits_when_broker_drops() {
        let (broker, worker) = MemoryChannel::pair();
        let server = tokio::spawn(serve(worker, functions()));
        drop(broker);
        assert_eq!(server.await.unwrap(), Ok(()));
    }
}
