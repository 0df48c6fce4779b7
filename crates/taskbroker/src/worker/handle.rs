//! Channel-backed worker handle

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::{Outcome, WorkerHandle, WorkerSpec};
use crate::error::{LaunchError, TransportError, WorkerError};
use crate::function::Call;
use crate::protocol::{decode, TaskId, WorkerRequest, WorkerResponse};
use crate::transport::{receive_message, send_message, Channel};

/// The execution unit behind a worker handle
#[async_trait]
pub trait WorkerUnit: Send {
    /// Wait for the unit to exit on its own
    async fn join(&mut self);

    /// Tear the unit down immediately
    async fn kill(&mut self);
}

/// Worker handle speaking the wire protocol over a [`Channel`]
pub struct ChannelWorker<C: Channel> {
    id: String,
    channel: C,
    unit: Box<dyn WorkerUnit>,
    in_flight: Option<TaskId>,
    one_shot: bool,
    terminated: bool,
}

impl<C: Channel> ChannelWorker<C> {
    /// Wrap a started unit and run the initializer, if any
    ///
    /// The handshake is bounded by the startup timeout. On failure the
    /// unit is killed before the error is returned.
    #[instrument(skip_all, fields(worker_id = %id))]
    pub async fn start(
        id: String,
        channel: C,
        unit: Box<dyn WorkerUnit>,
        spec: &WorkerSpec,
    ) -> Result<Self, LaunchError> {
        let mut worker = Self {
            id,
            channel,
            unit,
            in_flight: None,
            one_shot: spec.one_shot,
            terminated: false,
        };

        if let Some(init) = &spec.init_function {
            let handshake = tokio::time::timeout(spec.startup_timeout, worker.initialize(init));
            let result = match handshake.await {
                Ok(result) => result,
                Err(_) => Err(LaunchError::Timeout {
                    timeout_ms: spec.startup_timeout.as_millis() as u64,
                }),
            };
            if let Err(e) = result {
                warn!(worker_id = %worker.id, error = %e, "Worker initializer failed");
                worker.terminate(false).await;
                return Err(e);
            }
        }

        debug!(worker_id = %worker.id, one_shot = worker.one_shot, "Worker started");
        Ok(worker)
    }

    async fn initialize(&mut self, init: &Call) -> Result<(), LaunchError> {
        send_message(&mut self.channel, &WorkerRequest::Init { call: init.clone() }).await?;
        let response: WorkerResponse = receive_message(&mut self.channel).await?;
        match response.into_outcome()? {
            Ok(_) => Ok(()),
            Err(remote) => Err(LaunchError::Initializer(remote)),
        }
    }

    fn finish(
        &mut self,
        response: Result<WorkerResponse, TransportError>,
    ) -> Result<Outcome, WorkerError> {
        self.in_flight = None;
        Ok(response?.into_outcome()?)
    }
}

#[async_trait]
impl<C: Channel> WorkerHandle for ChannelWorker<C> {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    fn is_one_shot(&self) -> bool {
        self.one_shot
    }

    async fn dispatch(&mut self, task_id: TaskId, call: &Call) -> Result<(), WorkerError> {
        if self.in_flight.is_some() {
            return Err(WorkerError::Busy(self.id.clone()));
        }
        let request = WorkerRequest::Task {
            task_id,
            call: call.clone(),
        };
        send_message(&mut self.channel, &request).await?;
        self.in_flight = Some(task_id);
        debug!(worker_id = %self.id, %task_id, "Dispatched task");
        Ok(())
    }

    fn poll_result(&mut self) -> Result<Option<Outcome>, WorkerError> {
        if self.in_flight.is_none() {
            return Ok(None);
        }
        let response = match self.channel.try_receive() {
            Ok(None) => return Ok(None),
            Ok(Some(frame)) => decode::<WorkerResponse>(&frame),
            Err(e) => Err(e),
        };
        self.finish(response).map(Some)
    }

    async fn next_result(&mut self) -> Result<Outcome, WorkerError> {
        if self.in_flight.is_none() {
            return Err(WorkerError::Idle(self.id.clone()));
        }
        let response = receive_message(&mut self.channel).await;
        self.finish(response)
    }

    async fn submit(&mut self, task_id: TaskId, call: &Call) -> Result<(), WorkerError> {
        if self.in_flight.is_some() {
            return Err(WorkerError::Busy(self.id.clone()));
        }
        let request = WorkerRequest::Submit {
            task_id,
            call: call.clone(),
        };
        send_message(&mut self.channel, &request).await?;
        match receive_message(&mut self.channel).await? {
            WorkerResponse::Submitted { task_id: accepted } if accepted == task_id => {
                debug!(worker_id = %self.id, %task_id, "Submitted background task");
                Ok(())
            }
            other => Err(TransportError::Protocol(format!(
                "expected submission of {}, got {:?}",
                task_id, other
            ))
            .into()),
        }
    }

    async fn update(
        &mut self,
        task_ids: &[TaskId],
    ) -> Result<HashMap<TaskId, Outcome>, WorkerError> {
        if self.in_flight.is_some() {
            return Err(WorkerError::Busy(self.id.clone()));
        }
        let request = WorkerRequest::Update {
            task_ids: task_ids.to_vec(),
        };
        send_message(&mut self.channel, &request).await?;
        match receive_message(&mut self.channel).await? {
            WorkerResponse::Updated { results } => Ok(results),
            other => Err(TransportError::Protocol(format!(
                "expected background results, got {:?}",
                other
            ))
            .into()),
        }
    }

    async fn terminate(&mut self, wait: bool) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        if wait {
            if self.in_flight.is_some() {
                if let Err(e) = self.next_result().await {
                    debug!(worker_id = %self.id, error = %e, "In-flight task lost during shutdown");
                }
            }
            if let Err(e) = send_message(&mut self.channel, &WorkerRequest::Close).await {
                debug!(worker_id = %self.id, error = %e, "Worker already gone");
            }
            self.channel.close().await;
            self.unit.join().await;
        } else {
            self.in_flight = None;
            self.channel.close().await;
            self.unit.kill().await;
        }

        debug!(worker_id = %self.id, graceful = wait, "Worker terminated");
    }
}
