//! Worker slots
//!
//! A slot owns one worker handle and runs one task at a time. Block slots
//! live for the whole pool and relaunch their worker when it dies; one-shot
//! slots launch a worker for a single task and exit.
//!
//! Block slots may also hold any number of background tasks, submitted to
//! the worker without occupying the slot. Their results are collected on a
//! timer and on explicit refresh requests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::Launcher;
use crate::error::{LaunchError, TaskError, TransportError, WorkerError};
use crate::function::Call;
use crate::protocol::TaskId;
use crate::registry::FutureRegistry;
use crate::worker::{WorkerHandle, WorkerSpec};

pub(crate) type SlotId = usize;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A task taken off the queue
#[derive(Debug)]
pub(crate) struct QueuedTask {
    pub id: TaskId,
    pub call: Call,
    /// Submit without occupying the slot
    pub background: bool,
}

/// Reported by slots to the dispatch loop
///
/// Events from one slot arrive in the order the slot sent them.
#[derive(Debug)]
pub(crate) enum SlotEvent {
    /// A task resolved
    Finished {
        slot: SlotId,
        task_id: TaskId,
        outcome: Result<Value, TaskError>,
    },
    /// The slot has a live worker and can take another task
    Idle { slot: SlotId },
    /// The slot lost its worker and could not start a new one
    Retired { slot: SlotId, error: LaunchError },
    /// A background task's future was gone before its result came in
    Abandoned { slot: SlotId, task_id: TaskId },
    /// Answer to [`SlotCommand::Refresh`]
    Refreshed { slot: SlotId, resolved: usize },
}

pub(crate) enum SlotCommand {
    Run(QueuedTask),
    /// Collect finished background tasks now
    Refresh,
    Stop,
}

/// Shared by all slots of one broker
#[derive(Clone)]
pub(crate) struct SlotContext {
    pub launcher: Arc<dyn Launcher>,
    pub spec: WorkerSpec,
    pub registry: Arc<FutureRegistry>,
    pub events: mpsc::UnboundedSender<SlotEvent>,
    pub kill: CancellationToken,
}

impl SlotContext {
    fn send(&self, event: SlotEvent) {
        // the loop only drops its receiver after joining every slot
        let _ = self.events.send(event);
    }

    fn finished(&self, slot: SlotId, task_id: TaskId, outcome: Result<Value, TaskError>) {
        self.send(SlotEvent::Finished {
            slot,
            task_id,
            outcome,
        });
    }
}

/// The worker broke while serving `task_id` (if any)
struct Lost {
    task_id: Option<TaskId>,
    error: TransportError,
}

enum Step {
    Kill,
    Stop,
    Run(QueuedTask),
    Refresh { requested: bool },
}

/// Persistent slot: runs commands until stopped or killed
pub(crate) async fn run_block_slot(
    slot: SlotId,
    mut worker: Box<dyn WorkerHandle>,
    mut commands: mpsc::UnboundedReceiver<SlotCommand>,
    ctx: SlotContext,
) {
    let mut background: HashSet<TaskId> = HashSet::new();
    let mut ticker = tokio::time::interval(ctx.spec.poll_interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let step = tokio::select! {
            biased;
            _ = ctx.kill.cancelled() => Step::Kill,
            command = commands.recv() => match command {
                Some(SlotCommand::Run(task)) => Step::Run(task),
                Some(SlotCommand::Refresh) => Step::Refresh { requested: true },
                Some(SlotCommand::Stop) | None => Step::Stop,
            },
            _ = ticker.tick(), if !background.is_empty() => Step::Refresh { requested: false },
        };

        let (lost, requested) = match step {
            Step::Kill => {
                worker.terminate(false).await;
                return;
            }
            Step::Stop => {
                if !background.is_empty() {
                    warn!(slot, outstanding = background.len(), "Stopping with background tasks");
                }
                worker.terminate(true).await;
                debug!(slot, "Slot stopped");
                return;
            }
            Step::Run(task) => {
                let result = tokio::select! {
                    biased;
                    _ = ctx.kill.cancelled() => {
                        worker.terminate(false).await;
                        return;
                    }
                    result = run(slot, worker.as_mut(), &task, &mut background, &ctx) => result,
                };
                match result {
                    Ok(()) => {
                        ctx.send(SlotEvent::Idle { slot });
                        continue;
                    }
                    Err(error) => (
                        Lost {
                            task_id: Some(task.id),
                            error,
                        },
                        false,
                    ),
                }
            }
            Step::Refresh { requested } => {
                let result = tokio::select! {
                    biased;
                    _ = ctx.kill.cancelled() => {
                        worker.terminate(false).await;
                        return;
                    }
                    result = refresh(slot, worker.as_mut(), &mut background, &ctx) => result,
                };
                match result {
                    Ok(resolved) => {
                        if requested {
                            ctx.send(SlotEvent::Refreshed { slot, resolved });
                        }
                        continue;
                    }
                    Err(error) => (
                        Lost {
                            task_id: None,
                            error,
                        },
                        requested,
                    ),
                }
            }
        };

        // every affected future resolves before the relaunch starts
        warn!(slot, worker_id = %worker.id(), error = %lost.error, background = background.len(), "Worker lost, relaunching");
        let failed = fail_tasks(slot, lost, &mut background, &ctx);
        if requested {
            ctx.send(SlotEvent::Refreshed {
                slot,
                resolved: failed,
            });
        }
        worker.terminate(false).await;

        let relaunched = tokio::select! {
            biased;
            _ = ctx.kill.cancelled() => return,
            relaunched = ctx.launcher.launch(&ctx.spec) => relaunched,
        };
        match relaunched {
            Ok(fresh) => {
                debug!(slot, worker_id = %fresh.id(), "Worker relaunched");
                worker = fresh;
                ctx.send(SlotEvent::Idle { slot });
            }
            Err(error) => {
                warn!(slot, error = %error, "Relaunch failed, retiring slot");
                ctx.send(SlotEvent::Retired { slot, error });
                return;
            }
        }
    }
}

/// One-shot slot: launch, run one task, tear down
///
/// Background tasks run like any other task here.
pub(crate) async fn run_one_shot_slot(slot: SlotId, task: QueuedTask, ctx: SlotContext) {
    let launched = tokio::select! {
        biased;
        _ = ctx.kill.cancelled() => return,
        launched = ctx.launcher.launch(&ctx.spec) => launched,
    };

    let outcome = match launched {
        Err(e) => {
            warn!(slot, task_id = %task.id, error = %e, "One-shot worker failed to launch");
            Err(TaskError::Launch(e))
        }
        Ok(mut worker) => {
            let result = tokio::select! {
                biased;
                _ = ctx.kill.cancelled() => {
                    worker.terminate(false).await;
                    return;
                }
                result = run_task(worker.as_mut(), &task) => result,
            };
            match result {
                Ok(outcome) => {
                    worker.terminate(true).await;
                    outcome
                }
                Err(e) => {
                    worker.terminate(false).await;
                    Err(TaskError::Transport(e))
                }
            }
        }
    };

    ctx.finished(slot, task.id, outcome);
    ctx.send(SlotEvent::Idle { slot });
}

/// Run `task` on a block slot's worker
///
/// A foreground task resolves before this returns. A background task is
/// only handed over to the worker.
async fn run(
    slot: SlotId,
    worker: &mut dyn WorkerHandle,
    task: &QueuedTask,
    background: &mut HashSet<TaskId>,
    ctx: &SlotContext,
) -> Result<(), TransportError> {
    if task.background {
        worker
            .submit(task.id, &task.call)
            .await
            .map_err(worker_failure)?;
        background.insert(task.id);
        debug!(slot, task_id = %task.id, pending = background.len(), "Background task submitted");
    } else {
        let outcome = run_task(worker, task).await?;
        ctx.finished(slot, task.id, outcome);
    }
    Ok(())
}

/// Resolve every finished background task; returns how many resolved
async fn refresh(
    slot: SlotId,
    worker: &mut dyn WorkerHandle,
    background: &mut HashSet<TaskId>,
    ctx: &SlotContext,
) -> Result<usize, TransportError> {
    let outstanding = ctx.registry.snapshot_ids();
    background.retain(|&task_id| {
        let known = outstanding.contains(&task_id);
        if !known {
            ctx.send(SlotEvent::Abandoned { slot, task_id });
        }
        known
    });
    if background.is_empty() {
        return Ok(0);
    }

    let task_ids: Vec<TaskId> = background.iter().copied().collect();
    let results = worker.update(&task_ids).await.map_err(worker_failure)?;

    let mut resolved = 0;
    for (task_id, outcome) in results {
        if background.remove(&task_id) {
            ctx.finished(slot, task_id, outcome.map_err(TaskError::Remote));
            resolved += 1;
        } else {
            warn!(slot, %task_id, "Worker returned a result for an unknown background task");
        }
    }
    Ok(resolved)
}

/// Fail the broken task and every background task with the transport error
fn fail_tasks(
    slot: SlotId,
    lost: Lost,
    background: &mut HashSet<TaskId>,
    ctx: &SlotContext,
) -> usize {
    let Lost { task_id, error } = lost;
    let mut failed = 0;
    for task_id in task_id.into_iter().chain(background.drain()) {
        ctx.finished(slot, task_id, Err(TaskError::Transport(error.clone())));
        failed += 1;
    }
    failed
}

/// Dispatch one task and wait for its outcome
///
/// `Err` means the worker itself failed; remote errors are part of `Ok`.
async fn run_task(
    worker: &mut dyn WorkerHandle,
    task: &QueuedTask,
) -> Result<Result<Value, TaskError>, TransportError> {
    worker
        .dispatch(task.id, &task.call)
        .await
        .map_err(worker_failure)?;
    let outcome = worker.next_result().await.map_err(worker_failure)?;
    Ok(outcome.map_err(TaskError::Remote))
}

fn worker_failure(e: WorkerError) -> TransportError {
    match e {
        WorkerError::Transport(e) => e,
        other => TransportError::Protocol(other.to_string()),
    }
}
