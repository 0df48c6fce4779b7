//! The dispatch loop
//!
//! One loop per broker. It pulls tasks off the FIFO queue in arrival order,
//! hands each to an idle slot, resolves futures as slots report back, and
//! carries out shutdown.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::slot::{
    run_block_slot, run_one_shot_slot, QueuedTask, SlotCommand, SlotContext, SlotEvent, SlotId,
};
use crate::error::{LaunchError, TaskError, TransportError};
use crate::registry::FutureRegistry;
use crate::worker::WorkerHandle;

/// Requests from the broker handle
pub(crate) enum Control {
    Shutdown {
        wait: bool,
        done: oneshot::Sender<()>,
    },
    /// Collect finished background tasks on every slot
    Update { done: oneshot::Sender<usize> },
}

/// An update waiting for its slots to answer
struct PendingUpdate {
    waiting: HashSet<SlotId>,
    resolved: usize,
    done: oneshot::Sender<usize>,
}

struct BlockSlot {
    commands: mpsc::UnboundedSender<SlotCommand>,
    idle: bool,
}

enum Slots {
    Block {
        slots: BTreeMap<SlotId, BlockSlot>,
        last_error: Option<LaunchError>,
    },
    OneShot {
        max_workers: usize,
        active: usize,
        next_slot: SlotId,
    },
}

pub(crate) struct DispatchLoop {
    registry: Arc<FutureRegistry>,
    queue: mpsc::UnboundedReceiver<QueuedTask>,
    control: mpsc::UnboundedReceiver<Control>,
    events: mpsc::UnboundedReceiver<SlotEvent>,
    ctx: SlotContext,
    slots: Slots,
    tasks: JoinSet<()>,
    in_flight: usize,
    draining: bool,
    waiters: Vec<oneshot::Sender<()>>,
    updates: Vec<PendingUpdate>,
    closed: watch::Sender<bool>,
}

impl DispatchLoop {
    /// Block allocation: one persistent slot per already-started worker
    pub(crate) fn with_workers(
        registry: Arc<FutureRegistry>,
        queue: mpsc::UnboundedReceiver<QueuedTask>,
        control: mpsc::UnboundedReceiver<Control>,
        events: mpsc::UnboundedReceiver<SlotEvent>,
        ctx: SlotContext,
        workers: Vec<Box<dyn WorkerHandle>>,
        closed: watch::Sender<bool>,
    ) -> Self {
        let mut tasks = JoinSet::new();
        let mut slots = BTreeMap::new();
        for (slot, worker) in workers.into_iter().enumerate() {
            let (tx, rx) = mpsc::unbounded_channel();
            tasks.spawn(run_block_slot(slot, worker, rx, ctx.clone()));
            slots.insert(
                slot,
                BlockSlot {
                    commands: tx,
                    idle: true,
                },
            );
        }

        Self::new(
            registry,
            queue,
            control,
            events,
            ctx,
            Slots::Block {
                slots,
                last_error: None,
            },
            tasks,
            closed,
        )
    }

    /// One-shot: up to `max_workers` concurrent single-task workers
    pub(crate) fn one_shot(
        registry: Arc<FutureRegistry>,
        queue: mpsc::UnboundedReceiver<QueuedTask>,
        control: mpsc::UnboundedReceiver<Control>,
        events: mpsc::UnboundedReceiver<SlotEvent>,
        ctx: SlotContext,
        max_workers: usize,
        closed: watch::Sender<bool>,
    ) -> Self {
        Self::new(
            registry,
            queue,
            control,
            events,
            ctx,
            Slots::OneShot {
                max_workers,
                active: 0,
                next_slot: 0,
            },
            JoinSet::new(),
            closed,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        registry: Arc<FutureRegistry>,
        queue: mpsc::UnboundedReceiver<QueuedTask>,
        control: mpsc::UnboundedReceiver<Control>,
        events: mpsc::UnboundedReceiver<SlotEvent>,
        ctx: SlotContext,
        slots: Slots,
        tasks: JoinSet<()>,
        closed: watch::Sender<bool>,
    ) -> Self {
        Self {
            registry,
            queue,
            control,
            events,
            ctx,
            slots,
            tasks,
            in_flight: 0,
            draining: false,
            waiters: Vec::new(),
            updates: Vec::new(),
            closed,
        }
    }

    pub(crate) async fn run(mut self) {
        let forced = loop {
            if self.draining && self.in_flight == 0 && self.registry.is_empty() {
                break false;
            }

            let can_dispatch = self.has_capacity();
            tokio::select! {
                biased;
                control = self.control.recv() => match control {
                    Some(Control::Shutdown { wait, done }) => {
                        self.waiters.push(done);
                        if !wait {
                            break true;
                        }
                        info!(in_flight = self.in_flight, outstanding = self.registry.len(), "Draining broker");
                        self.draining = true;
                    }
                    Some(Control::Update { done }) => self.start_update(done),
                    None => {
                        debug!("Broker handle dropped");
                        break true;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                task = self.queue.recv(), if can_dispatch => match task {
                    Some(task) => self.dispatch(task),
                    // queue senders live in the broker handle, so this only
                    // happens once the handle is gone
                    None => break true,
                },
            }
        };

        self.close(forced).await;
    }

    fn has_capacity(&self) -> bool {
        match &self.slots {
            // with no slots left the queue is drained into launch failures
            Slots::Block { slots, .. } => slots.is_empty() || slots.values().any(|s| s.idle),
            Slots::OneShot {
                max_workers,
                active,
                ..
            } => active < max_workers,
        }
    }

    fn dispatch(&mut self, task: QueuedTask) {
        if !self.registry.mark_running(task.id) {
            debug!(task_id = %task.id, "Skipping cancelled task");
            return;
        }

        match &mut self.slots {
            Slots::Block { slots, last_error } => {
                let Some((&slot, idle)) = slots.iter_mut().find(|(_, s)| s.idle) else {
                    let error = last_error
                        .clone()
                        .unwrap_or_else(|| LaunchError::Spawn("no workers available".to_string()));
                    self.registry.resolve(task.id, Err(TaskError::Launch(error)));
                    return;
                };
                let task_id = task.id;
                if idle.commands.send(SlotCommand::Run(task)).is_err() {
                    warn!(slot, %task_id, "Slot is gone");
                    slots.remove(&slot);
                    self.registry
                        .resolve(task_id, Err(TaskError::Transport(TransportError::Closed)));
                    return;
                }
                idle.idle = false;
                debug!(slot, %task_id, "Task dispatched");
            }
            Slots::OneShot {
                active, next_slot, ..
            } => {
                let slot = *next_slot;
                *next_slot += 1;
                *active += 1;
                debug!(slot, task_id = %task.id, "Launching one-shot worker");
                self.tasks
                    .spawn(run_one_shot_slot(slot, task, self.ctx.clone()));
            }
        }
        self.in_flight += 1;
    }

    fn handle_event(&mut self, event: SlotEvent) {
        match event {
            SlotEvent::Finished {
                slot,
                task_id,
                outcome,
            } => {
                debug!(slot, %task_id, ok = outcome.is_ok(), "Task finished");
                self.in_flight = self.in_flight.saturating_sub(1);
                self.registry.resolve(task_id, outcome);
            }
            SlotEvent::Abandoned { slot, task_id } => {
                debug!(slot, %task_id, "Background task abandoned");
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            SlotEvent::Idle { slot } => match &mut self.slots {
                Slots::Block { slots, .. } => {
                    if let Some(s) = slots.get_mut(&slot) {
                        s.idle = true;
                    }
                }
                Slots::OneShot { active, .. } => {
                    *active = active.saturating_sub(1);
                }
            },
            SlotEvent::Retired { slot, error } => {
                if let Slots::Block { slots, last_error } = &mut self.slots {
                    slots.remove(&slot);
                    warn!(slot, error = %error, remaining = slots.len(), "Slot retired");
                    *last_error = Some(error);
                }
                self.slot_answered(slot, 0);
            }
            SlotEvent::Refreshed { slot, resolved } => self.slot_answered(slot, resolved),
        }
    }

    /// Ask every block slot to collect its background results
    fn start_update(&mut self, done: oneshot::Sender<usize>) {
        let mut waiting = HashSet::new();
        if let Slots::Block { slots, .. } = &self.slots {
            for (&slot, s) in slots {
                if s.commands.send(SlotCommand::Refresh).is_ok() {
                    waiting.insert(slot);
                }
            }
        }

        if waiting.is_empty() {
            let _ = done.send(0);
            return;
        }
        self.updates.push(PendingUpdate {
            waiting,
            resolved: 0,
            done,
        });
    }

    fn slot_answered(&mut self, slot: SlotId, resolved: usize) {
        let mut i = 0;
        while i < self.updates.len() {
            let update = &mut self.updates[i];
            if update.waiting.remove(&slot) {
                update.resolved += resolved;
            }
            if update.waiting.is_empty() {
                let update = self.updates.swap_remove(i);
                debug!(resolved = update.resolved, "Update complete");
                let _ = update.done.send(update.resolved);
            } else {
                i += 1;
            }
        }
    }

    async fn close(mut self, forced: bool) {
        if forced {
            let cancelled = self.registry.cancel_all();
            info!(cancelled, "Terminating workers");
            self.ctx.kill.cancel();
        } else if let Slots::Block { slots, .. } = &self.slots {
            for slot in slots.values() {
                let _ = slot.commands.send(SlotCommand::Stop);
            }
        }

        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Slot task failed");
            }
        }

        // whatever is left in the queue was cancelled before it ran
        self.queue.close();
        while self.queue.try_recv().is_ok() {}

        let _ = self.closed.send(true);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!(forced, "Broker closed");
    }
}
