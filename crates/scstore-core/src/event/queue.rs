//! Worker pool delivering event callbacks off the mutating thread.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use super::{EventArgs, EventInner};
use crate::context::{Context, ContextIds};
use crate::types::{AccessLevels, ScError};

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside an event callback.
pub(crate) fn in_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}

/// One pending callback invocation.
pub(crate) struct Task {
    pub(crate) event: Arc<EventInner>,
    pub(crate) args: EventArgs,
}

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait(&mut count);
        }
    }
}

/// Fixed-size pool fed by an unbounded channel.
pub(crate) struct EventQueue {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("workers", &self.workers.len())
            .field("pending", &*self.pending.count.lock())
            .finish()
    }
}

impl EventQueue {
    pub(crate) fn new(workers: usize, ids: Arc<ContextIds>) -> Result<Self, ScError> {
        let (sender, receiver) = unbounded::<Task>();
        let pending = Arc::new(Pending::default());

        let workers = (0..workers)
            .map(|i| {
                let receiver = receiver.clone();
                let pending = Arc::clone(&pending);
                let ids = Arc::clone(&ids);
                thread::Builder::new()
                    .name(format!("scstore-event-{i}"))
                    .spawn(move || Self::worker_loop(&receiver, &pending, &ids))
                    .map_err(|e| ScError::Io(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            sender: Some(sender),
            workers,
            pending,
        })
    }

    fn worker_loop(receiver: &Receiver<Task>, pending: &Pending, ids: &ContextIds) {
        for task in receiver.iter() {
            let ctx = ids.context(AccessLevels::FULL);
            Self::run(&ctx, &task);
            task.event.release(&ctx);
            pending.done();
        }
    }

    fn run(ctx: &Context, task: &Task) {
        let event = &task.event;
        event.lock.lock(ctx.id());
        if !event.is_destroyed() {
            IN_CALLBACK.with(|flag| flag.set(true));
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (event.callback)(ctx, &task.args)));
            IN_CALLBACK.with(|flag| flag.set(false));
            if outcome.is_err() {
                tracing::warn!(
                    element = %event.element,
                    event = ?event.event_type,
                    "event callback panicked"
                );
            }
        }
        event.lock.unlock(ctx.id());
    }

    /// Queue a task. Gives the task back when the pool is shut down.
    pub(crate) fn push(&self, task: Task) -> Result<(), Task> {
        let Some(sender) = &self.sender else {
            return Err(task);
        };
        self.pending.add();
        sender.send(task).map_err(|e| {
            self.pending.done();
            e.into_inner()
        })
    }

    /// Block until every queued task has run.
    pub(crate) fn flush(&self) {
        self.pending.wait();
    }

    /// Stop accepting tasks, drain the queue and join the workers.
    pub(crate) fn shutdown(&mut self) {
        self.sender = None;
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::warn!("event worker terminated abnormally");
            }
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
