//! # Events
//!
//! Subscriptions to structural changes of one element.
//!
//! ## Table
//!
//! Events live in one table mapping element address to its subscriptions,
//! guarded by a single `parking_lot::Mutex`. The table lock is never held
//! while a section lock is being acquired.
//!
//! ## Lifetime
//!
//! An event carries a reference count whose top bit is the destroy flag.
//! The subscription itself holds one reference; every queued callback holds
//! another. Whoever sets the destroy flag drops the subscription reference,
//! and whoever drops the last reference frees the event: the subscribed
//! element is unpinned and the delete callback (if any) runs.
//!
//! ## Dispatch
//!
//! `emit` never runs callbacks itself. Matching events are queued on a worker
//! pool; each worker invokes the callback with a fresh full-access context
//! while holding the event's owner lock, so a destroyed event never starts a
//! callback. `destroy` from outside a callback waits for a running one; from
//! inside a callback it only sets the destroy flag, so two callbacks tearing
//! down each other's events cannot wait on one another.

mod queue;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

pub(crate) use queue::EventQueue;
use queue::Task;

use crate::context::Context;
use crate::lock::OwnerLock;
use crate::segment::ElementPin;
use crate::types::{AccessLevels, Addr, EventType, ScError};

const DESTROY_BIT: u32 = 1 << 31;
const REFS_MASK: u32 = !DESTROY_BIT;

/// What a callback is told about one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventArgs {
    pub event_type: EventType,
    /// The subscribed element.
    pub element: Addr,
    /// The arc added or removed; empty for other event types.
    pub arc: Addr,
    /// The arc's other endpoint; empty for other event types.
    pub other: Addr,
}

/// Subscriber callback. Runs on a worker thread.
pub type EventCallback = Box<dyn Fn(&Context, &EventArgs) + Send + Sync>;

/// Runs once when the event is finally freed, with the subscribed address.
pub type DeleteCallback = Box<dyn FnOnce(Addr) + Send>;

pub(crate) struct EventInner {
    element: Addr,
    event_type: EventType,
    levels: AccessLevels,
    callback: EventCallback,
    delete_callback: Mutex<Option<DeleteCallback>>,
    refs: AtomicU32,
    lock: OwnerLock,
    pin: ElementPin,
}

impl fmt::Debug for EventInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventInner")
            .field("element", &self.element)
            .field("event_type", &self.event_type)
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventInner {
    fn is_destroyed(&self) -> bool {
        self.refs.load(Ordering::Acquire) & DESTROY_BIT != 0
    }

    /// Take a reference unless the event is destroyed.
    fn acquire(&self) -> bool {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current & DESTROY_BIT != 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Set the destroy flag; true for the caller that set it.
    fn mark_destroyed(&self) -> bool {
        self.refs.fetch_or(DESTROY_BIT, Ordering::AcqRel) & DESTROY_BIT == 0
    }

    /// Drop one reference, freeing the event when it was the last one.
    fn release(&self, ctx: &Context) {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        if previous & REFS_MASK == 1 && previous & DESTROY_BIT != 0 {
            self.free(ctx);
        }
    }

    fn free(&self, ctx: &Context) {
        self.pin.release(ctx.id());
        if let Some(on_delete) = self.delete_callback.lock().take() {
            on_delete(self.element);
        }
    }
}

/// Handle to a live subscription. Pass it to `Storage::event_destroy`.
#[derive(Debug)]
pub struct EventHandle {
    inner: Arc<EventInner>,
}

impl EventHandle {
    #[must_use]
    pub fn element(&self) -> Addr {
        self.inner.element
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.inner.event_type
    }

    /// Whether the subscription has been torn down (for example because
    /// its element was deleted).
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Event table plus dispatch pool.
#[derive(Debug)]
pub(crate) struct EventRegistry {
    table: Mutex<HashMap<Addr, Vec<Arc<EventInner>>>>,
    queue: EventQueue,
}

impl EventRegistry {
    pub(crate) fn new(queue: EventQueue) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            queue,
        }
    }

    /// Register a subscription on an element the caller already pinned.
    pub(crate) fn subscribe(
        &self,
        ctx: &Context,
        element: Addr,
        event_type: EventType,
        pin: ElementPin,
        callback: EventCallback,
        delete_callback: Option<DeleteCallback>,
    ) -> EventHandle {
        let inner = Arc::new(EventInner {
            element,
            event_type,
            levels: ctx.access_levels(),
            callback,
            delete_callback: Mutex::new(delete_callback),
            refs: AtomicU32::new(1),
            lock: OwnerLock::new(),
            pin,
        });
        self.table
            .lock()
            .entry(element)
            .or_default()
            .push(Arc::clone(&inner));
        EventHandle { inner }
    }

    /// Tear down one subscription. Outside a callback, waits for a callback
    /// of this event running on another context; inside one, does not wait
    /// and the running callback frees the event when it finishes.
    pub(crate) fn destroy(&self, ctx: &Context, handle: EventHandle) -> Result<(), ScError> {
        let inner = handle.inner;
        {
            let mut table = self.table.lock();
            if let Some(events) = table.get_mut(&inner.element) {
                events.retain(|e| !Arc::ptr_eq(e, &inner));
                if events.is_empty() {
                    table.remove(&inner.element);
                }
            }
        }

        let first = if queue::in_callback() {
            inner.mark_destroyed()
        } else {
            inner.lock.lock(ctx.id());
            let first = inner.mark_destroyed();
            inner.lock.unlock(ctx.id());
            first
        };
        if first {
            inner.release(ctx);
        }
        Ok(())
    }

    /// Queue callbacks of every event on `element` interested in `event_type`
    /// whose owner may read the element.
    pub(crate) fn emit(
        &self,
        ctx: &Context,
        element: Addr,
        element_access: AccessLevels,
        event_type: EventType,
        arc: Addr,
        other: Addr,
    ) {
        let targets: Vec<Arc<EventInner>> = {
            let table = self.table.lock();
            let Some(events) = table.get(&element) else {
                return;
            };
            events
                .iter()
                .filter(|e| e.event_type == event_type && e.levels.can_read(element_access))
                .filter(|e| e.acquire())
                .cloned()
                .collect()
        };

        let args = EventArgs {
            event_type,
            element,
            arc,
            other,
        };
        for event in targets {
            if let Err(task) = self.queue.push(Task { event, args }) {
                task.event.release(ctx);
            }
        }
    }

    /// Destroy every event on a deleted element. Does not wait for running
    /// callbacks; they see the destroy flag and the last one frees the event.
    pub(crate) fn notify_element_deleted(&self, ctx: &Context, element: Addr) {
        let events = self.table.lock().remove(&element).unwrap_or_default();
        for event in events {
            if event.mark_destroyed() {
                event.release(ctx);
            }
        }
    }

    pub(crate) fn flush(&self) {
        self.queue.flush();
    }

    /// Destroy all remaining subscriptions and stop the pool.
    pub(crate) fn shutdown(&mut self, ctx: &Context) {
        self.queue.flush();
        let events: Vec<_> = self.table.lock().drain().flat_map(|(_, v)| v).collect();
        for event in events {
            if event.mark_destroyed() {
                event.release(ctx);
            }
        }
        self.queue.shutdown();
    }

    #[cfg(test)]
    pub(crate) fn subscriptions(&self, element: Addr) -> usize {
        self.table.lock().get(&element).map_or(0, Vec::len)
    }
}
