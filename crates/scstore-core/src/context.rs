//! # Contexts
//!
//! A [`Context`] is the capability token every operation is performed with:
//! a process-unique id (the owner tag of section locks) plus the caller's
//! access levels. Contexts are created by the storage, may move between
//! threads, but are never shared by two threads at once (`!Sync`).

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::AccessLevels;

/// Per-caller capability token.
#[derive(Debug)]
pub struct Context {
    id: u64,
    levels: AccessLevels,
    _not_sync: PhantomData<Cell<()>>,
}

impl Context {
    /// Lock owner id. Never 0.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn access_levels(&self) -> AccessLevels {
        self.levels
    }

    #[must_use]
    pub fn can_read(&self, element: AccessLevels) -> bool {
        self.levels.can_read(element)
    }

    #[must_use]
    pub fn can_write(&self, element: AccessLevels) -> bool {
        self.levels.can_write(element)
    }
}

/// Source of context ids, shared by the storage and the event workers.
#[derive(Debug)]
pub(crate) struct ContextIds {
    next: AtomicU64,
}

impl ContextIds {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn context(&self, levels: AccessLevels) -> Context {
        Context {
            id: self.next.fetch_add(1, Ordering::Relaxed),
            levels,
            _not_sync: PhantomData,
        }
    }
}
