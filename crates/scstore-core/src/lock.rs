//! # Owner Locks
//!
//! Reentrant spin lock owned by a context id. Used by segment sections and
//! by events. The owner/recursion pair is only changed inside a tiny critical
//! section guarded by a compare-and-swap flag; acquire on entry and release
//! on exit order every relaxed access made while the lock is held.

use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;

use crate::primitives::SPIN_BEFORE_YIELD;
use crate::segment::corrupted;

const NO_OWNER: u64 = 0;

#[derive(Debug, Default)]
pub(crate) struct OwnerLock {
    internal: AtomicBool,
    owner: AtomicU64,
    recursion: AtomicU32,
}

impl OwnerLock {
    pub(crate) const fn new() -> Self {
        Self {
            internal: AtomicBool::new(false),
            owner: AtomicU64::new(NO_OWNER),
            recursion: AtomicU32::new(0),
        }
    }

    fn enter(&self) -> bool {
        self.internal
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn leave(&self) {
        self.internal.store(false, Ordering::Release);
    }

    /// One attempt to claim the lock for `owner`.
    fn claim(&self, owner: u64) -> bool {
        if !self.enter() {
            return false;
        }
        let current = self.owner.load(Ordering::Relaxed);
        let claimed = current == NO_OWNER || current == owner;
        if claimed {
            self.owner.store(owner, Ordering::Relaxed);
            self.recursion.fetch_add(1, Ordering::Relaxed);
        }
        self.leave();
        claimed
    }

    /// Block (spinning, then yielding) until `owner` holds the lock.
    pub(crate) fn lock(&self, owner: u64) {
        let mut spins = 0u32;
        while !self.claim(owner) {
            if spins < SPIN_BEFORE_YIELD {
                spins += 1;
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }

    /// Try to claim the lock at most `attempts` times (at least once).
    pub(crate) fn lock_try(&self, owner: u64, attempts: u32) -> bool {
        for _ in 0..attempts.max(1) {
            if self.claim(owner) {
                return true;
            }
            hint::spin_loop();
        }
        false
    }

    /// Release one level of ownership held by `owner`.
    pub(crate) fn unlock(&self, owner: u64) {
        while !self.enter() {
            hint::spin_loop();
        }
        if self.owner.load(Ordering::Relaxed) != owner {
            self.leave();
            corrupted(format_args!(
                "lock released by context {owner} that does not own it"
            ));
        }
        if self.recursion.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(NO_OWNER, Ordering::Relaxed);
        }
        self.leave();
    }

    #[cfg(test)]
    pub(crate) fn owner(&self) -> u64 {
        self.owner.load(Ordering::Relaxed)
    }
}
