//! Weak reference access gate
//!
//! While the collector processes references it disables weak reference reads.
//! Mutators that need to read a weak referent wait here while staying
//! `Runnable`, so an empty checkpoint would never see them pass a suspend
//! point. They instead answer empty checkpoints from inside the wait loop,
//! and `ThreadList::run_empty_checkpoint` broadcasts the condition to wake them.

use crate::locks::{LockLevel, OrderedCondvar, OrderedMutex};
use crate::thread::ManagedThread;
use std::sync::atomic::{AtomicBool, Ordering};

/// Enabled/disabled flag plus the condition weak readers block on.
pub struct WeakRefAccess {
    enabled: AtomicBool,
    gate: OrderedMutex<()>,
    cond: OrderedCondvar,
}

impl Default for WeakRefAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl WeakRefAccess {
    /// Starts enabled
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            gate: OrderedMutex::new("weak ref access", LockLevel::ReferenceProcessor, ()),
            cond: OrderedCondvar::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        let _gate = self.gate.lock();
        self.enabled.store(false, Ordering::Release);
    }

    /// Re-enable weak reads and wake every waiter.
    pub fn enable(&self) {
        let _gate = self.gate.lock();
        self.enabled.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Wake waiters so they can answer a pending empty checkpoint.
    pub fn broadcast_for_checkpoint(&self) {
        let _gate = self.gate.lock();
        self.cond.notify_all();
    }

    /// Block until weak reads are enabled.
    ///
    /// A `Runnable` caller answers empty checkpoints while it waits.
    pub fn wait_until_enabled(&self, thread: &ManagedThread) {
        if self.is_enabled() {
            return;
        }
        let runnable = thread.state().is_runnable();
        let mut gate = self.gate.lock();
        while !self.enabled.load(Ordering::Acquire) {
            if runnable {
                thread.check_empty_checkpoint_from_weak_ref_access(LockLevel::ReferenceProcessor);
            }
            self.cond.wait(&mut gate);
        }
    }
}
