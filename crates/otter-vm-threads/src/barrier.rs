//! Suspend and checkpoint barriers
//!
//! Two counting barriers, both owned by the requesting operation:
//!
//! - [`SuspendBarrier`]: counts down once per target thread that reaches a
//!   suspended state. Targets decrement it from their transition code, or the
//!   requester decrements it on behalf of a target it found already suspended.
//! - [`CheckpointBarrier`]: counts checkpoint closures that finished. Passing
//!   may happen before the waiter adds its expected count, so the count may go
//!   transiently negative.

use crate::locks::{LockLevel, OrderedCondvar, OrderedMutex};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

/// Atomic countdown released when every target thread has suspended.
pub struct SuspendBarrier {
    pending: AtomicI32,
    lock: OrderedMutex<()>,
    cond: OrderedCondvar,
}

impl SuspendBarrier {
    /// Barrier expecting `count` targets
    pub fn new(count: i32) -> Self {
        Self {
            pending: AtomicI32::new(count),
            lock: OrderedMutex::new("suspend barrier", LockLevel::SuspendBarrier, ()),
            cond: OrderedCondvar::new(),
        }
    }

    /// Targets that have not suspended yet
    pub fn pending(&self) -> i32 {
        self.pending.load(Ordering::Acquire)
    }

    /// One target reached a suspended state.
    pub(crate) fn pass(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            fatal!("suspend barrier decremented below zero (was {prev})");
        }
        if prev == 1 {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }

    /// Block until the count reaches zero. Returns `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.pending() == 0 {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            if self.pending() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cond.wait_for(&mut guard, deadline - now);
        }
    }
}

/// Counting barrier for checkpoint completion.
pub struct CheckpointBarrier {
    count: OrderedMutex<i32>,
    cond: OrderedCondvar,
}

impl CheckpointBarrier {
    pub fn new(count: i32) -> Self {
        Self {
            count: OrderedMutex::new("checkpoint barrier", LockLevel::SuspendBarrier, count),
            cond: OrderedCondvar::new(),
        }
    }

    pub fn count(&self) -> i32 {
        *self.count.lock()
    }

    /// One participant is done.
    pub fn pass(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Add `delta` expected passes and wait until all have happened.
    pub fn increment(&self, delta: i32) {
        let mut count = self.count.lock();
        *count += delta;
        while *count != 0 {
            self.cond.wait(&mut count);
        }
    }

    /// Like [`increment`](Self::increment) with a bound. Returns `true` if it timed out.
    pub fn increment_timeout(&self, delta: i32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        *count += delta;
        while *count != 0 {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            self.cond.wait_for(&mut count, deadline - now);
        }
        false
    }
}
