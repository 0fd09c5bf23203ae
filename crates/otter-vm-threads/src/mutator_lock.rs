//! The logical mutator lock
//!
//! A reader/writer lock over heap and runtime metadata with one twist: a
//! thread in the `Runnable` state holds it shared without touching the
//! underlying primitive. Exclusive ownership is only taken by
//! `ThreadList::suspend_all` after every other thread has been driven out of
//! `Runnable`, so runnable threads never need to be tracked by the raw lock.
//!
//! ## Design
//!
//! - `parking_lot::RawRwLock` carries explicit shared and exclusive holds
//! - Logical shared = explicit shared hold OR `Runnable` OR exclusive owner
//! - An explicit hold taken while `Runnable` is moved onto the raw lock when
//!   the thread leaves `Runnable`, so it keeps excluding `suspend_all`
//! - Collector threads never become `Runnable`; they take the lock explicitly

use crate::locks::{self, LockLevel};
use crate::thread::ManagedThread;
use parking_lot::RawRwLock;
use parking_lot::lock_api::{RawRwLock as RawRwLockApi, RawRwLockRecursive, RawRwLockTimed};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const NAME: &str = "mutator lock";
const NO_OWNER: u32 = 0;
const UNATTACHED_OWNER: u32 = u32::MAX;

/// Logical shared/exclusive lock guarding the managed heap.
pub struct MutatorLock {
    raw: RawRwLock,
    exclusive_owner: AtomicU32,
}

impl Default for MutatorLock {
    fn default() -> Self {
        Self::new()
    }
}

fn owner_id(thread: Option<&ManagedThread>) -> u32 {
    thread.map_or(UNATTACHED_OWNER, |t| t.id().as_u32())
}

impl MutatorLock {
    pub const fn new() -> Self {
        Self {
            raw: <RawRwLock as RawRwLockApi>::INIT,
            exclusive_owner: AtomicU32::new(NO_OWNER),
        }
    }

    /// Explicit shared acquisition.
    ///
    /// A suspended thread blocks while an exclusive holder is active. For a
    /// `Runnable` thread the lock is already logically held and this only
    /// counts the hold; the raw lock is taken for it if the thread leaves
    /// `Runnable` before the guard drops.
    pub fn shared_lock<'a>(&'a self, thread: &'a ManagedThread) -> SharedMutatorGuard<'a> {
        locks::register_acquire(LockLevel::MutatorLock, NAME);
        if !thread.state().is_runnable() {
            self.lock_shared_for(thread);
        }
        thread.add_mutator_shared_hold();
        SharedMutatorGuard { lock: self, thread }
    }

    fn lock_shared_for(&self, thread: &ManagedThread) {
        if thread.mutator_raw_holds() > 0 {
            // A plain `lock_shared` queues behind a waiting writer and would
            // deadlock against our own earlier hold.
            self.raw.lock_shared_recursive();
        } else {
            self.raw.lock_shared();
        }
        thread.add_mutator_raw_hold();
    }

    /// Back every hold taken while `Runnable` with the raw lock.
    ///
    /// Called before `thread` publishes a suspended state. No writer can be
    /// queued while `thread` is still `Runnable`.
    pub(crate) fn retain_shared_holds(&self, thread: &ManagedThread) {
        while thread.mutator_raw_holds() < thread.mutator_shared_holds() {
            self.raw.lock_shared_recursive();
            thread.add_mutator_raw_hold();
        }
    }

    /// Take the underlying lock exclusively. Returns `false` on timeout.
    pub(crate) fn exclusive_lock_for(
        &self,
        thread: Option<&ManagedThread>,
        timeout: Duration,
    ) -> bool {
        if let Some(t) = thread
            && t.state().is_runnable()
        {
            fatal!("{t} requested the mutator lock exclusively while Runnable");
        }
        locks::register_acquire(LockLevel::MutatorLock, NAME);
        if !self.raw.try_lock_exclusive_for(timeout) {
            locks::register_release(LockLevel::MutatorLock);
            return false;
        }
        self.exclusive_owner
            .store(owner_id(thread), Ordering::Release);
        true
    }

    pub(crate) fn exclusive_unlock(&self, thread: Option<&ManagedThread>) {
        let owner = self.exclusive_owner.load(Ordering::Acquire);
        if owner != owner_id(thread) {
            fatal!("mutator lock released exclusively by a non-owner (owner id {owner})");
        }
        self.exclusive_owner.store(NO_OWNER, Ordering::Release);
        // SAFETY: ownership was checked above; this thread took the lock in
        // `exclusive_lock_for` and has not released it since.
        unsafe { self.raw.unlock_exclusive() };
        locks::register_release(LockLevel::MutatorLock);
    }

    /// Bookkeeping for the `Runnable` entry of `thread`.
    pub(crate) fn transition_from_suspended_to_runnable(&self) {
        locks::register_acquire(LockLevel::MutatorLock, NAME);
    }

    /// Bookkeeping for the `Runnable` exit of `thread`.
    pub(crate) fn transition_from_runnable_to_suspended(&self) {
        locks::register_release(LockLevel::MutatorLock);
    }

    /// Whether anyone holds the lock exclusively
    pub fn is_exclusive_locked(&self) -> bool {
        self.exclusive_owner.load(Ordering::Acquire) != NO_OWNER
    }

    pub fn is_exclusive_held(&self, thread: Option<&ManagedThread>) -> bool {
        self.exclusive_owner.load(Ordering::Acquire) == owner_id(thread)
    }

    /// Logical shared hold: runnable, explicit shared, or exclusive.
    pub fn is_shared_held(&self, thread: &ManagedThread) -> bool {
        thread.state().is_runnable()
            || thread.mutator_shared_holds() > 0
            || self.is_exclusive_held(Some(thread))
    }

    pub fn assert_shared_held(&self, thread: &ManagedThread) {
        if cfg!(debug_assertions) && !self.is_shared_held(thread) {
            fatal!("{thread} does not hold the mutator lock");
        }
    }

    pub fn assert_exclusive_held(&self, thread: Option<&ManagedThread>) {
        if cfg!(debug_assertions) && !self.is_exclusive_held(thread) {
            fatal!("mutator lock is not held exclusively by the caller");
        }
    }

    pub fn assert_not_exclusive_held(&self, thread: Option<&ManagedThread>) {
        if cfg!(debug_assertions) && self.is_exclusive_held(thread) {
            fatal!("mutator lock is unexpectedly held exclusively by the caller");
        }
    }

    pub fn assert_not_held(&self, thread: &ManagedThread) {
        if cfg!(debug_assertions) && self.is_shared_held(thread) {
            fatal!("{thread} unexpectedly holds the mutator lock");
        }
    }
}

/// An explicit shared hold of the [`MutatorLock`].
///
/// Raw holds are tracked per thread rather than per guard: a thread never
/// holds the raw lock more often than it has live guards, and while it is
/// suspended it holds it exactly that often.
pub struct SharedMutatorGuard<'a> {
    lock: &'a MutatorLock,
    thread: &'a ManagedThread,
}

impl Drop for SharedMutatorGuard<'_> {
    fn drop(&mut self) {
        self.thread.remove_mutator_shared_hold();
        if self.thread.mutator_raw_holds() > self.thread.mutator_shared_holds() {
            self.thread.remove_mutator_raw_hold();
            // SAFETY: the raw hold count shows this thread still holds the
            // raw lock shared at least once.
            unsafe { self.lock.raw.unlock_shared() };
        }
        locks::register_release(LockLevel::MutatorLock);
    }
}
