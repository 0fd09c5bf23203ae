//! Managed threads
//!
//! A [`ManagedThread`] is the coordination-side view of one OS thread attached
//! to a [`ThreadList`]. Its state word is read lock-free on the fast path; its
//! suspend record (count, barriers, queued checkpoints) lives in the list's
//! suspend table behind the registry lock.
//!
//! ## Design
//!
//! - Only the thread itself changes its state; requesters only set flags
//! - Requesters install flags under the registry lock, the thread consumes
//!   them under the same lock, so "flag set" always implies "work queued"
//! - Leaving `Runnable` runs queued checkpoints first, then publishes the new
//!   state with release ordering, then passes any suspend barriers

use crate::barrier::{CheckpointBarrier, SuspendBarrier};
use crate::checkpoint::Checkpoint;
use crate::locks::{self, CheckpointScope, LockLevel};
use crate::scoped::ScopedThreadSuspension;
use crate::state::{
    AtomicStateAndFlags, StateAndFlags, SUSPEND_OR_CHECKPOINT_REQUEST, ThreadFlag, ThreadState,
};
use crate::thread_list::{SuspendTable, ThreadList, ThreadSnapshot};
use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::trace;

/// Small integer naming a registered thread. 0 is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u32);

impl ThreadId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a registered thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadKind {
    /// Application thread; shutdown waits for it
    Mutator,
    /// Background thread; suspended at shutdown instead of awaited
    Daemon,
    /// Collector thread; never enters `Runnable`
    Collector,
}

impl ThreadKind {
    pub fn is_daemon(self) -> bool {
        !matches!(self, ThreadKind::Mutator)
    }

    pub(crate) fn initial_state(self) -> ThreadState {
        match self {
            ThreadKind::Collector => ThreadState::WaitingPerformingGc,
            _ => ThreadState::Native,
        }
    }
}

/// Which barrier slot of the suspend record a request uses.
#[derive(Clone)]
pub(crate) enum SuspendBarrierSlot {
    /// The one shared suspend-all barrier
    All(Arc<SuspendBarrier>),
    /// A single-target request
    Single(Arc<SuspendBarrier>),
}

/// A thread attached to a [`ThreadList`].
pub struct ManagedThread {
    id: ThreadId,
    name: String,
    kind: ThreadKind,
    os_thread: std::thread::ThreadId,
    state_and_flags: CachePadded<AtomicStateAndFlags>,
    /// Explicit shared holds of the mutator lock
    mutator_shared_holds: AtomicU32,
    /// How many of those the raw lock backs
    mutator_raw_holds: AtomicU32,
    list: Arc<ThreadList>,
}

impl ManagedThread {
    pub(crate) fn new(id: ThreadId, name: String, kind: ThreadKind, list: Arc<ThreadList>) -> Self {
        Self {
            id,
            name,
            kind,
            os_thread: std::thread::current().id(),
            state_and_flags: CachePadded::new(AtomicStateAndFlags::new(kind.initial_state())),
            mutator_shared_holds: AtomicU32::new(0),
            mutator_raw_holds: AtomicU32::new(0),
            list,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    /// The coordination context this thread is attached to
    pub fn list(&self) -> &Arc<ThreadList> {
        &self.list
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state_and_flags.load(Ordering::Acquire).state()
    }

    #[inline]
    pub fn state_and_flags(&self) -> StateAndFlags {
        self.state_and_flags.load(Ordering::Acquire)
    }

    #[inline]
    pub fn read_flag(&self, flag: ThreadFlag) -> bool {
        self.state_and_flags.load(Ordering::Acquire).is_flag_set(flag)
    }

    /// Not `Runnable` and held by at least one suspend request.
    pub fn is_suspended(&self) -> bool {
        let word = self.state_and_flags.load(Ordering::Acquire);
        !word.state().is_runnable() && word.is_flag_set(ThreadFlag::SuspendRequest)
    }

    /// Outstanding suspend requests against this thread
    pub fn suspend_count(&self) -> u32 {
        self.list.suspend_table().suspend_count(self.id)
    }

    /// Whether the caller is running on this thread
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.os_thread
    }

    pub(crate) fn assert_current(&self) {
        if cfg!(debug_assertions) && !self.is_current() {
            fatal!("{self} was driven from a different OS thread");
        }
    }

    pub(crate) fn mutator_shared_holds(&self) -> u32 {
        self.mutator_shared_holds.load(Ordering::Relaxed)
    }

    pub(crate) fn add_mutator_shared_hold(&self) {
        self.mutator_shared_holds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remove_mutator_shared_hold(&self) {
        self.mutator_shared_holds.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn mutator_raw_holds(&self) -> u32 {
        self.mutator_raw_holds.load(Ordering::Relaxed)
    }

    pub(crate) fn add_mutator_raw_hold(&self) {
        self.mutator_raw_holds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remove_mutator_raw_hold(&self) {
        self.mutator_raw_holds.fetch_sub(1, Ordering::Relaxed);
    }

    /// Diagnostic view of this thread.
    pub fn snapshot(&self) -> ThreadSnapshot {
        let suspend_count = self.suspend_count();
        let word = self.state_and_flags();
        ThreadSnapshot {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            state: word.state(),
            flags: word.flags(),
            suspend_count,
        }
    }

    // ------------------------------------------------------------------
    // Self transitions
    // ------------------------------------------------------------------

    /// Change between two suspended states. Never enters or leaves `Runnable`.
    pub fn set_state(&self, new_state: ThreadState) -> ThreadState {
        self.assert_current();
        if new_state.is_runnable() {
            fatal!("{self}: set_state cannot enter Runnable");
        }
        let mut old = self.state_and_flags.load(Ordering::Relaxed);
        loop {
            if old.state().is_runnable() {
                fatal!("{self}: set_state cannot leave Runnable");
            }
            match self.state_and_flags.compare_exchange_weak(
                old,
                old.with_state(new_state),
                Ordering::Release,
            ) {
                Ok(_) => return old.state(),
                Err(current) => old = current,
            }
        }
    }

    /// Enter `Runnable`, logically acquiring the mutator lock shared.
    ///
    /// Blocks while a suspend request is pending. Returns the state left.
    pub fn transition_from_suspended_to_runnable(&self) -> ThreadState {
        self.assert_current();
        if self.kind == ThreadKind::Collector {
            fatal!("{self}: collector threads never become Runnable");
        }
        let mut old = self.state_and_flags.load(Ordering::Relaxed);
        let old_state = old.state();
        if old_state.is_runnable() {
            fatal!("{self}: already Runnable");
        }
        loop {
            if !old.is_any_set(
                SUSPEND_OR_CHECKPOINT_REQUEST | ThreadFlag::ActiveSuspendBarrier.bit(),
            ) {
                // Acquire pairs with the release of whoever last held the heap.
                match self.state_and_flags.compare_exchange_weak(
                    old,
                    old.with_state(ThreadState::Runnable),
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(current) => {
                        old = current;
                        continue;
                    }
                }
            } else if old.is_flag_set(ThreadFlag::ActiveSuspendBarrier) {
                self.pass_active_suspend_barriers();
            } else if old.is_any_set(
                ThreadFlag::CheckpointRequest.bit() | ThreadFlag::EmptyCheckpointRequest.bit(),
            ) {
                fatal!("{self}: checkpoint requested while suspended ({old:?})");
            } else if old.is_flag_set(ThreadFlag::SuspendRequest) {
                let mut table = self.list.suspend_table();
                while self.read_flag(ThreadFlag::SuspendRequest) {
                    self.list.resume_cond().wait(&mut table);
                }
            }
            old = self.state_and_flags.load(Ordering::Relaxed);
        }
        self.list.mutator_lock().transition_from_suspended_to_runnable();
        trace!(thread = %self.id, from = %old_state, "runnable");
        old_state
    }

    /// Leave `Runnable` for `new_state`, logically releasing the mutator lock.
    pub fn transition_from_runnable_to_suspended(&self, new_state: ThreadState) {
        self.assert_current();
        if new_state.is_runnable() {
            fatal!("{self}: cannot suspend into Runnable");
        }
        let old_state = self.state();
        if !old_state.is_runnable() {
            fatal!("{self}: entering {new_state} from {old_state}, expected Runnable");
        }
        locks::assert_thread_suspension_is_allowable();
        self.list.mutator_lock().retain_shared_holds(self);
        self.transition_to_suspended_and_run_checkpoints(new_state);
        self.list.mutator_lock().transition_from_runnable_to_suspended();
        self.check_active_suspend_barriers();
        trace!(thread = %self.id, to = %new_state, "suspended");
    }

    fn transition_to_suspended_and_run_checkpoints(&self, new_state: ThreadState) {
        loop {
            let old = self.state_and_flags.load(Ordering::Relaxed);
            if old.is_flag_set(ThreadFlag::CheckpointRequest) {
                self.run_checkpoint_function();
                continue;
            }
            if old.is_flag_set(ThreadFlag::EmptyCheckpointRequest) {
                self.run_empty_checkpoint();
                continue;
            }
            // Release publishes every heap write made while Runnable.
            if self
                .state_and_flags
                .compare_exchange_weak(old, old.with_state(new_state), Ordering::Release)
                .is_ok()
            {
                return;
            }
        }
    }

    fn check_active_suspend_barriers(&self) {
        if self.read_flag(ThreadFlag::ActiveSuspendBarrier) {
            self.pass_active_suspend_barriers();
        }
    }

    /// Count down every barrier registered against this (now suspended) thread.
    fn pass_active_suspend_barriers(&self) {
        let barriers = {
            let mut table = self.list.suspend_table();
            let record = table.record_mut(self.id);
            let mut barriers = std::mem::take(&mut record.suspend1_barriers);
            barriers.extend(record.suspend_all_barrier.take());
            self.state_and_flags
                .clear_flag(ThreadFlag::ActiveSuspendBarrier, Ordering::SeqCst);
            barriers
        };
        for barrier in barriers {
            barrier.pass();
        }
    }

    // ------------------------------------------------------------------
    // Suspend points
    // ------------------------------------------------------------------

    /// Suspend point. Answers pending checkpoint and suspend requests.
    #[inline]
    pub fn check_suspend(&self) {
        if self
            .state_and_flags
            .load(Ordering::Relaxed)
            .is_any_set(SUSPEND_OR_CHECKPOINT_REQUEST)
        {
            self.check_suspend_slow();
        }
    }

    #[cold]
    fn check_suspend_slow(&self) {
        self.assert_current();
        loop {
            let word = self.state_and_flags.load(Ordering::Acquire);
            if !word.state().is_runnable() {
                return;
            }
            if word.is_flag_set(ThreadFlag::CheckpointRequest) {
                self.run_checkpoint_function();
            } else if word.is_flag_set(ThreadFlag::SuspendRequest) {
                self.full_suspend_check();
            } else if word.is_flag_set(ThreadFlag::EmptyCheckpointRequest) {
                self.run_empty_checkpoint();
            } else {
                return;
            }
        }
    }

    /// Suspend and come back, blocking while any suspend request is pending.
    pub fn full_suspend_check(&self) {
        trace!(thread = %self.id, "full suspend check");
        let _suspension = ScopedThreadSuspension::new(self, ThreadState::Suspended);
    }

    fn run_checkpoint_function(&self) {
        let checkpoint = {
            let mut table = self.list.suspend_table();
            let record = table.record_mut(self.id);
            let checkpoint = record.checkpoints.pop_front();
            if record.checkpoints.is_empty() {
                self.state_and_flags
                    .clear_flag(ThreadFlag::CheckpointRequest, Ordering::SeqCst);
            }
            checkpoint
        };
        let Some(checkpoint) = checkpoint else {
            fatal!("{self}: checkpoint flag set with no checkpoint queued");
        };
        let _scope = CheckpointScope::enter();
        checkpoint.run(self);
    }

    fn run_empty_checkpoint(&self) {
        let barriers = {
            let mut table = self.list.suspend_table();
            let record = table.record_mut(self.id);
            self.state_and_flags
                .clear_flag(ThreadFlag::EmptyCheckpointRequest, Ordering::SeqCst);
            std::mem::take(&mut record.empty_checkpoint_barriers)
        };
        for barrier in barriers {
            barrier.pass();
        }
    }

    /// Answer a pending empty checkpoint while blocked on weak ref access.
    ///
    /// `cond_level` is the level of the lock the caller waits on.
    pub fn check_empty_checkpoint_from_weak_ref_access(&self, cond_level: LockLevel) {
        if self.read_flag(ThreadFlag::EmptyCheckpointRequest) {
            if self.list.config().debug_locking {
                locks::assert_only_expected_on_weak_ref_access(cond_level);
            }
            self.run_empty_checkpoint();
        }
    }

    // ------------------------------------------------------------------
    // Requester side, registry lock held
    // ------------------------------------------------------------------

    pub(crate) fn increment_suspend_count_locked(
        &self,
        table: &mut SuspendTable,
        barrier: Option<SuspendBarrierSlot>,
    ) {
        let record = table.record_mut(self.id);
        record.suspend_count = match record.suspend_count.checked_add(1) {
            Some(count) => count,
            None => fatal!("{self}: suspend count overflow"),
        };
        if let Some(slot) = barrier {
            match slot {
                SuspendBarrierSlot::All(barrier) => {
                    if record.suspend_all_barrier.is_some() {
                        fatal!("{self}: second suspend-all barrier registered");
                    }
                    record.suspend_all_barrier = Some(barrier);
                }
                SuspendBarrierSlot::Single(barrier) => record.suspend1_barriers.push(barrier),
            }
            self.state_and_flags
                .set_flag(ThreadFlag::ActiveSuspendBarrier, Ordering::SeqCst);
        }
        self.state_and_flags
            .set_flag(ThreadFlag::SuspendRequest, Ordering::SeqCst);
    }

    pub(crate) fn decrement_suspend_count_locked(&self, table: &mut SuspendTable) {
        let record = table.record_mut(self.id);
        if record.suspend_count == 0 {
            fatal!("{self}: suspend count decremented below zero");
        }
        record.suspend_count -= 1;
        if record.suspend_count == 0 {
            self.state_and_flags
                .clear_flag(ThreadFlag::SuspendRequest, Ordering::SeqCst);
        }
    }

    /// Unlink a barrier registered by `slot`, if this thread has not taken it yet.
    pub(crate) fn take_barrier_locked(
        &self,
        table: &mut SuspendTable,
        slot: &SuspendBarrierSlot,
    ) -> Option<Arc<SuspendBarrier>> {
        let record = table.record_mut(self.id);
        let taken = match slot {
            SuspendBarrierSlot::All(barrier) => record
                .suspend_all_barrier
                .take_if(|held| Arc::ptr_eq(held, barrier)),
            SuspendBarrierSlot::Single(barrier) => record
                .suspend1_barriers
                .iter()
                .position(|held| Arc::ptr_eq(held, barrier))
                .map(|i| record.suspend1_barriers.swap_remove(i)),
        };
        if record.suspend_all_barrier.is_none() && record.suspend1_barriers.is_empty() {
            self.state_and_flags
                .clear_flag(ThreadFlag::ActiveSuspendBarrier, Ordering::SeqCst);
        }
        taken
    }

    /// Queue `checkpoint` if this thread is `Runnable`. Returns `false` otherwise.
    pub(crate) fn request_checkpoint_locked(
        &self,
        table: &mut SuspendTable,
        checkpoint: Arc<dyn Checkpoint>,
    ) -> bool {
        if !self.install_flag_if_runnable(ThreadFlag::CheckpointRequest) {
            return false;
        }
        table.record_mut(self.id).checkpoints.push_back(checkpoint);
        true
    }

    /// Queue an empty checkpoint barrier if this thread is `Runnable`.
    pub(crate) fn request_empty_checkpoint_locked(
        &self,
        table: &mut SuspendTable,
        barrier: &Arc<CheckpointBarrier>,
    ) -> bool {
        if !self.install_flag_if_runnable(ThreadFlag::EmptyCheckpointRequest) {
            return false;
        }
        table
            .record_mut(self.id)
            .empty_checkpoint_barriers
            .push(Arc::clone(barrier));
        true
    }

    /// The thread consumes the work under the registry lock, which the
    /// caller holds, so setting the flag before queueing is safe.
    fn install_flag_if_runnable(&self, flag: ThreadFlag) -> bool {
        let mut old = self.state_and_flags.load(Ordering::Relaxed);
        loop {
            if !old.state().is_runnable() {
                return false;
            }
            match self
                .state_and_flags
                .compare_exchange_weak(old, old.with_flag(flag), Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(current) => old = current,
            }
        }
    }

    pub(crate) fn mark_terminated(&self) {
        let mut old = self.state_and_flags.load(Ordering::Relaxed);
        loop {
            match self.state_and_flags.compare_exchange_weak(
                old,
                StateAndFlags::new(ThreadState::Terminated),
                Ordering::Release,
            ) {
                Ok(_) => return,
                Err(current) => old = current,
            }
        }
    }
}

impl fmt::Display for ManagedThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Thread[{},\"{}\",{:?}]",
            self.id,
            self.name,
            self.state_and_flags.load(Ordering::Relaxed)
        )
    }
}

impl fmt::Debug for ManagedThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_list::ThreadList;

    #[test]
    fn test_attach_starts_native() {
        let list = ThreadList::new();
        let thread = list.attach("main", ThreadKind::Mutator).unwrap();
        assert_eq!(thread.state(), ThreadState::Native);
        assert!(thread.is_current());
        assert!(!thread.is_suspended());
        assert_eq!(thread.suspend_count(), 0);
        list.detach(&thread).unwrap();
        assert_eq!(thread.state(), ThreadState::Terminated);
    }

    #[test]
    fn test_collector_starts_performing_gc() {
        let list = ThreadList::new();
        let gc = list.attach("gc", ThreadKind::Collector).unwrap();
        assert_eq!(gc.state(), ThreadState::WaitingPerformingGc);
        assert!(gc.kind().is_daemon());
        list.detach(&gc).unwrap();
    }

    #[test]
    #[should_panic(expected = "collector threads never become Runnable")]
    fn test_collector_cannot_become_runnable() {
        let list = ThreadList::new();
        let gc = list.attach("gc", ThreadKind::Collector).unwrap();
        gc.transition_from_suspended_to_runnable();
    }

    #[test]
    fn test_runnable_round_trip() {
        let list = ThreadList::new();
        let thread = list.attach("main", ThreadKind::Mutator).unwrap();
        let old = thread.transition_from_suspended_to_runnable();
        assert_eq!(old, ThreadState::Native);
        assert!(thread.state().is_runnable());
        assert!(list.mutator_lock().is_shared_held(&thread));
        if cfg!(debug_assertions) {
            assert_eq!(locks::held_count(LockLevel::MutatorLock), 1);
        }
        thread.transition_from_runnable_to_suspended(ThreadState::Native);
        assert!(!list.mutator_lock().is_shared_held(&thread));
        assert_eq!(locks::held_count(LockLevel::MutatorLock), 0);
        list.detach(&thread).unwrap();
    }

    #[test]
    fn test_set_state_between_suspended_states() {
        let list = ThreadList::new();
        let thread = list.attach("main", ThreadKind::Mutator).unwrap();
        assert_eq!(thread.set_state(ThreadState::Sleeping), ThreadState::Native);
        assert_eq!(thread.state(), ThreadState::Sleeping);
        thread.set_state(ThreadState::Native);
        list.detach(&thread).unwrap();
    }

    #[test]
    #[should_panic(expected = "set_state cannot leave Runnable")]
    fn test_set_state_from_runnable_is_fatal() {
        let list = ThreadList::new();
        let thread = list.attach("main", ThreadKind::Mutator).unwrap();
        thread.transition_from_suspended_to_runnable();
        thread.set_state(ThreadState::Blocked);
    }

    #[test]
    fn test_checkpoint_flag_only_installed_on_runnable() {
        let list = ThreadList::new();
        let thread = list.attach("main", ThreadKind::Mutator).unwrap();
        let ran = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&ran);
        let checkpoint: Arc<dyn Checkpoint> = Arc::new(move |_: &ManagedThread| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!list.request_checkpoint(&thread, Arc::clone(&checkpoint)));
        assert!(!thread.read_flag(ThreadFlag::CheckpointRequest));

        thread.transition_from_suspended_to_runnable();
        assert!(list.request_checkpoint(&thread, Arc::clone(&checkpoint)));
        assert!(list.request_checkpoint(&thread, checkpoint));
        assert!(thread.read_flag(ThreadFlag::CheckpointRequest));

        thread.check_suspend();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(!thread.read_flag(ThreadFlag::CheckpointRequest));

        thread.transition_from_runnable_to_suspended(ThreadState::Native);
        list.detach(&thread).unwrap();
    }

    #[test]
    fn test_leaving_runnable_runs_pending_checkpoint() {
        let list = ThreadList::new();
        let thread = list.attach("main", ThreadKind::Mutator).unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&seen);
        thread.transition_from_suspended_to_runnable();
        assert!(list.request_checkpoint(
            &thread,
            Arc::new(move |t: &ManagedThread| {
                assert!(t.state().is_runnable());
                s.store(t.id().as_u32(), Ordering::SeqCst);
            }),
        ));
        thread.transition_from_runnable_to_suspended(ThreadState::Native);
        assert_eq!(seen.load(Ordering::SeqCst), thread.id().as_u32());
        list.detach(&thread).unwrap();
    }

    #[test]
    fn test_display() {
        let list = ThreadList::new();
        let thread = list.attach("worker", ThreadKind::Daemon).unwrap();
        let text = thread.to_string();
        assert!(text.starts_with("Thread[1,\"worker\",Native"), "{text}");
        list.detach(&thread).unwrap();
    }
}
