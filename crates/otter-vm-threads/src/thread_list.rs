//! The thread list: registry, suspension and checkpoints
//!
//! [`ThreadList`] is the coordination context. It owns the registered
//! threads, the suspend table guarded by the registry lock, the logical
//! mutator lock and the weak-reference access gate.
//!
//! ## Design
//!
//! - Two locks: the thread list (`LockLevel::ThreadList`) and the registry
//!   lock (`LockLevel::ThreadSuspendCount`), always taken in that order
//! - `resume_cond` pairs with the registry lock and is broadcast whenever a
//!   suspend count drops
//! - A requester only raises another thread's suspend count while its own
//!   count is zero, checked under the registry lock; this breaks suspension
//!   cycles
//! - At most one suspend-all is outstanding (`suspend_all_count <= 1`)

use crate::barrier::{CheckpointBarrier, SuspendBarrier};
use crate::checkpoint::{BarrierCheckpoint, Checkpoint};
use crate::config::ThreadsConfig;
use crate::error::{ThreadError, ThreadResult};
use crate::locks::{CheckpointScope, LockLevel, OrderedCondvar, OrderedMutex, OrderedMutexGuard};
use crate::mutator_lock::MutatorLock;
use crate::scoped::{ScopedObjectAccess, ScopedThreadStateChange};
use crate::state::ThreadState;
use crate::stats::SuspendStats;
use crate::thread::{ManagedThread, SuspendBarrierSlot, ThreadId, ThreadKind};
use crate::weak_ref::WeakRefAccess;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info_span, warn};

/// Per-thread suspend bookkeeping, guarded by the registry lock.
#[derive(Default)]
pub(crate) struct SuspendRecord {
    pub(crate) suspend_count: u32,
    pub(crate) suspend_all_barrier: Option<Arc<SuspendBarrier>>,
    pub(crate) suspend1_barriers: Vec<Arc<SuspendBarrier>>,
    pub(crate) checkpoints: VecDeque<Arc<dyn Checkpoint>>,
    pub(crate) empty_checkpoint_barriers: Vec<Arc<CheckpointBarrier>>,
}

impl SuspendRecord {
    fn has_pending_work(&self) -> bool {
        self.suspend_all_barrier.is_some()
            || !self.suspend1_barriers.is_empty()
            || !self.checkpoints.is_empty()
            || !self.empty_checkpoint_barriers.is_empty()
    }
}

/// Everything the registry lock protects.
pub(crate) struct SuspendTable {
    records: FxHashMap<ThreadId, SuspendRecord>,
    suspend_all_count: u32,
}

impl SuspendTable {
    pub(crate) fn record_mut(&mut self, id: ThreadId) -> &mut SuspendRecord {
        match self.records.get_mut(&id) {
            Some(record) => record,
            None => fatal!("thread {id} has no suspend record"),
        }
    }

    pub(crate) fn suspend_count(&self, id: ThreadId) -> u32 {
        self.records.get(&id).map_or(0, |r| r.suspend_count)
    }

    fn contains(&self, id: ThreadId) -> bool {
        self.records.contains_key(&id)
    }
}

struct Registry {
    threads: Vec<Arc<ManagedThread>>,
    /// Slot 0 is reserved and always marked used
    ids_in_use: Vec<bool>,
    shut_down: bool,
}

impl Registry {
    fn alloc_id(&mut self, max: u32) -> Option<ThreadId> {
        if let Some(free) = self.ids_in_use.iter().position(|used| !used) {
            self.ids_in_use[free] = true;
            return Some(ThreadId::from_raw(free as u32));
        }
        let next = self.ids_in_use.len();
        if next as u64 > max as u64 {
            return None;
        }
        self.ids_in_use.push(true);
        Some(ThreadId::from_raw(next as u32))
    }

    fn release_id(&mut self, id: ThreadId) {
        if let Some(slot) = self.ids_in_use.get_mut(id.as_u32() as usize) {
            *slot = false;
        }
    }

    fn find(&self, id: ThreadId) -> Option<&Arc<ManagedThread>> {
        self.threads.iter().find(|t| t.id() == id)
    }

    fn others<'a>(
        &'a self,
        self_thread: Option<&ManagedThread>,
    ) -> impl Iterator<Item = &'a Arc<ManagedThread>> + use<'a> {
        let self_id = self_thread.map(|t| t.id());
        self.threads.iter().filter(move |t| Some(t.id()) != self_id)
    }
}

/// Diagnostic row for one registered thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub name: String,
    pub kind: ThreadKind,
    pub state: ThreadState,
    pub flags: u32,
    pub suspend_count: u32,
}

impl fmt::Display for ThreadSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  {:>4} {:<24} {:<10} {:<28} flags={:#06x} suspend_count={}",
            self.id,
            format!("\"{}\"", self.name),
            format!("{:?}", self.kind),
            self.state.to_string(),
            self.flags,
            self.suspend_count
        )
    }
}

/// The coordination context shared by every attached thread.
pub struct ThreadList {
    config: ThreadsConfig,
    mutator_lock: MutatorLock,
    registry: OrderedMutex<Registry>,
    /// Signalled when a thread detaches
    thread_exit_cond: OrderedCondvar,
    suspend: OrderedMutex<SuspendTable>,
    /// Signalled when suspend counts drop
    resume_cond: OrderedCondvar,
    weak_ref_access: WeakRefAccess,
    stats: Mutex<SuspendStats>,
}

impl ThreadList {
    /// Create a thread list with default config
    pub fn new() -> Arc<Self> {
        Self::with_config(ThreadsConfig::default())
    }

    /// Create a thread list with custom config
    pub fn with_config(config: ThreadsConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            mutator_lock: MutatorLock::new(),
            registry: OrderedMutex::new(
                "thread list",
                LockLevel::ThreadList,
                Registry {
                    threads: Vec::new(),
                    ids_in_use: vec![true],
                    shut_down: false,
                },
            ),
            thread_exit_cond: OrderedCondvar::new(),
            suspend: OrderedMutex::new(
                "thread suspend count",
                LockLevel::ThreadSuspendCount,
                SuspendTable {
                    records: FxHashMap::default(),
                    suspend_all_count: 0,
                },
            ),
            resume_cond: OrderedCondvar::new(),
            weak_ref_access: WeakRefAccess::new(),
            stats: Mutex::new(SuspendStats::default()),
        })
    }

    pub fn config(&self) -> &ThreadsConfig {
        &self.config
    }

    pub fn mutator_lock(&self) -> &MutatorLock {
        &self.mutator_lock
    }

    pub fn weak_ref_access(&self) -> &WeakRefAccess {
        &self.weak_ref_access
    }

    pub fn stats(&self) -> SuspendStats {
        self.stats.lock().clone()
    }

    pub(crate) fn suspend_table(&self) -> OrderedMutexGuard<'_, SuspendTable> {
        self.suspend.lock()
    }

    pub(crate) fn resume_cond(&self) -> &OrderedCondvar {
        &self.resume_cond
    }

    /// Number of registered threads
    pub fn len(&self) -> usize {
        self.registry.lock().threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.registry.lock().find(id).is_some()
    }

    pub fn find(&self, id: ThreadId) -> Option<Arc<ManagedThread>> {
        self.registry.lock().find(id).cloned()
    }

    /// Whether a suspend-all is outstanding
    pub fn is_suspend_all_in_progress(&self) -> bool {
        self.suspend.lock().suspend_all_count != 0
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register the calling OS thread.
    ///
    /// The thread starts suspended (`Native`, or `WaitingPerformingGc` for a
    /// collector). A thread attaching during a suspend-all starts with one
    /// suspend count so it cannot become `Runnable` until `resume_all`.
    pub fn attach(
        self: &Arc<Self>,
        name: impl Into<String>,
        kind: ThreadKind,
    ) -> ThreadResult<Arc<ManagedThread>> {
        let mut registry = self.registry.lock();
        if registry.shut_down {
            return Err(ThreadError::ShutDown);
        }
        let id = registry
            .alloc_id(self.config.max_threads)
            .ok_or(ThreadError::TooManyThreads(self.config.max_threads))?;
        let thread = Arc::new(ManagedThread::new(id, name.into(), kind, Arc::clone(self)));
        {
            let mut table = self.suspend.lock();
            table.records.insert(id, SuspendRecord::default());
            for _ in 0..table.suspend_all_count {
                thread.increment_suspend_count_locked(&mut table, None);
            }
        }
        registry.threads.push(Arc::clone(&thread));
        debug!(thread = %thread, ?kind, "attached");
        Ok(thread)
    }

    /// Unregister `thread`, which must be the calling thread and not `Runnable`.
    ///
    /// Waits while some requester holds it suspended.
    pub fn detach(&self, thread: &Arc<ManagedThread>) -> ThreadResult<()> {
        thread.assert_current();
        if thread.state().is_runnable() {
            fatal!("{thread}: detaching while Runnable");
        }
        loop {
            let mut registry = self.registry.lock();
            let Some(pos) = registry.threads.iter().position(|t| t.id() == thread.id()) else {
                return Err(ThreadError::NotRegistered(thread.id()));
            };
            let mut table = self.suspend.lock();
            if !thread.is_suspended() {
                if let Some(record) = table.records.remove(&thread.id())
                    && record.has_pending_work()
                {
                    fatal!("{thread}: detached with barriers or checkpoints still queued");
                }
                drop(table);
                registry.threads.remove(pos);
                registry.release_id(thread.id());
                thread.mark_terminated();
                self.thread_exit_cond.notify_all();
                debug!(thread = %thread.id(), name = thread.name(), "detached");
                return Ok(());
            }
            drop(registry);
            while thread.is_suspended() {
                self.resume_cond.wait(&mut table);
            }
        }
    }

    /// Start an OS thread attached as a mutator and run `f` in `Runnable`.
    pub fn spawn<F, R>(
        self: &Arc<Self>,
        name: impl Into<String>,
        f: F,
    ) -> ThreadResult<JoinHandle<ThreadResult<R>>>
    where
        F: FnOnce(&ManagedThread) -> R + Send + 'static,
        R: Send + 'static,
    {
        let name = name.into();
        let list = Arc::clone(self);
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _span = info_span!("mutator", name = %name).entered();
                let thread = list.attach(name, ThreadKind::Mutator)?;
                let result = {
                    let soa = ScopedObjectAccess::new(&thread);
                    f(soa.thread())
                };
                list.detach(&thread)?;
                Ok(result)
            })
            .map_err(|e| ThreadError::internal(format!("failed to spawn thread: {e}")))
    }

    // ------------------------------------------------------------------
    // Suspension
    // ------------------------------------------------------------------

    /// Raise `target`'s suspend count, optionally registering `barrier`.
    ///
    /// If `target` is already suspended the barrier is passed on its behalf
    /// before returning. A registered caller first waits until its own
    /// suspend count is zero.
    pub fn increment_suspend_count(
        &self,
        self_thread: Option<&ManagedThread>,
        target: &ManagedThread,
        barrier: Option<Arc<SuspendBarrier>>,
    ) -> ThreadResult<()> {
        if self_thread.is_some_and(|me| me.id() == target.id()) {
            return Err(ThreadError::SelfSuspend);
        }
        let slot = barrier.map(SuspendBarrierSlot::Single);
        loop {
            let mut table = self.suspend.lock();
            if !table.contains(target.id()) {
                return Err(ThreadError::NotRegistered(target.id()));
            }
            if let Some(me) = self_thread
                && table.suspend_count(me.id()) != 0
            {
                drop(table);
                self.wait_for_own_suspend_count_zero(me);
                continue;
            }
            target.increment_suspend_count_locked(&mut table, slot.clone());
            if let Some(slot) = &slot
                && target.is_suspended()
                && let Some(barrier) = target.take_barrier_locked(&mut table, slot)
            {
                barrier.pass();
            }
            return Ok(());
        }
    }

    /// Drop one suspend request on `target` and wake waiters.
    pub fn decrement_suspend_count(&self, target: &ManagedThread) -> ThreadResult<()> {
        let mut table = self.suspend.lock();
        if !table.contains(target.id()) {
            return Err(ThreadError::NotRegistered(target.id()));
        }
        if table.suspend_count(target.id()) == 0 {
            return Err(ThreadError::NotSuspended(target.id()));
        }
        target.decrement_suspend_count_locked(&mut table);
        self.resume_cond.notify_all();
        Ok(())
    }

    /// Wait until every thread `barrier` was registered on has suspended.
    /// Returns `false` after `suspend_timeout`.
    pub fn wait_for_suspend_barrier(&self, barrier: &SuspendBarrier) -> bool {
        barrier.wait(self.config.suspend_timeout)
    }

    /// Block until the caller's own suspend count is zero.
    fn wait_for_own_suspend_count_zero(&self, me: &ManagedThread) {
        if me.state().is_runnable() {
            // Suspending and coming back waits out every request against us.
            me.full_suspend_check();
            return;
        }
        let mut table = self.suspend.lock();
        while table.suspend_count(me.id()) != 0 {
            self.resume_cond.wait(&mut table);
        }
    }

    /// Suspend one thread and wait until it is suspended.
    pub fn suspend_thread(
        &self,
        self_thread: Option<&ManagedThread>,
        id: ThreadId,
    ) -> ThreadResult<Arc<ManagedThread>> {
        if self_thread.is_some_and(|me| me.id() == id) {
            return Err(ThreadError::SelfSuspend);
        }
        let barrier = Arc::new(SuspendBarrier::new(1));
        let slot = SuspendBarrierSlot::Single(Arc::clone(&barrier));
        let mut retries = 0;
        let target = loop {
            let registry = self.registry.lock();
            let Some(target) = registry.find(id).cloned() else {
                return Err(ThreadError::NotRegistered(id));
            };
            let mut table = self.suspend.lock();
            let own_count = self_thread.map_or(0, |me| table.suspend_count(me.id()));
            if own_count == 0 {
                target.increment_suspend_count_locked(&mut table, Some(slot.clone()));
                if target.is_suspended()
                    && let Some(barrier) = target.take_barrier_locked(&mut table, &slot)
                {
                    barrier.pass();
                }
                break target;
            }
            drop(table);
            drop(registry);
            retries += 1;
            if retries > self.config.max_suspend_retries {
                return Err(ThreadError::SuspendRetriesExhausted { thread: id, retries });
            }
            if let Some(me) = self_thread {
                self.wait_for_own_suspend_count_zero(me);
            }
            std::thread::sleep(self.config.suspend_retry_sleep);
        };

        let suspended = {
            let _wait = self_thread.map(|me| {
                ScopedThreadStateChange::new(me, ThreadState::WaitingForSuspension)
            });
            self.wait_for_suspend_barrier(&barrier)
        };
        if !suspended {
            let mut table = self.suspend.lock();
            target.take_barrier_locked(&mut table, &slot);
            target.decrement_suspend_count_locked(&mut table);
            self.resume_cond.notify_all();
            warn!(thread = %target, "thread did not suspend in time");
            return Err(ThreadError::SuspendTimeout {
                thread: id,
                waited: self.config.suspend_timeout,
            });
        }
        self.stats.lock().thread_suspends += 1;
        debug!(thread = %target.id(), "suspended");
        Ok(target)
    }

    /// Undo one `suspend_thread`.
    pub fn resume_thread(&self, target: &ManagedThread) -> ThreadResult<()> {
        let registry = self.registry.lock();
        if registry.find(target.id()).is_none() {
            return Err(ThreadError::NotRegistered(target.id()));
        }
        let mut table = self.suspend.lock();
        if table.suspend_count(target.id()) == 0 {
            return Err(ThreadError::NotSuspended(target.id()));
        }
        target.decrement_suspend_count_locked(&mut table);
        self.resume_cond.notify_all();
        debug!(thread = %target.id(), "resumed");
        Ok(())
    }

    /// Stop every other thread and take the mutator lock exclusively.
    ///
    /// The caller must not be `Runnable`. Pair with [`resume_all`](Self::resume_all)
    /// or use `ScopedSuspendAll`.
    pub fn suspend_all(&self, self_thread: Option<&ManagedThread>, cause: &str) {
        let _span = info_span!("suspend_all", cause).entered();
        if let Some(me) = self_thread
            && me.state().is_runnable()
        {
            fatal!("{me}: suspend_all from a Runnable thread");
        }
        if self.config.debug_locking && !self.weak_ref_access.is_enabled() {
            fatal!("suspend_all ({cause}) while weak reference access is disabled");
        }
        let start = Instant::now();
        self.suspend_all_internal(self_thread, cause);
        if !self
            .mutator_lock
            .exclusive_lock_for(self_thread, self.config.suspend_timeout)
        {
            fatal!(
                "timed out taking the mutator lock exclusively ({cause})\n{}",
                self.dump()
            );
        }
        let elapsed = start.elapsed();
        let long = elapsed > self.config.long_suspend_threshold;
        if long {
            warn!(
                cause,
                elapsed_us = elapsed.as_micros() as u64,
                "suspending all threads took long"
            );
        }
        self.stats.lock().record_suspend_all(elapsed, long);
        debug!(cause, "all threads suspended");
    }

    fn suspend_all_internal(&self, self_thread: Option<&ManagedThread>, cause: &str) {
        let barrier = loop {
            let registry = self.registry.lock();
            let mut table = self.suspend.lock();
            let own_count = self_thread.map_or(0, |me| table.suspend_count(me.id()));
            if table.suspend_all_count == 0 && own_count == 0 {
                table.suspend_all_count += 1;
                let pending = registry.others(self_thread).count();
                let barrier = Arc::new(SuspendBarrier::new(pending as i32));
                let slot = SuspendBarrierSlot::All(Arc::clone(&barrier));
                for thread in registry.others(self_thread) {
                    thread.increment_suspend_count_locked(&mut table, Some(slot.clone()));
                    if thread.is_suspended()
                        && let Some(barrier) = thread.take_barrier_locked(&mut table, &slot)
                    {
                        barrier.pass();
                    }
                }
                break barrier;
            }
            drop(registry);
            // Another suspend-all is running or someone is suspending us.
            while table.suspend_all_count != 0
                || self_thread.is_some_and(|me| table.suspend_count(me.id()) != 0)
            {
                self.resume_cond.wait(&mut table);
            }
        };
        if !barrier.wait(self.config.suspend_timeout) {
            let stragglers: Vec<String> = self
                .snapshot()
                .into_iter()
                .filter(|s| s.state.is_runnable())
                .map(|s| format!("{}(\"{}\")", s.id, s.name))
                .collect();
            fatal!(
                "timed out waiting for threads to suspend ({cause}); still running: {}\n{}",
                stragglers.join(", "),
                self.dump()
            );
        }
    }

    /// Release the mutator lock and drop every suspend-all request.
    pub fn resume_all(&self, self_thread: Option<&ManagedThread>) {
        self.mutator_lock.exclusive_unlock(self_thread);
        let registry = self.registry.lock();
        let mut table = self.suspend.lock();
        if table.suspend_all_count != 1 {
            fatal!(
                "resume_all with suspend_all_count {}",
                table.suspend_all_count
            );
        }
        table.suspend_all_count -= 1;
        for thread in registry.others(self_thread) {
            thread.decrement_suspend_count_locked(&mut table);
        }
        self.resume_cond.notify_all();
        debug!("all threads resumed");
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Queue `checkpoint` on a `Runnable` target. Returns `false` if the
    /// target is not `Runnable` (or not registered).
    pub fn request_checkpoint(
        &self,
        target: &ManagedThread,
        checkpoint: Arc<dyn Checkpoint>,
    ) -> bool {
        let mut table = self.suspend.lock();
        table.contains(target.id()) && target.request_checkpoint_locked(&mut table, checkpoint)
    }

    /// Run `checkpoint` for `target` and wait until it has run.
    ///
    /// A `Runnable` target runs it at its next suspend point while the caller
    /// waits in `WaitingForCheckpointsToRun`; a suspended target is pinned and
    /// the caller runs it on the target's behalf.
    pub fn request_synchronous_checkpoint(
        &self,
        self_thread: &ManagedThread,
        target: &ManagedThread,
        checkpoint: Arc<dyn Checkpoint>,
    ) -> ThreadResult<()> {
        if self_thread.id() == target.id() {
            let _scope = CheckpointScope::enter();
            checkpoint.run(self_thread);
            return Ok(());
        }
        loop {
            let mut table = self.suspend.lock();
            if !table.contains(target.id()) {
                return Err(ThreadError::NotRegistered(target.id()));
            }
            let barrier = Arc::new(CheckpointBarrier::new(0));
            let wrapped = Arc::new(BarrierCheckpoint {
                inner: Arc::clone(&checkpoint),
                barrier: Arc::clone(&barrier),
            });
            if target.request_checkpoint_locked(&mut table, wrapped) {
                drop(table);
                let _wait = ScopedThreadStateChange::new(
                    self_thread,
                    ThreadState::WaitingForCheckpointsToRun,
                );
                barrier.increment(1);
                return Ok(());
            }
            if table.suspend_count(self_thread.id()) != 0 {
                drop(table);
                self.wait_for_own_suspend_count_zero(self_thread);
                continue;
            }
            target.increment_suspend_count_locked(&mut table, None);
            if !target.is_suspended() {
                // It became Runnable between the two checks.
                target.decrement_suspend_count_locked(&mut table);
                continue;
            }
            drop(table);
            {
                let _scope = CheckpointScope::enter();
                checkpoint.run(target);
            }
            let mut table = self.suspend.lock();
            target.decrement_suspend_count_locked(&mut table);
            self.resume_cond.notify_all();
            return Ok(());
        }
    }

    /// Run `checkpoint` for every registered thread.
    ///
    /// Runnable threads run it at their next suspend point; suspended threads
    /// are held suspended and the caller runs it for them; the caller runs it
    /// for itself. Returns the number of threads that run (or will run) the
    /// closure, without waiting for the asynchronous ones.
    pub fn run_checkpoint(
        &self,
        self_thread: Option<&ManagedThread>,
        checkpoint: Arc<dyn Checkpoint>,
    ) -> usize {
        self.mutator_lock.assert_not_exclusive_held(self_thread);
        if self.config.debug_locking && !self.weak_ref_access.is_enabled() {
            fatal!("checkpoint requested while weak reference access is disabled");
        }
        let mut held_suspended = Vec::new();
        let mut count = 0;
        {
            let registry = self.registry.lock();
            let mut table = self.suspend.lock();
            for thread in registry.others(self_thread) {
                count += 1;
                let mut requested_suspend = false;
                loop {
                    if thread.request_checkpoint_locked(&mut table, Arc::clone(&checkpoint)) {
                        if requested_suspend {
                            thread.decrement_suspend_count_locked(&mut table);
                            requested_suspend = false;
                        }
                        break;
                    }
                    if !requested_suspend {
                        thread.increment_suspend_count_locked(&mut table, None);
                        requested_suspend = true;
                    }
                    if thread.is_suspended() {
                        break;
                    }
                }
                if requested_suspend {
                    held_suspended.push(Arc::clone(thread));
                }
            }
        }

        if let Some(me) = self_thread {
            count += 1;
            let _scope = CheckpointScope::enter();
            checkpoint.run(me);
        }
        for thread in &held_suspended {
            {
                let _scope = CheckpointScope::enter();
                checkpoint.run(thread);
            }
            let mut table = self.suspend.lock();
            thread.decrement_suspend_count_locked(&mut table);
            self.resume_cond.notify_all();
        }
        self.stats.lock().checkpoints += 1;
        debug!(
            threads = count,
            on_behalf = held_suspended.len(),
            "checkpoint requested"
        );
        count
    }

    /// Wait until every thread that was `Runnable` at the call has passed a
    /// suspend point or left `Runnable`.
    ///
    /// Threads blocked on weak reference access are woken so they can answer.
    pub fn run_empty_checkpoint(&self, self_thread: Option<&ManagedThread>) {
        self.mutator_lock.assert_not_exclusive_held(self_thread);
        let barrier = Arc::new(CheckpointBarrier::new(0));
        let mut runnable = Vec::new();
        {
            let registry = self.registry.lock();
            let mut table = self.suspend.lock();
            for thread in registry.others(self_thread) {
                if thread.request_empty_checkpoint_locked(&mut table, &barrier) {
                    runnable.push(thread.id());
                }
            }
        }
        self.weak_ref_access.broadcast_for_checkpoint();

        let _wait = self_thread
            .map(|me| ScopedThreadStateChange::new(me, ThreadState::WaitingForCheckpointsToRun));
        let poll = self.config.empty_checkpoint_poll;
        let mut delta = runnable.len() as i32;
        let mut waited = Duration::ZERO;
        let mut warned = false;
        while barrier.increment_timeout(delta, poll) {
            delta = 0;
            waited += poll;
            if waited >= self.config.empty_checkpoint_timeout {
                fatal!(
                    "empty checkpoint timed out after {waited:?}; requested on {runnable:?}\n{}",
                    self.dump()
                );
            }
            if !warned && waited >= Duration::from_secs(1) {
                warn!(
                    waited_ms = waited.as_millis() as u64,
                    pending = barrier.count(),
                    "empty checkpoint is slow"
                );
                warned = true;
            }
            // Threads waiting on a condition while Runnable may have missed the first broadcast.
            self.weak_ref_access.broadcast_for_checkpoint();
        }
        self.stats.lock().empty_checkpoints += 1;
        debug!(threads = runnable.len(), "empty checkpoint done");
    }

    /// Run `visitor` on the caller and on every thread that is stably suspended.
    ///
    /// Runnable threads are skipped. Visited threads are held suspended while
    /// the visitor runs. Returns the number of threads visited.
    pub fn visit_suspended_threads(
        &self,
        self_thread: Option<&ManagedThread>,
        mut visitor: impl FnMut(&ManagedThread),
    ) -> usize {
        let mut pinned = Vec::new();
        {
            let registry = self.registry.lock();
            let mut table = self.suspend.lock();
            for thread in registry.others(self_thread) {
                thread.increment_suspend_count_locked(&mut table, None);
                if thread.is_suspended() {
                    pinned.push(Arc::clone(thread));
                } else {
                    thread.decrement_suspend_count_locked(&mut table);
                }
            }
        }
        let mut visited = 0;
        if let Some(me) = self_thread {
            visitor(me);
            visited += 1;
        }
        for thread in &pinned {
            visitor(thread);
            visited += 1;
        }
        let mut table = self.suspend.lock();
        for thread in &pinned {
            thread.decrement_suspend_count_locked(&mut table);
        }
        self.resume_cond.notify_all();
        visited
    }

    /// Have every thread report its own snapshot through a checkpoint.
    pub fn checkpoint_snapshots(&self, self_thread: Option<&ManagedThread>) -> Vec<ThreadSnapshot> {
        let barrier = Arc::new(CheckpointBarrier::new(0));
        let sink = Arc::new(OrderedMutex::new(
            "snapshot sink",
            LockLevel::GenericBottom,
            Vec::new(),
        ));
        let checkpoint = {
            let barrier = Arc::clone(&barrier);
            let sink = Arc::clone(&sink);
            move |thread: &ManagedThread| {
                let snapshot = thread.snapshot();
                sink.lock().push(snapshot);
                barrier.pass();
            }
        };
        let count = self.run_checkpoint(self_thread, Arc::new(checkpoint));
        {
            let _wait = self_thread
                .map(|me| ScopedThreadStateChange::new(me, ThreadState::WaitingForCheckpointsToRun));
            barrier.increment(count as i32);
        }
        let mut snapshots = std::mem::take(&mut *sink.lock());
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    // ------------------------------------------------------------------
    // Diagnostics and teardown
    // ------------------------------------------------------------------

    /// Current view of every registered thread, by id.
    pub fn snapshot(&self) -> Vec<ThreadSnapshot> {
        let registry = self.registry.lock();
        let table = self.suspend.lock();
        let mut rows: Vec<_> = registry
            .threads
            .iter()
            .map(|t| {
                let word = t.state_and_flags();
                ThreadSnapshot {
                    id: t.id(),
                    name: t.name().to_string(),
                    kind: t.kind(),
                    state: word.state(),
                    flags: word.flags(),
                    suspend_count: table.suspend_count(t.id()),
                }
            })
            .collect();
        rows.sort_by_key(|s| s.id);
        rows
    }

    /// Table of threads with states, flags and suspend counts.
    pub fn dump(&self) -> String {
        let rows = self.snapshot();
        let suspend_all_count = self.suspend.lock().suspend_all_count;
        let mut out = format!(
            "thread list: {} threads, suspend_all_count={suspend_all_count}\n",
            rows.len()
        );
        for row in rows {
            let _ = writeln!(out, "{row}");
        }
        out
    }

    /// Wait for non-daemon threads to detach, refuse further attaches, and
    /// park the remaining daemon threads.
    pub fn shut_down(&self, self_thread: Option<&ManagedThread>) {
        debug!("thread list shutting down");
        {
            let mut registry = self.registry.lock();
            while registry
                .others(self_thread)
                .any(|t| !t.kind().is_daemon())
            {
                self.thread_exit_cond.wait(&mut registry);
            }
            registry.shut_down = true;
        }
        self.suspend_daemons_for_shutdown(self_thread);
    }

    fn suspend_daemons_for_shutdown(&self, self_thread: Option<&ManagedThread>) {
        let daemons: Vec<_> = {
            let registry = self.registry.lock();
            let mut table = self.suspend.lock();
            registry
                .others(self_thread)
                .map(|thread| {
                    thread.increment_suspend_count_locked(&mut table, None);
                    Arc::clone(thread)
                })
                .collect()
        };
        let deadline = Instant::now() + self.config.suspend_timeout;
        loop {
            let running: Vec<_> = daemons
                .iter()
                .filter(|t| t.state().is_runnable())
                .map(|t| t.id())
                .collect();
            if running.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(?running, "daemon threads still running at shutdown");
                break;
            }
            std::thread::sleep(self.config.suspend_retry_sleep);
        }
        debug!(daemons = daemons.len(), "daemon threads suspended for shutdown");
    }

    pub fn is_shut_down(&self) -> bool {
        self.registry.lock().shut_down
    }
}
