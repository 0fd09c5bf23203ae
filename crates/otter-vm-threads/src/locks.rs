//! Lock levels and acquisition-order checking
//!
//! Every lock in the coordination core has a [`LockLevel`]. A thread may only
//! acquire a lock whose level is strictly lower than every lock it already
//! holds, so the mutator lock (high) is always taken before the registry lock
//! (low), never after.
//!
//! ## Design
//!
//! - Held levels are tracked per OS thread in a thread-local table
//! - Checks are compiled in debug builds only; a violation is fatal
//! - Checkpoint closures run in a [`CheckpointScope`] that bans `Monitor` and above
//! - The mutator lock is the one level that may be re-held (shared)

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

const LOCK_CHECKS: bool = cfg!(debug_assertions);

/// Position of a lock in the global acquisition order, lowest first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    /// Leaf locks inside suspend and checkpoint barriers
    SuspendBarrier = 0,
    /// The registry lock guarding suspend counts, barrier lists and checkpoint slots
    ThreadSuspendCount = 1,
    /// Highest level a checkpoint closure may acquire
    GenericBottom = 2,
    /// Monitors; first level banned inside checkpoints
    Monitor = 3,
    /// Reference processing; may be held while waiting for weak ref access
    ReferenceProcessor = 4,
    /// Intern table; may be held while waiting for weak ref access
    InternTable = 5,
    /// Default for collaborator locks
    Default = 6,
    /// The registered-thread list
    ThreadList = 7,
    /// The logical mutator lock
    MutatorLock = 8,
    /// Held while acquiring the mutator lock
    UserCodeSuspension = 9,
}

const LEVEL_COUNT: usize = LockLevel::UserCodeSuspension as usize + 1;

const ALL_LEVELS: [LockLevel; LEVEL_COUNT] = [
    LockLevel::SuspendBarrier,
    LockLevel::ThreadSuspendCount,
    LockLevel::GenericBottom,
    LockLevel::Monitor,
    LockLevel::ReferenceProcessor,
    LockLevel::InternTable,
    LockLevel::Default,
    LockLevel::ThreadList,
    LockLevel::MutatorLock,
    LockLevel::UserCodeSuspension,
];

impl LockLevel {
    /// Whether a checkpoint closure may acquire a lock at this level.
    #[inline]
    pub fn is_checkpoint_safe(self) -> bool {
        self < LockLevel::Monitor
    }

    /// Whether a thread may hold this level while waiting for weak ref access.
    #[inline]
    pub fn is_expected_on_weak_ref_access(self) -> bool {
        matches!(self, LockLevel::ReferenceProcessor | LockLevel::InternTable)
    }
}

struct HeldLocks {
    counts: [u32; LEVEL_COUNT],
    names: [&'static str; LEVEL_COUNT],
    checkpoint_depth: u32,
    no_suspension: u32,
    no_suspension_cause: &'static str,
}

impl HeldLocks {
    const fn new() -> Self {
        Self {
            counts: [0; LEVEL_COUNT],
            names: [""; LEVEL_COUNT],
            checkpoint_depth: 0,
            no_suspension: 0,
            no_suspension_cause: "",
        }
    }

    /// Lowest held level that `skip` does not excuse.
    fn first_held_except(&self, skip: impl Fn(LockLevel) -> bool) -> Option<(LockLevel, &'static str)> {
        ALL_LEVELS
            .iter()
            .copied()
            .find(|&level| self.counts[level as usize] > 0 && !skip(level))
            .map(|level| (level, self.names[level as usize]))
    }
}

thread_local! {
    static HELD: RefCell<HeldLocks> = const { RefCell::new(HeldLocks::new()) };
}

/// Record that the current thread is about to acquire `name` at `level`.
pub(crate) fn register_acquire(level: LockLevel, name: &'static str) {
    if !LOCK_CHECKS {
        return;
    }
    let violation = HELD.with(|held| {
        let mut held = held.borrow_mut();
        if held.checkpoint_depth > 0 && !level.is_checkpoint_safe() {
            return Some(format!(
                "checkpoint closure acquired \"{name}\" at {level:?}, only levels below Monitor are allowed"
            ));
        }
        for &other in &ALL_LEVELS[..=level as usize] {
            let reentrant_shared = other == level && level == LockLevel::MutatorLock;
            if held.counts[other as usize] > 0 && !reentrant_shared {
                return Some(format!(
                    "lock level violation: acquiring \"{name}\" ({level:?}) while holding \"{}\" ({other:?})",
                    held.names[other as usize]
                ));
            }
        }
        held.counts[level as usize] += 1;
        held.names[level as usize] = name;
        None
    });
    if let Some(message) = violation {
        fatal!("{message}");
    }
}

/// Record that the current thread released a lock at `level`.
pub(crate) fn register_release(level: LockLevel) {
    if !LOCK_CHECKS {
        return;
    }
    let underflow = HELD.with(|held| {
        let mut held = held.borrow_mut();
        let count = &mut held.counts[level as usize];
        if *count == 0 {
            return true;
        }
        *count -= 1;
        false
    });
    if underflow {
        fatal!("released a lock at {level:?} that this thread does not hold");
    }
}

/// How many locks at `level` the current thread holds. Always 0 in release builds.
pub fn held_count(level: LockLevel) -> u32 {
    if !LOCK_CHECKS {
        return 0;
    }
    HELD.with(|held| held.borrow().counts[level as usize])
}

/// A Runnable thread may only give up the mutator lock while holding nothing else.
pub(crate) fn assert_thread_suspension_is_allowable() {
    if !LOCK_CHECKS {
        return;
    }
    let problem = HELD.with(|held| {
        let held = held.borrow();
        if held.no_suspension > 0 {
            return Some(format!(
                "thread suspension is forbidden here: {}",
                held.no_suspension_cause
            ));
        }
        held.first_held_except(|level| level >= LockLevel::MutatorLock)
            .map(|(level, name)| format!("holding \"{name}\" ({level:?}) across a suspend point"))
    });
    if let Some(message) = problem {
        fatal!("{message}");
    }
}

/// A weak-access waiter may hold only its condition lock and the expected levels.
pub(crate) fn assert_only_expected_on_weak_ref_access(cond_level: LockLevel) {
    if !LOCK_CHECKS {
        return;
    }
    let unexpected = HELD.with(|held| {
        held.borrow().first_held_except(|level| {
            level == cond_level
                || level >= LockLevel::MutatorLock
                || level.is_expected_on_weak_ref_access()
        })
    });
    if let Some((level, name)) = unexpected {
        fatal!("waiting for weak ref access while holding \"{name}\" ({level:?})");
    }
}

pub(crate) fn enter_no_suspension(cause: &'static str) {
    if !LOCK_CHECKS {
        return;
    }
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if held.no_suspension == 0 {
            held.no_suspension_cause = cause;
        }
        held.no_suspension += 1;
    });
}

pub(crate) fn exit_no_suspension() {
    if !LOCK_CHECKS {
        return;
    }
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        held.no_suspension = held.no_suspension.saturating_sub(1);
    });
}

/// Marks the current thread as running a checkpoint closure.
pub(crate) struct CheckpointScope {
    _not_send: PhantomData<*const ()>,
}

impl CheckpointScope {
    pub(crate) fn enter() -> Self {
        HELD.with(|held| held.borrow_mut().checkpoint_depth += 1);
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for CheckpointScope {
    fn drop(&mut self) {
        HELD.with(|held| held.borrow_mut().checkpoint_depth -= 1);
    }
}

/// A `parking_lot::Mutex` that takes part in level checking.
pub struct OrderedMutex<T> {
    name: &'static str,
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(name: &'static str, level: LockLevel, value: T) -> Self {
        Self {
            name,
            level,
            inner: Mutex::new(value),
        }
    }

    /// Acquire, checking the level before blocking.
    pub fn lock(&self) -> OrderedMutexGuard<'_, T> {
        register_acquire(self.level, self.name);
        OrderedMutexGuard {
            level: self.level,
            guard: self.inner.lock(),
        }
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Guard for [`OrderedMutex`]
pub struct OrderedMutexGuard<'a, T> {
    level: LockLevel,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedMutexGuard<'_, T> {
    fn drop(&mut self) {
        register_release(self.level);
    }
}

/// Condition variable paired with an [`OrderedMutex`].
///
/// The level stays registered while waiting; the thread reacquires the same
/// lock before returning.
#[derive(Default)]
pub struct OrderedCondvar {
    inner: Condvar,
}

impl OrderedCondvar {
    pub fn new() -> Self {
        Self {
            inner: Condvar::new(),
        }
    }

    pub fn wait<T>(&self, guard: &mut OrderedMutexGuard<'_, T>) {
        self.inner.wait(&mut guard.guard);
    }

    /// Returns `true` if the wait timed out.
    pub fn wait_for<T>(&self, guard: &mut OrderedMutexGuard<'_, T>, timeout: Duration) -> bool {
        self.inner.wait_for(&mut guard.guard, timeout).timed_out()
    }

    pub fn notify_all(&self) -> usize {
        self.inner.notify_all()
    }

    pub fn notify_one(&self) -> bool {
        self.inner.notify_one()
    }
}
