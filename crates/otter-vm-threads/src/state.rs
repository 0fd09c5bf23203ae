//! Thread execution states and the packed state-and-flags word
//!
//! ## Design
//!
//! - One `u32` per thread: request flags in the low byte, [`ThreadState`] in the top byte
//! - State and flags are always read and written together, so a requester that
//!   sets a flag and a thread that changes its state cannot miss each other
//! - Checkpoint flags are only ever installed by a CAS that also observes `Runnable`

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Execution state of a managed thread.
///
/// `Runnable` is the only state that logically holds the mutator lock shared;
/// every other state counts as suspended.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// Running managed code, may touch the heap
    Runnable = 0,
    /// Detached from the thread list
    Terminated = 1,
    /// In `Object.wait` with a timeout
    TimedWaiting = 2,
    /// Sleeping
    Sleeping = 3,
    /// Blocked on a monitor
    Blocked = 4,
    /// In `Object.wait`
    Waiting = 5,
    /// Blocked until the current collection finishes
    WaitingForGcToComplete = 6,
    /// Collector thread doing collection work
    WaitingPerformingGc = 7,
    /// Waiting for other threads to run a checkpoint
    WaitingForCheckpointsToRun = 8,
    /// Waiting for weak reference access to be re-enabled
    WaitingWeakGcRootRead = 9,
    /// Waiting for a suspend barrier to drain
    WaitingForSuspension = 10,
    /// Registered but not yet started
    Starting = 11,
    /// Running unmanaged code
    Native = 12,
    /// Parked by a suspend request
    Suspended = 13,
}

impl ThreadState {
    /// Whether this state holds the mutator lock shared.
    #[inline]
    pub fn is_runnable(self) -> bool {
        self == ThreadState::Runnable
    }

    /// Whether this state counts as suspended for the collector.
    #[inline]
    pub fn is_suspended(self) -> bool {
        !self.is_runnable()
    }
}

impl From<u8> for ThreadState {
    fn from(v: u8) -> Self {
        match v {
            0 => ThreadState::Runnable,
            1 => ThreadState::Terminated,
            2 => ThreadState::TimedWaiting,
            3 => ThreadState::Sleeping,
            4 => ThreadState::Blocked,
            5 => ThreadState::Waiting,
            6 => ThreadState::WaitingForGcToComplete,
            7 => ThreadState::WaitingPerformingGc,
            8 => ThreadState::WaitingForCheckpointsToRun,
            9 => ThreadState::WaitingWeakGcRootRead,
            10 => ThreadState::WaitingForSuspension,
            11 => ThreadState::Starting,
            12 => ThreadState::Native,
            13 => ThreadState::Suspended,
            _ => fatal!("corrupt thread state byte {v:#04x}"),
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Request bits carried next to the state.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadFlag {
    /// Suspend count is non-zero
    SuspendRequest = 1 << 0,
    /// A checkpoint closure is queued
    CheckpointRequest = 1 << 1,
    /// An empty checkpoint barrier is queued
    EmptyCheckpointRequest = 1 << 2,
    /// Some requester waits on a suspend barrier for this thread
    ActiveSuspendBarrier = 1 << 3,
}

impl ThreadFlag {
    /// Raw bit
    #[inline]
    pub const fn bit(self) -> u32 {
        self as u32
    }
}

/// Flags a Runnable thread acts on at a suspend point.
pub const SUSPEND_OR_CHECKPOINT_REQUEST: u32 = ThreadFlag::SuspendRequest.bit()
    | ThreadFlag::CheckpointRequest.bit()
    | ThreadFlag::EmptyCheckpointRequest.bit();

const STATE_SHIFT: u32 = 24;
const FLAGS_MASK: u32 = (1 << STATE_SHIFT) - 1;

/// Snapshot of a thread's state word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateAndFlags(u32);

impl StateAndFlags {
    /// Word with `state` and no flags
    #[inline]
    pub const fn new(state: ThreadState) -> Self {
        Self((state as u32) << STATE_SHIFT)
    }

    /// Rebuild from a raw word
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw word
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn state(self) -> ThreadState {
        ThreadState::from((self.0 >> STATE_SHIFT) as u8)
    }

    /// Flag bits only
    #[inline]
    pub const fn flags(self) -> u32 {
        self.0 & FLAGS_MASK
    }

    #[inline]
    pub const fn is_flag_set(self, flag: ThreadFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// Whether any bit of `mask` is set
    #[inline]
    pub const fn is_any_set(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    #[inline]
    pub const fn with_state(self, state: ThreadState) -> Self {
        Self((self.0 & FLAGS_MASK) | ((state as u32) << STATE_SHIFT))
    }

    #[inline]
    pub const fn with_flag(self, flag: ThreadFlag) -> Self {
        Self(self.0 | flag.bit())
    }

    #[inline]
    pub const fn without_flag(self, flag: ThreadFlag) -> Self {
        Self(self.0 & !flag.bit())
    }
}

impl fmt::Debug for StateAndFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|flags={:#x}", self.state(), self.flags())
    }
}

/// Atomic cell holding a [`StateAndFlags`] word.
pub struct AtomicStateAndFlags(AtomicU32);

impl AtomicStateAndFlags {
    pub const fn new(state: ThreadState) -> Self {
        Self(AtomicU32::new(StateAndFlags::new(state).raw()))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> StateAndFlags {
        StateAndFlags(self.0.load(order))
    }

    /// CAS the whole word. Returns the observed word on failure.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: StateAndFlags,
        new: StateAndFlags,
        success: Ordering,
    ) -> Result<StateAndFlags, StateAndFlags> {
        self.0
            .compare_exchange_weak(current.0, new.0, success, Ordering::Relaxed)
            .map(StateAndFlags)
            .map_err(StateAndFlags)
    }

    /// Set `flag`, returning the previous word.
    #[inline]
    pub fn set_flag(&self, flag: ThreadFlag, order: Ordering) -> StateAndFlags {
        StateAndFlags(self.0.fetch_or(flag.bit(), order))
    }

    /// Clear `flag`, returning the previous word.
    #[inline]
    pub fn clear_flag(&self, flag: ThreadFlag, order: Ordering) -> StateAndFlags {
        StateAndFlags(self.0.fetch_and(!flag.bit(), order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(ThreadState::Runnable.is_runnable());
        assert!(!ThreadState::Runnable.is_suspended());
        for state in [
            ThreadState::Native,
            ThreadState::Blocked,
            ThreadState::WaitingWeakGcRootRead,
            ThreadState::WaitingPerformingGc,
            ThreadState::Terminated,
        ] {
            assert!(state.is_suspended(), "{state} should count as suspended");
        }
    }

    #[test]
    fn test_state_byte_roundtrip() {
        for v in 0u8..=13 {
            assert_eq!(ThreadState::from(v) as u8, v);
        }
    }

    #[test]
    #[should_panic(expected = "corrupt thread state byte 0x2a")]
    fn test_corrupt_state_byte_is_fatal() {
        let _ = ThreadState::from(42u8);
    }

    #[test]
    fn test_flags_do_not_disturb_state() {
        let word = StateAndFlags::new(ThreadState::Native)
            .with_flag(ThreadFlag::SuspendRequest)
            .with_flag(ThreadFlag::ActiveSuspendBarrier);
        assert_eq!(word.state(), ThreadState::Native);
        assert!(word.is_flag_set(ThreadFlag::SuspendRequest));
        assert!(!word.is_flag_set(ThreadFlag::CheckpointRequest));

        let word = word.with_state(ThreadState::Runnable);
        assert_eq!(word.state(), ThreadState::Runnable);
        assert_eq!(
            word.flags(),
            ThreadFlag::SuspendRequest.bit() | ThreadFlag::ActiveSuspendBarrier.bit()
        );

        let word = word.without_flag(ThreadFlag::SuspendRequest);
        assert!(!word.is_any_set(SUSPEND_OR_CHECKPOINT_REQUEST));
    }

    #[test]
    fn test_atomic_flag_ops() {
        let cell = AtomicStateAndFlags::new(ThreadState::Runnable);
        let prev = cell.set_flag(ThreadFlag::CheckpointRequest, Ordering::SeqCst);
        assert_eq!(prev.flags(), 0);

        let cur = cell.load(Ordering::SeqCst);
        let stale = StateAndFlags::new(ThreadState::Runnable);
        let err = cell
            .compare_exchange_weak(stale, stale.with_state(ThreadState::Native), Ordering::SeqCst)
            .unwrap_err();
        assert_eq!(err, cur);

        cell.clear_flag(ThreadFlag::CheckpointRequest, Ordering::SeqCst);
        assert_eq!(cell.load(Ordering::SeqCst), stale);
    }
}
