//! # Otter VM Thread Coordination
//!
//! How mutator threads and the collector agree on who may touch the heap.
//!
//! ## Design
//!
//! - **Thread states**: `Runnable` logically holds the mutator lock shared,
//!   every other state counts as suspended
//! - **Suspend points**: runnable threads poll a per-thread state-and-flags
//!   word and answer suspend, checkpoint and empty-checkpoint requests
//! - **Suspension**: requesters raise suspend counts and wait on barriers
//!   that targets (or the requester, on their behalf) count down
//! - **Checkpoints**: closures run by a thread at its next suspend point, or
//!   by the requester while the target is held suspended
//! - **Lock levels**: every lock has a level; acquisition order is checked
//!   in debug builds
//!
//! Everything hangs off a [`ThreadList`], the coordination context. There are
//! no process-wide singletons.

#![warn(clippy::all)]

/// Log a contract violation and panic. With `panic = "abort"` this aborts.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!(target: "otter_vm_threads", "{}", message);
        panic!("{}", message)
    }};
}

pub mod barrier;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod locks;
pub mod mutator_lock;
pub mod scoped;
pub mod state;
pub mod stats;
pub mod thread;
pub mod thread_list;
pub mod weak_ref;

pub use barrier::{CheckpointBarrier, SuspendBarrier};
pub use checkpoint::Checkpoint;
pub use config::ThreadsConfig;
pub use error::{ThreadError, ThreadResult};
pub use locks::{LockLevel, OrderedCondvar, OrderedMutex, OrderedMutexGuard};
pub use mutator_lock::{MutatorLock, SharedMutatorGuard};
pub use scoped::{
    ScopedAssertNoThreadSuspension, ScopedObjectAccess, ScopedSuspendAll,
    ScopedThreadStateChange, ScopedThreadSuspension,
};
pub use state::{StateAndFlags, ThreadFlag, ThreadState};
pub use stats::SuspendStats;
pub use thread::{ManagedThread, ThreadId, ThreadKind};
pub use thread_list::{ThreadList, ThreadSnapshot};
pub use weak_ref::WeakRefAccess;
