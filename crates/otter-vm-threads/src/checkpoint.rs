//! Checkpoint closures
//!
//! A checkpoint is work that must run "as" a particular thread: either by the
//! thread itself at its next suspend point, or by a requester on its behalf
//! while the thread is held suspended.

use crate::barrier::CheckpointBarrier;
use crate::thread::ManagedThread;
use std::sync::Arc;

/// Work run against one thread.
///
/// Implementations run with the mutator lock held shared (or with the target
/// stably suspended) and may only acquire locks below `LockLevel::Monitor`.
pub trait Checkpoint: Send + Sync {
    fn run(&self, thread: &ManagedThread);
}

impl<F> Checkpoint for F
where
    F: Fn(&ManagedThread) + Send + Sync,
{
    fn run(&self, thread: &ManagedThread) {
        self(thread)
    }
}

/// Runs `inner` then passes `barrier`.
pub(crate) struct BarrierCheckpoint {
    pub(crate) inner: Arc<dyn Checkpoint>,
    pub(crate) barrier: Arc<CheckpointBarrier>,
}

impl Checkpoint for BarrierCheckpoint {
    fn run(&self, thread: &ManagedThread) {
        self.inner.run(thread);
        self.barrier.pass();
    }
}
