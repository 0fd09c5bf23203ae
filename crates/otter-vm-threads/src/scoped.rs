//! RAII guards for thread state changes
//!
//! Each guard performs a transition on construction and the inverse on drop.
//! They borrow the thread and are `!Send`: a thread's state is only ever
//! changed from the OS thread it is attached on.

use crate::locks;
use crate::state::ThreadState;
use crate::thread::ManagedThread;
use crate::thread_list::ThreadList;
use std::marker::PhantomData;

type NotSend = PhantomData<*const ()>;

/// Leave `Runnable` for a suspended state; re-enter `Runnable` on drop.
pub struct ScopedThreadSuspension<'a> {
    thread: &'a ManagedThread,
    _not_send: NotSend,
}

impl<'a> ScopedThreadSuspension<'a> {
    pub fn new(thread: &'a ManagedThread, suspended_state: ThreadState) -> Self {
        thread.transition_from_runnable_to_suspended(suspended_state);
        Self {
            thread,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ScopedThreadSuspension<'_> {
    fn drop(&mut self) {
        self.thread.transition_from_suspended_to_runnable();
    }
}

/// Enter `Runnable` for managed-heap access; restore the previous state on drop.
pub struct ScopedObjectAccess<'a> {
    thread: &'a ManagedThread,
    old_state: ThreadState,
    _not_send: NotSend,
}

impl<'a> ScopedObjectAccess<'a> {
    pub fn new(thread: &'a ManagedThread) -> Self {
        let old_state = thread.transition_from_suspended_to_runnable();
        Self {
            thread,
            old_state,
            _not_send: PhantomData,
        }
    }

    /// The thread this access runs as
    pub fn thread(&self) -> &'a ManagedThread {
        self.thread
    }
}

impl Drop for ScopedObjectAccess<'_> {
    fn drop(&mut self) {
        self.thread
            .transition_from_runnable_to_suspended(self.old_state);
    }
}

/// Switch to any state and back.
///
/// Picks the right transition for each direction, so it works whether the
/// thread starts `Runnable` or suspended.
pub struct ScopedThreadStateChange<'a> {
    thread: &'a ManagedThread,
    old_state: ThreadState,
    _not_send: NotSend,
}

impl<'a> ScopedThreadStateChange<'a> {
    pub fn new(thread: &'a ManagedThread, new_state: ThreadState) -> Self {
        let old_state = thread.state();
        Self::change(thread, old_state, new_state);
        Self {
            thread,
            old_state,
            _not_send: PhantomData,
        }
    }

    fn change(thread: &ManagedThread, from: ThreadState, to: ThreadState) {
        match (from.is_runnable(), to.is_runnable()) {
            (true, true) => {}
            (true, false) => thread.transition_from_runnable_to_suspended(to),
            (false, true) => {
                thread.transition_from_suspended_to_runnable();
            }
            (false, false) => {
                thread.set_state(to);
            }
        }
    }
}

impl Drop for ScopedThreadStateChange<'_> {
    fn drop(&mut self) {
        let current = self.thread.state();
        Self::change(self.thread, current, self.old_state);
    }
}

/// Suspend every other thread for the guard's lifetime.
pub struct ScopedSuspendAll<'a> {
    list: &'a ThreadList,
    thread: Option<&'a ManagedThread>,
    _not_send: NotSend,
}

impl<'a> ScopedSuspendAll<'a> {
    /// `thread` is the caller if it is registered; it must not be `Runnable`.
    pub fn new(list: &'a ThreadList, thread: Option<&'a ManagedThread>, cause: &str) -> Self {
        list.suspend_all(thread, cause);
        Self {
            list,
            thread,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ScopedSuspendAll<'_> {
    fn drop(&mut self) {
        self.list.resume_all(self.thread);
    }
}

/// Forbid leaving `Runnable` (in debug builds) for the guard's lifetime.
pub struct ScopedAssertNoThreadSuspension {
    _not_send: NotSend,
}

impl ScopedAssertNoThreadSuspension {
    pub fn new(cause: &'static str) -> Self {
        locks::enter_no_suspension(cause);
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for ScopedAssertNoThreadSuspension {
    fn drop(&mut self) {
        locks::exit_no_suspension();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadKind;

    #[test]
    fn test_object_access_restores_state() {
        let list = ThreadList::new();
        let thread = list.attach("main", ThreadKind::Mutator).unwrap();
        thread.set_state(ThreadState::Sleeping);
        {
            let soa = ScopedObjectAccess::new(&thread);
            assert!(soa.thread().state().is_runnable());
            {
                let _s = ScopedThreadSuspension::new(&thread, ThreadState::Blocked);
                assert_eq!(thread.state(), ThreadState::Blocked);
            }
            assert!(thread.state().is_runnable());
        }
        assert_eq!(thread.state(), ThreadState::Sleeping);
        list.detach(&thread).unwrap();
    }

    #[test]
    fn test_state_change_covers_every_direction() {
        let list = ThreadList::new();
        let thread = list.attach("main", ThreadKind::Mutator).unwrap();
        {
            let _runnable = ScopedThreadStateChange::new(&thread, ThreadState::Runnable);
            assert!(thread.state().is_runnable());
            {
                let _waiting = ScopedThreadStateChange::new(&thread, ThreadState::Waiting);
                assert_eq!(thread.state(), ThreadState::Waiting);
                {
                    let _timed = ScopedThreadStateChange::new(&thread, ThreadState::TimedWaiting);
                    assert_eq!(thread.state(), ThreadState::TimedWaiting);
                }
                assert_eq!(thread.state(), ThreadState::Waiting);
            }
            assert!(thread.state().is_runnable());
        }
        assert_eq!(thread.state(), ThreadState::Native);
        list.detach(&thread).unwrap();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "forbidden here: walking the stack")]
    fn test_no_suspension_guard() {
        let list = ThreadList::new();
        let thread = list.attach("main", ThreadKind::Mutator).unwrap();
        let _soa = ScopedObjectAccess::new(&thread);
        let _no_suspend = ScopedAssertNoThreadSuspension::new("walking the stack");
        thread.full_suspend_check();
    }
}
