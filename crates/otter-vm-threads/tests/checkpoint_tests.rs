//! Checkpoint tests
//!
//! Checkpoints on runnable and suspended threads, empty checkpoints, weak
//! reference waiters and synchronous checkpoints.

use otter_vm_threads::{
    Checkpoint, CheckpointBarrier, ManagedThread, ThreadId, ThreadKind, ThreadList, ThreadState,
    ThreadsConfig,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;
use std::time::Duration;

type Worker = JoinHandle<Result<(), otter_vm_threads::ThreadError>>;

fn spawn_polling_mutator(
    list: &Arc<ThreadList>,
    name: &str,
    stop: &Arc<AtomicBool>,
) -> (ThreadId, Worker) {
    let (tx, rx) = mpsc::channel();
    let stop = Arc::clone(stop);
    let handle = list
        .spawn(name, move |thread: &ManagedThread| {
            tx.send(thread.id()).unwrap();
            while !stop.load(Ordering::Acquire) {
                thread.check_suspend();
                std::hint::spin_loop();
            }
        })
        .unwrap();
    (rx.recv().unwrap(), handle)
}

// ============================================================================
// run_checkpoint
// ============================================================================

#[test]
fn test_run_checkpoint_reaches_every_thread() {
    let list = ThreadList::new();
    let stop = Arc::new(AtomicBool::new(false));
    let mut ids: Vec<ThreadId> = Vec::new();
    let mut workers = Vec::new();
    for i in 0..3 {
        let (id, worker) = spawn_polling_mutator(&list, &format!("m{i}"), &stop);
        ids.push(id);
        workers.push(worker);
    }
    let idle = list.attach("idle", ThreadKind::Mutator).unwrap();
    ids.push(idle.id());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(CheckpointBarrier::new(0));
    let requester = std::thread::current().id();
    let checkpoint = {
        let seen = Arc::clone(&seen);
        let barrier = Arc::clone(&barrier);
        move |thread: &ManagedThread| {
            let on_requester = std::thread::current().id() == requester;
            seen.lock().push((thread.id(), on_requester));
            barrier.pass();
        }
    };

    let count = list.run_checkpoint(None, Arc::new(checkpoint));
    assert_eq!(count, 4);
    barrier.increment(count as i32);

    let mut seen = seen.lock().clone();
    seen.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(seen.iter().map(|(id, _)| *id).collect::<Vec<_>>(), expected);
    // Only the suspended thread's closure ran here, on its behalf.
    for (id, on_requester) in &seen {
        assert_eq!(*on_requester, *id == idle.id(), "thread {id}");
    }
    assert_eq!(idle.suspend_count(), 0);
    assert_eq!(list.stats().checkpoints, 1);

    stop.store(true, Ordering::Release);
    for worker in workers {
        worker.join().unwrap().unwrap();
    }
    list.detach(&idle).unwrap();
}

#[test]
fn test_checkpoint_snapshots_report_runnable_threads() {
    let list = ThreadList::new();
    let stop = Arc::new(AtomicBool::new(false));
    let (id, worker) = spawn_polling_mutator(&list, "busy", &stop);
    let gc = list.attach("gc", ThreadKind::Collector).unwrap();

    let snapshots = list.checkpoint_snapshots(Some(&gc));
    assert_eq!(snapshots.len(), 2);
    let busy = snapshots.iter().find(|s| s.id == id).unwrap();
    assert_eq!(busy.state, ThreadState::Runnable);
    assert_eq!(busy.name, "busy");
    let me = snapshots.iter().find(|s| s.id == gc.id()).unwrap();
    assert_eq!(me.kind, ThreadKind::Collector);
    assert_eq!(gc.state(), ThreadState::WaitingPerformingGc);

    stop.store(true, Ordering::Release);
    worker.join().unwrap().unwrap();
    list.detach(&gc).unwrap();
}

#[test]
fn test_visit_suspended_threads_skips_runnable() {
    let list = ThreadList::new();
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    // No suspend points, so it stays Runnable throughout.
    let worker = {
        let stop = Arc::clone(&stop);
        list.spawn("busy", move |thread: &ManagedThread| {
            tx.send(thread.id()).unwrap();
            while !stop.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
        })
        .unwrap()
    };
    let busy = rx.recv().unwrap();
    let idle = list.attach("idle", ThreadKind::Mutator).unwrap();

    let mut visited = Vec::new();
    let count = list.visit_suspended_threads(None, |thread| {
        assert!(thread.is_suspended());
        visited.push(thread.id());
    });
    assert_eq!(count, 1);
    assert_eq!(visited, vec![idle.id()]);
    assert!(!visited.contains(&busy));
    assert_eq!(idle.suspend_count(), 0);

    stop.store(true, Ordering::Release);
    worker.join().unwrap().unwrap();
    list.detach(&idle).unwrap();
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "weak reference access is disabled")]
fn test_checkpoint_while_weak_access_disabled_is_fatal() {
    let config = ThreadsConfig {
        debug_locking: true,
        ..ThreadsConfig::default()
    };
    let list = ThreadList::with_config(config);
    list.weak_ref_access().disable();
    list.run_checkpoint(None, Arc::new(|_: &ManagedThread| {}));
}

// ============================================================================
// Empty checkpoints
// ============================================================================

#[test]
fn test_empty_checkpoint_waits_for_suspend_point() {
    let list = ThreadList::new();
    let release = Arc::new(AtomicBool::new(false));
    let passed = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    let worker = {
        let release = Arc::clone(&release);
        let passed = Arc::clone(&passed);
        let stop = Arc::clone(&stop);
        list.spawn("tight-loop", move |thread: &ManagedThread| {
            tx.send(()).unwrap();
            let mut spins = 0u64;
            while !release.load(Ordering::Acquire) {
                spins = spins.wrapping_add(1);
                std::hint::spin_loop();
            }
            passed.store(true, Ordering::Release);
            thread.check_suspend();
            while !stop.load(Ordering::Acquire) {
                thread.check_suspend();
            }
            spins
        })
        .unwrap()
    };
    rx.recv().unwrap();

    let releaser = {
        let release = Arc::clone(&release);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            release.store(true, Ordering::Release);
        })
    };

    list.run_empty_checkpoint(None);
    assert!(passed.load(Ordering::Acquire));
    assert_eq!(list.stats().empty_checkpoints, 1);

    releaser.join().unwrap();
    stop.store(true, Ordering::Release);
    worker.join().unwrap().unwrap();
}

#[test]
fn test_empty_checkpoint_ignores_suspended_threads() {
    let list = ThreadList::new();
    let idle = list.attach("idle", ThreadKind::Mutator).unwrap();
    let gc = list.attach("gc", ThreadKind::Collector).unwrap();
    list.run_empty_checkpoint(Some(&gc));
    assert_eq!(gc.state(), ThreadState::WaitingPerformingGc);
    list.detach(&gc).unwrap();
    list.detach(&idle).unwrap();
}

#[test]
fn test_empty_checkpoint_wakes_weak_ref_waiter() {
    let list = ThreadList::new();
    list.weak_ref_access().disable();
    let (tx, rx) = mpsc::channel();
    let waiter = {
        let l = Arc::clone(&list);
        list.spawn("weak-reader", move |thread: &ManagedThread| {
            tx.send(()).unwrap();
            l.weak_ref_access().wait_until_enabled(thread);
            thread.state()
        })
        .unwrap()
    };
    rx.recv().unwrap();
    std::thread::sleep(Duration::from_millis(10));

    // The waiter stays Runnable and answers from inside its wait loop.
    list.run_empty_checkpoint(None);
    list.run_empty_checkpoint(None);

    list.weak_ref_access().enable();
    assert_eq!(waiter.join().unwrap().unwrap(), ThreadState::Runnable);
}

// ============================================================================
// Synchronous checkpoints
// ============================================================================

#[test]
fn test_synchronous_checkpoint_on_suspended_target_runs_on_behalf() {
    let list = ThreadList::new();
    let caller = list.attach("caller", ThreadKind::Mutator).unwrap();
    let target = list.attach("target", ThreadKind::Mutator).unwrap();
    let ran_for = Arc::new(AtomicU32::new(0));
    let r = Arc::clone(&ran_for);
    let checkpoint: Arc<dyn Checkpoint> = Arc::new(move |t: &ManagedThread| {
        assert!(t.is_suspended());
        r.store(t.id().as_u32(), Ordering::SeqCst);
    });

    list.request_synchronous_checkpoint(&caller, &target, checkpoint)
        .unwrap();
    assert_eq!(ran_for.load(Ordering::SeqCst), target.id().as_u32());
    assert_eq!(target.suspend_count(), 0);
    assert_eq!(caller.state(), ThreadState::Native);

    list.detach(&target).unwrap();
    list.detach(&caller).unwrap();
}

#[test]
fn test_synchronous_checkpoint_on_self_runs_inline() {
    let list = ThreadList::new();
    let me = list.attach("me", ThreadKind::Mutator).unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&ran);
    list.request_synchronous_checkpoint(
        &me,
        &me,
        Arc::new(move |_: &ManagedThread| r.store(true, Ordering::SeqCst)),
    )
    .unwrap();
    assert!(ran.load(Ordering::SeqCst));
    list.detach(&me).unwrap();
}

#[test]
fn test_mutual_synchronous_checkpoints() {
    for _ in 0..20 {
        let list = ThreadList::new();
        let ids: Arc<[AtomicU32; 2]> = Arc::new([AtomicU32::new(0), AtomicU32::new(0)]);
        let ran = Arc::new(AtomicU32::new(0));
        let done = Arc::new(AtomicU32::new(0));
        let start = Arc::new(Barrier::new(2));

        let workers: Vec<_> = (0..2)
            .map(|me| {
                let l = Arc::clone(&list);
                let ids = Arc::clone(&ids);
                let ran = Arc::clone(&ran);
                let done = Arc::clone(&done);
                let start = Arc::clone(&start);
                list.spawn(format!("peer-{me}"), move |thread: &ManagedThread| {
                    ids[me].store(thread.id().as_u32(), Ordering::Release);
                    {
                        let _wait = otter_vm_threads::ScopedThreadSuspension::new(
                            thread,
                            ThreadState::Waiting,
                        );
                        start.wait();
                    }
                    let other = ThreadId::from_raw(ids[1 - me].load(Ordering::Acquire));
                    let target = l.find(other).unwrap();
                    let ran = Arc::clone(&ran);
                    l.request_synchronous_checkpoint(
                        thread,
                        &target,
                        Arc::new(move |_: &ManagedThread| {
                            ran.fetch_add(1, Ordering::AcqRel);
                        }),
                    )?;
                    done.fetch_add(1, Ordering::AcqRel);
                    while done.load(Ordering::Acquire) < 2 {
                        thread.check_suspend();
                        std::hint::spin_loop();
                    }
                    Ok::<(), otter_vm_threads::ThreadError>(())
                })
                .unwrap()
            })
            .collect();

        for worker in workers {
            worker.join().unwrap().unwrap().unwrap();
        }
        assert_eq!(ran.load(Ordering::Acquire), 2);
    }
}
