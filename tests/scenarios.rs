//! Integration-level scenarios from `spec.md` §8, run against the public
//! API only (no `pub(crate)` access, unlike the unit tests colocated with
//! each module).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex as StdMutex};
use std::time::Duration;

use grove::{Mutex, Service, Weight};

#[test]
fn scenario_1_single_task_fires_once() {
    let service = Service::new(2);
    let counter = Arc::new(AtomicUsize::new(0));
    let succeeded = Arc::new(AtomicUsize::new(0));
    let interrupted = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let c = counter.clone();
    let s = succeeded.clone();
    let i = interrupted.clone();
    let f = finished.clone();
    service
        .topmost_task(Weight::Light, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .succeeded(move || {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .interrupted(move || {
            i.fetch_add(1, Ordering::SeqCst);
        })
        .finished(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .start()
        .unwrap();

    service.wait_until_everything_is_done();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(succeeded.load(Ordering::SeqCst), 1);
    assert_eq!(interrupted.load(Ordering::SeqCst), 0);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[test]
fn scenario_2_interrupt_a_running_task() {
    let service = Service::new(2);
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let succeeded = Arc::new(AtomicUsize::new(0));
    let interrupted = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let saw_interrupted = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let seen = saw_interrupted.clone();
    let handle = service
        .topmost_task(Weight::Light, move || {
            started_tx.send(()).unwrap();
            go_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if let Some(current) = Service::current_task() {
                seen.store(current.is_interrupted(), Ordering::SeqCst);
            }
        })
        .succeeded({
            let s = succeeded.clone();
            move || {
                s.fetch_add(1, Ordering::SeqCst);
            }
        })
        .interrupted({
            let i = interrupted.clone();
            move || {
                i.fetch_add(1, Ordering::SeqCst);
            }
        })
        .finished({
            let f = finished.clone();
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            }
        })
        .start()
        .unwrap();

    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    handle.interrupt();
    go_tx.send(()).unwrap();

    service.wait_until_everything_is_done();

    assert_eq!(interrupted.load(Ordering::SeqCst), 1);
    assert_eq!(succeeded.load(Ordering::SeqCst), 0);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(saw_interrupted.load(Ordering::SeqCst));
}

/// Parent has both `succeeded` and `interrupted` registered; child has only
/// `interrupted` and `finished`. The driver interrupts the *parent* while
/// the child is mid-run. The child never has `interrupt()` called on it
/// directly, but inherits interruption from its parent (§8 invariant:
/// `isInterrupted() >= parent.isInterrupted()`), so it ends up firing its
/// own `interrupted` rather than propagating further (it has a handler).
/// The parent itself is directly interrupted, so it fires `interrupted`
/// instead of the `succeeded` it also registered.
#[test]
fn scenario_3_interrupt_parent_cancels_pending_child() {
    let service = Service::new(2);
    let (child_started_tx, child_started_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let child_succeeded = Arc::new(AtomicUsize::new(0));
    let child_interrupted = Arc::new(AtomicUsize::new(0));
    let child_finished = Arc::new(AtomicUsize::new(0));
    let parent_succeeded = Arc::new(AtomicUsize::new(0));
    let parent_interrupted = Arc::new(AtomicUsize::new(0));
    let parent_finished = Arc::new(AtomicUsize::new(0));

    let cs = child_succeeded.clone();
    let ci = child_interrupted.clone();
    let cf = child_finished.clone();
    let ps = parent_succeeded.clone();
    let pi = parent_interrupted.clone();
    let pf = parent_finished.clone();

    let parent = service
        .topmost_task(Weight::Light, move || {
            Service::child_task(Weight::Light, move || {
                child_started_tx.send(()).unwrap();
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
            })
            .expect("called from inside a running task")
            .succeeded(move || {
                cs.fetch_add(1, Ordering::SeqCst);
            })
            .interrupted(move || {
                ci.fetch_add(1, Ordering::SeqCst);
            })
            .finished(move || {
                cf.fetch_add(1, Ordering::SeqCst);
            })
            .start()
            .unwrap();
        })
        .succeeded(move || {
            ps.fetch_add(1, Ordering::SeqCst);
        })
        .interrupted(move || {
            pi.fetch_add(1, Ordering::SeqCst);
        })
        .finished(move || {
            pf.fetch_add(1, Ordering::SeqCst);
        })
        .start()
        .unwrap();

    child_started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    parent.interrupt();
    release_tx.send(()).unwrap();

    service.wait_until_everything_is_done();

    assert_eq!(child_succeeded.load(Ordering::SeqCst), 0);
    assert_eq!(child_interrupted.load(Ordering::SeqCst), 1);
    assert_eq!(child_finished.load(Ordering::SeqCst), 1);
    assert_eq!(parent_succeeded.load(Ordering::SeqCst), 0);
    assert_eq!(parent_interrupted.load(Ordering::SeqCst), 1);
    assert_eq!(parent_finished.load(Ordering::SeqCst), 1);
}

#[test]
fn scenario_4_child_interrupt_does_not_cancel_parent() {
    let service = Service::new(2);
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (go_tx, go_rx) = mpsc::channel::<()>();

    let child_interrupted = Arc::new(AtomicUsize::new(0));
    let child_finished = Arc::new(AtomicUsize::new(0));
    let parent_succeeded = Arc::new(AtomicUsize::new(0));
    let parent_finished = Arc::new(AtomicUsize::new(0));

    let ci = child_interrupted.clone();
    let cf = child_finished.clone();
    let ps = parent_succeeded.clone();
    let pf = parent_finished.clone();

    service
        .topmost_task(Weight::Light, move || {
            let child = Service::child_task(Weight::Light, move || {
                started_tx.send(()).unwrap();
                let _ = go_rx.recv_timeout(Duration::from_secs(5));
            })
            .expect("called from inside a running task")
            .interrupted(move || {
                ci.fetch_add(1, Ordering::SeqCst);
            })
            .finished(move || {
                cf.fetch_add(1, Ordering::SeqCst);
            })
            .start()
            .unwrap();

            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            child.interrupt();
            go_tx.send(()).unwrap();
        })
        .succeeded(move || {
            ps.fetch_add(1, Ordering::SeqCst);
        })
        .finished(move || {
            pf.fetch_add(1, Ordering::SeqCst);
        })
        .start()
        .unwrap();

    service.wait_until_everything_is_done();

    assert_eq!(child_interrupted.load(Ordering::SeqCst), 1);
    assert_eq!(child_finished.load(Ordering::SeqCst), 1);
    assert_eq!(parent_succeeded.load(Ordering::SeqCst), 1);
    assert_eq!(parent_finished.load(Ordering::SeqCst), 1);
}

#[test]
fn scenario_5_callback_driven_pipeline() {
    let service = Arc::new(Service::new(2));
    let order: Arc<StdMutex<Vec<u32>>> = Arc::new(StdMutex::new(Vec::new()));

    let a_body = order.clone();
    let svc = service.clone();
    service
        .topmost_task(Weight::Light, move || {
            a_body.lock().unwrap().push(0);
        })
        .succeeded(move || {
            // A succeeded: schedule B. `current_task()` is already restored
            // to A's parent (none) by the time `succeeded` fires, so B is a
            // fresh top-level task rather than A's child.
            let b_body = order.clone();
            let svc_b = svc.clone();
            svc.topmost_task(Weight::Light, move || {
                b_body.lock().unwrap().push(1);
            })
            .finished(move || {
                // B finished: schedule C.
                let c_body = order.clone();
                let c_succeeded = order.clone();
                let c_finished = order.clone();
                svc_b
                    .topmost_task(Weight::Light, move || {
                        c_body.lock().unwrap().push(2);
                    })
                    .succeeded(move || {
                        c_succeeded.lock().unwrap().push(3);
                    })
                    .finished(move || {
                        c_finished.lock().unwrap().push(4);
                    })
                    .start()
                    .unwrap();
            })
            .start()
            .unwrap();
        })
        .start()
        .unwrap();

    service.wait_until_everything_is_done();

    let order = order.lock().unwrap();
    assert_eq!(*order, vec![0, 1, 2, 3, 4]);
}

/// A child, at every level but the last, that spawns `levels[0]` children of
/// its own via `Service::child_task`; at the last level, a child that
/// increments `counter` `levels[0]` times. Mirrors the spec's six-deep
/// fan-out at a scale a test can actually run.
fn spawn_subtree(counter: &Arc<AtomicUsize>, levels: &[usize]) {
    let (branch, rest) = (levels[0], levels[1..].to_vec());
    if rest.is_empty() {
        let counter = counter.clone();
        Service::child_task(Weight::Light, move || {
            for _ in 0..branch {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .expect("called from inside a running task")
        .start()
        .unwrap();
        return;
    }
    let counter = counter.clone();
    Service::child_task(Weight::Light, move || {
        for _ in 0..branch {
            spawn_subtree(&counter, &rest);
        }
    })
    .expect("called from inside a running task")
    .start()
    .unwrap();
}

#[test]
#[serial_test::serial]
fn scenario_6_stress_fan_out() {
    // Reduced-scale stand-in for the spec's 10^7, six-deep (10x10x10x10x10x100)
    // fan-out: same shape, smaller factors, so the test finishes quickly.
    const BRANCH: [usize; 6] = [3, 3, 3, 3, 3, 4];
    let total: usize = BRANCH.iter().product();

    let service = Service::new(4);
    let counter = Arc::new(AtomicUsize::new(0));

    let (head, rest) = (BRANCH[0], BRANCH[1..].to_vec());
    let root_counter = counter.clone();
    service
        .topmost_task(Weight::Light, move || {
            for _ in 0..head {
                spawn_subtree(&root_counter, &rest);
            }
        })
        .start()
        .unwrap();

    service.wait_until_everything_is_done();

    assert_eq!(counter.load(Ordering::SeqCst), total);
}

/// §8 mutex invariant: at any instant either no task holds the mutex, every
/// holder is shared, or exactly one holder is exclusive. Mixes shared and
/// exclusive submissions under contention and has each one record whether
/// it ever observed a conflicting holder while it ran.
#[test]
#[serial_test::serial]
fn mutex_never_mixes_shared_and_exclusive_holders() {
    let service = Service::new(4);
    let mutex = Mutex::new(&service);
    let readers_active = Arc::new(AtomicUsize::new(0));
    let writer_active = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let violation = Arc::new(std::sync::atomic::AtomicBool::new(false));

    for _ in 0..8 {
        let readers_active = readers_active.clone();
        let writer_active = writer_active.clone();
        let violation = violation.clone();
        mutex
            .shared_root_task(Weight::Light, move || {
                readers_active.fetch_add(1, Ordering::SeqCst);
                if writer_active.load(Ordering::SeqCst) {
                    violation.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(2));
                readers_active.fetch_sub(1, Ordering::SeqCst);
            })
            .start()
            .unwrap();
    }

    for _ in 0..4 {
        let readers_active = readers_active.clone();
        let writer_active = writer_active.clone();
        let violation = violation.clone();
        mutex
            .root_task(Weight::Light, move || {
                if readers_active.load(Ordering::SeqCst) != 0 {
                    violation.store(true, Ordering::SeqCst);
                }
                writer_active.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
                writer_active.store(false, Ordering::SeqCst);
            })
            .start()
            .unwrap();
    }

    service.wait_until_everything_is_done();

    assert!(!violation.load(Ordering::SeqCst));
}

#[test]
#[serial_test::serial]
fn mutex_queued_child_is_force_finalized_when_parent_is_interrupted() {
    // A child queues behind an exclusive holder, never reaching
    // `MutexInner::admit_or_queue`'s admitted branch, so it sits in the
    // mutex's wait queue with only a reserved slot
    // (`notify_deferred_task`) on the parent — not yet in any weight
    // buffer. Interrupting the parent while the child is still queued,
    // then releasing the holder, drives the child through
    // `task_finished`'s requeue path (`add_deferred_task`) and into the
    // parent's own interrupt cascade, without the child's closure ever
    // running.
    let service = Service::new(4);
    // Held behind an `Arc` so the parent's closure can own a clone without
    // triggering `Mutex`'s blocking `Drop` the moment that closure returns
    // (only this function's own clone, dropped last, runs it for real).
    let mutex = Arc::new(Mutex::new(&service));

    let (holder_started_tx, holder_started_rx) = mpsc::channel::<()>();
    let (release_holder_tx, release_holder_rx) = mpsc::channel::<()>();
    let (child_queued_tx, child_queued_rx) = mpsc::channel::<()>();

    let holder_ran = Arc::new(AtomicUsize::new(0));
    let hr = holder_ran.clone();
    mutex
        .root_task(Weight::Light, move || {
            holder_started_tx.send(()).unwrap();
            hr.fetch_add(1, Ordering::SeqCst);
            release_holder_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        })
        .start()
        .unwrap();
    holder_started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let child_ran = Arc::new(AtomicUsize::new(0));
    let child_interrupted = Arc::new(AtomicUsize::new(0));
    let child_finished = Arc::new(AtomicUsize::new(0));
    let parent_interrupted = Arc::new(AtomicUsize::new(0));
    let parent_finished = Arc::new(AtomicUsize::new(0));

    let cr = child_ran.clone();
    let ci = child_interrupted.clone();
    let cf = child_finished.clone();
    let pi = parent_interrupted.clone();
    let pf = parent_finished.clone();
    let mutex_in_task = mutex.clone();
    let handle = service
        .topmost_task(Weight::Light, move || {
            mutex_in_task
                .child_task(Weight::Light, move || {
                    cr.fetch_add(1, Ordering::SeqCst);
                })
                .expect("called from inside a running task")
                .interrupted(move || {
                    ci.fetch_add(1, Ordering::SeqCst);
                })
                .finished(move || {
                    cf.fetch_add(1, Ordering::SeqCst);
                })
                .start()
                .unwrap();
            child_queued_tx.send(()).unwrap();
        })
        .interrupted(move || {
            pi.fetch_add(1, Ordering::SeqCst);
        })
        .finished(move || {
            pf.fetch_add(1, Ordering::SeqCst);
        })
        .start()
        .unwrap();

    child_queued_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    handle.interrupt();
    release_holder_tx.send(()).unwrap();

    service.wait_until_everything_is_done();

    assert_eq!(holder_ran.load(Ordering::SeqCst), 1);
    assert_eq!(child_ran.load(Ordering::SeqCst), 0);
    assert_eq!(child_interrupted.load(Ordering::SeqCst), 1);
    assert_eq!(child_finished.load(Ordering::SeqCst), 1);
    assert_eq!(parent_interrupted.load(Ordering::SeqCst), 1);
    assert_eq!(parent_finished.load(Ordering::SeqCst), 1);
}
