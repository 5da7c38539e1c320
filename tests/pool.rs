//! Thread pool: transfers, closures, promise resolution, shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use weft::{AwaitError, Future, Task, ThreadPool};

#[test]
fn transfer_moves_task_to_worker() {
    let pool = ThreadPool::new(2);
    let handle = pool.transfer();
    let ids = Task::new(async move {
        let before = thread::current().id();
        handle.await.unwrap();
        let after = thread::current().id();
        (before, after)
    })
    .start();
    let (before, after) = *ids.wait().unwrap();
    assert_eq!(before, thread::current().id());
    assert_ne!(before, after);
    pool.stop();
}

#[test]
fn work_stays_on_worker_until_next_transfer() {
    let pool = ThreadPool::new(1);
    let handle = pool.transfer();
    let ids = Task::new(async move {
        handle.await.unwrap();
        let first = thread::current().id();
        weft::yield_now().await;
        let second = thread::current().id();
        (first, second)
    })
    .start();
    let (first, second) = *ids.wait().unwrap();
    assert_eq!(first, second);
    pool.stop();
}

#[test]
fn run_delivers_closure_result() {
    let pool = ThreadPool::new(2);
    let fut = pool.run(|| 21 * 2);
    assert_eq!(*fut.wait().unwrap(), 42);
    pool.stop();
}

#[test]
fn run_panicking_closure_cancels_future() {
    let pool = ThreadPool::new(1);
    let fut: Future<u32> = pool.run(|| panic!("worker blew up"));
    match fut.wait() {
        Err(AwaitError::Canceled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
    // The pool survives the panic of a job.
    let again = pool.run(|| 5);
    assert_eq!(*again.wait().unwrap(), 5);
    pool.stop();
}

#[test]
fn on_worker_discovery() {
    let pool = Arc::new(ThreadPool::new(1));
    assert!(!pool.on_worker());
    let p = pool.clone();
    let fut = pool.run(move || p.on_worker());
    assert_eq!(*fut.wait().unwrap(), true);
    pool.stop();
}

#[test]
fn zero_workers_defaults_to_hardware_parallelism() {
    let pool = ThreadPool::new(0);
    let fut = pool.run(|| 1);
    assert_eq!(*fut.wait().unwrap(), 1);
    pool.stop();
}

#[test]
fn run_detached_executes() {
    let pool = ThreadPool::new(1);
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    pool.run_detached(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    for _ in 0..100 {
        if hits.load(Ordering::SeqCst) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    pool.stop();
}

#[test]
fn resolve_runs_consumers_on_worker() {
    let pool = ThreadPool::new(1);
    let mut gate = Future::<u32>::new();
    let promise = gate.get_promise();
    let main_thread = thread::current().id();
    let woke_on = Task::new(async move {
        let v = *gate.get().await.unwrap();
        (v, thread::current().id())
    })
    .start();
    pool.resolve(promise, 9);
    let (v, tid) = *woke_on.wait().unwrap();
    assert_eq!(v, 9);
    assert_ne!(tid, main_thread);
    pool.stop();
}

#[test]
fn resume_redirects_suspend_point_to_workers() {
    let pool = ThreadPool::new(2);
    let mut gate = Future::<()>::new();
    let promise = gate.get_promise();
    let main_thread = thread::current().id();
    let woke_on = Task::new(async move {
        gate.get().await.unwrap();
        thread::current().id()
    })
    .start();
    let point = promise.set(());
    assert_eq!(point.len(), 1);
    let won = pool.resume(point);
    assert!(won);
    let tid = *woke_on.wait().unwrap();
    assert_ne!(tid, main_thread);
    pool.stop();
}

#[test]
fn wrap_forces_resumption_onto_worker() {
    let pool = ThreadPool::new(1);
    let mut gate = Future::<()>::new();
    let promise = gate.get_promise();
    let main_thread = thread::current().id();
    let wrapped = pool.wrap(async move {
        gate.get().await.unwrap();
        thread::current().id()
    });
    let woke_on = Task::new(wrapped).start();
    // Resolve on this thread; the wrap re-dispatches the wake.
    let _ = promise.set(());
    let tid = *woke_on.wait().unwrap();
    assert_ne!(tid, main_thread);
    pool.stop();
}

#[test]
fn stopping_cancels_queued_transfers() {
    let pool = ThreadPool::new(1);
    // Jam the single worker so further jobs stay queued.
    let release = Arc::new(std::sync::Barrier::new(2));
    let r = release.clone();
    pool.run_detached(move || {
        r.wait();
    });
    let parked = Task::new({
        let handle = pool.transfer();
        async move { handle.await }
    })
    .start();
    assert!(parked.is_pending());
    release.wait();
    pool.stop();
    let outcome = parked.wait().unwrap();
    assert!(matches!(outcome, Ok(()) | Err(AwaitError::Canceled)));
}
