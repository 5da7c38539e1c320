//! Async mutex: FIFO hand-off, ownership transfer, explicit release.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use weft::{queue, Mutex, Task, ThreadPool};

#[test]
fn try_lock_respects_ownership() {
    let mutex = Mutex::new(5);
    let guard = mutex.try_lock().unwrap();
    assert!(mutex.try_lock().is_err());
    drop(guard);
    let mut guard = mutex.try_lock().unwrap();
    *guard += 1;
    drop(guard);
    assert_eq!(mutex.into_inner(), 6);
}

#[test]
fn contended_acquisitions_run_in_arrival_order() {
    // Four tasks lock in order 1..=4; the release cascade must hand the
    // mutex over in exactly that order.
    let mutex = Arc::new(Mutex::new(Vec::<u32>::new()));
    queue::install_and_flush(|| {
        for id in 1..=4u32 {
            let mutex = mutex.clone();
            let _ = Task::new(async move {
                let mut acquired = mutex.lock().await;
                acquired.push(id);
                weft::yield_now().await;
            })
            .detach();
        }
    });
    let log = mutex.try_lock().unwrap();
    assert_eq!(*log, vec![1, 2, 3, 4]);
}

#[test]
fn data_protected_across_interleaved_increments() {
    let mutex = Arc::new(Mutex::new(0u64));
    queue::install_and_flush(|| {
        for _ in 0..8 {
            let mutex = mutex.clone();
            let _ = Task::new(async move {
                for _ in 0..10 {
                    let mut counter = mutex.lock().await;
                    let v = *counter;
                    weft::yield_now().await;
                    *counter = v + 1;
                }
            })
            .detach();
        }
    });
    assert_eq!(*mutex.try_lock().unwrap(), 80);
}

#[test]
fn explicit_release_carries_next_owner() {
    let mutex = Arc::new(Mutex::new(()));
    let order = Arc::new(AtomicU32::new(0));
    let o1 = order.clone();
    let m1 = mutex.clone();
    queue::install_and_flush(|| {
        let m = mutex.clone();
        let _ = Task::new(async move {
            let guard = m.lock().await;
            weft::yield_now().await;
            let next = guard.release();
            // One waiter queued up while we held the lock.
            assert_eq!(next.len(), 1);
            next.await;
        })
        .detach();
        let _ = Task::new(async move {
            let _guard = m1.lock().await;
            o1.store(1, Ordering::SeqCst);
        })
        .detach();
    });
    assert_eq!(order.load(Ordering::SeqCst), 1);
}

#[test]
fn release_from_worker_thread_transfers_cleanly() {
    let pool = ThreadPool::new(2);
    let mutex = Arc::new(Mutex::new(0u32));
    let m = mutex.clone();
    let done = pool.run_task(Task::new(async move {
        let mut guard = m.lock().await;
        *guard = 7;
        drop(guard);
        *m.lock().await
    }));
    assert_eq!(*done.wait().unwrap(), 7);
    pool.stop();
}

#[test]
fn guard_deref_reads_and_writes() {
    let mutex = Arc::new(Mutex::new(String::new()));
    let m = mutex.clone();
    let fut = Task::new(async move {
        let mut s = m.lock().await;
        s.push_str("held");
        s.len()
    })
    .start();
    assert_eq!(*fut.wait().unwrap(), 4);
    assert_eq!(&*mutex.try_lock().unwrap(), "held");
}
