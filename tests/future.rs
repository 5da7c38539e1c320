//! Future / promise resolution, cancellation, and sharing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use weft::{AwaitError, Future, Promise, SharedFuture, Task, TaskError};

#[test]
fn set_then_read() {
    let mut fut = Future::new();
    let promise = fut.get_promise();
    assert!(fut.is_pending());
    assert!(matches!(fut.value(), Err(AwaitError::NotReady)));
    let sp = promise.set(42);
    assert_eq!(sp.value(), Some(&true));
    drop(sp);
    assert!(fut.is_ready());
    assert_eq!(*fut.value().unwrap(), 42);
    // Multiple reads observe the same value.
    assert_eq!(*fut.value().unwrap(), 42);
}

#[test]
fn dropped_promise_cancels() {
    let mut fut = Future::<u32>::new();
    let promise = fut.get_promise();
    drop(promise);
    assert!(fut.is_ready());
    assert!(matches!(fut.value(), Err(AwaitError::Canceled)));
}

#[test]
fn spent_promise_reports_loss() {
    let sp = Promise::<u32>::spent().set(7);
    assert_eq!(sp.value(), Some(&false));
}

#[test]
fn error_propagates_to_every_reader() {
    let mut fut = Future::<u32>::new();
    let promise = fut.get_promise();
    drop(promise.set_error(TaskError::msg("backend fell over")));
    for _ in 0..2 {
        match fut.value() {
            Err(AwaitError::Failed(e)) => assert_eq!(e.to_string(), "backend fell over"),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}

#[test]
fn take_moves_value_out() {
    let mut fut = Future::new();
    let promise = fut.get_promise();
    drop(promise.set(String::from("payload")));
    assert_eq!(fut.take().unwrap(), "payload");
    assert!(matches!(fut.value(), Err(AwaitError::Canceled)));
}

#[test]
fn wait_blocks_until_cross_thread_set() {
    let mut fut = Future::new();
    let promise = fut.get_promise();
    let setter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let _ = promise.set(99);
    });
    assert_eq!(*fut.wait().unwrap(), 99);
    setter.join().unwrap();
}

#[test]
fn task_awaits_promise_and_returns() {
    // A task awaits a void future, then produces its own value.
    let mut gate = Future::<()>::new();
    let promise = gate.get_promise();
    let result = Task::new(async move {
        gate.get().await.unwrap();
        42
    })
    .start();
    assert!(result.is_pending());
    let _ = promise.set(());
    assert_eq!(*result.wait().unwrap(), 42);
}

#[test]
fn initiator_constructor_resolves_through_stored_promise() {
    let fut = Future::new_with(|promise| {
        let _setter = thread::spawn(move || {
            let _ = promise.set(5u32);
        });
    });
    assert_eq!(*fut.wait().unwrap(), 5);
}

#[test]
fn has_value_distinguishes_empty_resolution() {
    let with_value = Future::ready(1);
    let canceled = Future::<u32>::canceled();
    let failed = Future::<u32>::failed(TaskError::msg("x"));
    let probe = Task::new(async move {
        (
            with_value.has_value().await,
            canceled.has_value().await,
            failed.has_value().await,
        )
    })
    .start();
    assert_eq!(*probe.wait().unwrap(), (true, false, true));
}

#[test]
fn bind_defers_resolution() {
    let mut fut = Future::new();
    let deliver = fut.get_promise().bind(17);
    assert!(fut.is_pending());
    let handle = thread::spawn(move || {
        let _ = deliver();
    });
    assert_eq!(*fut.wait().unwrap(), 17);
    handle.join().unwrap();
}

#[test]
fn awaiter_chained_before_ready_resumes_exactly_once() {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut gate = Future::<()>::new();
    let promise = gate.get_promise();
    let shared = gate.into_shared();
    let results: Vec<Future<()>> = (0..4)
        .map(|_| {
            let shared = shared.clone();
            let hits = hits.clone();
            Task::new(async move {
                shared.get().await.unwrap();
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .start()
        })
        .collect();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    let _ = promise.set(());
    for r in &results {
        r.sync();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[test]
fn shared_future_reads_after_resolution() {
    let shared = SharedFuture::new_with(|promise| {
        let _ = promise.set(31u32);
    });
    let a = shared.clone();
    let b = shared;
    assert_eq!(*a.value().unwrap(), 31);
    assert_eq!(*b.wait().unwrap(), 31);
}

#[test]
fn shared_future_survives_dropped_handles_while_pending() {
    let mut fut = Future::new();
    let promise = fut.get_promise();
    let shared = fut.into_shared();
    drop(shared.clone());
    drop(shared);
    // No handle left; the promise still resolves into a live cell.
    let sp = promise.set(1u32);
    assert_eq!(sp.value(), Some(&true));
}

#[test]
fn future_from_task_starts_it() {
    let fut = Future::from_task(Task::new(async { 6 * 7 }));
    assert_eq!(*fut.wait().unwrap(), 42);
}
