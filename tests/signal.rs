//! Signal broadcast: emitters, collector lifetime, callbacks, hook_up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weft::{hook_up, queue, AwaitError, Signal, Task};

#[test]
fn pre_subscribed_emitter_receives_value() {
    let signal = Signal::new();
    let emitter = signal.emitter();
    let collector = signal.collector();
    let received = Task::new(async move { emitter.listen().await.unwrap() }).start();
    assert!(received.is_pending());
    let _awaiters = collector.send(42u32);
    assert_eq!(*received.wait().unwrap(), 42);
}

#[test]
fn every_parked_emitter_gets_the_broadcast() {
    let signal = Signal::new();
    let collector = signal.collector();
    let results: Vec<_> = (0..3)
        .map(|_| {
            let emitter = signal.emitter();
            Task::new(async move { emitter.listen().await.unwrap() }).start()
        })
        .collect();
    let _awaiters = collector.send("tick");
    for r in &results {
        assert_eq!(*r.wait().unwrap(), "tick");
    }
}

#[test]
fn late_subscriber_misses_prior_emission() {
    let signal = Signal::new();
    let collector = signal.collector();
    let _ = collector.send(1u8);
    let emitter = signal.emitter();
    let listener = Task::new(async move { emitter.listen().await.unwrap() }).start();
    // Nothing was emitted since the subscription; still waiting.
    assert!(listener.is_pending());
    let _ = collector.send(2u8);
    assert_eq!(*listener.wait().unwrap(), 2);
}

#[test]
fn dropping_collector_cancels_emitters() {
    let signal = Signal::<u8>::new();
    let emitter = signal.emitter();
    let listener = Task::new(async move { emitter.listen().await }).start();
    assert!(listener.is_pending());
    drop(signal);
    match listener.wait().unwrap() {
        Err(AwaitError::Canceled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[test]
fn callback_unsubscribes_on_false() {
    let signal = Signal::new();
    let collector = signal.collector();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    signal.connect(move |v: &u32| {
        h.fetch_add(*v as usize, Ordering::SeqCst);
        *v < 10
    });
    let _ = collector.send(1);
    let _ = collector.send(2);
    let _ = collector.send(10);
    // Returned false on 10; this one is not observed.
    let _ = collector.send(100);
    assert_eq!(hits.load(Ordering::SeqCst), 13);
}

#[test]
fn hook_up_sees_the_registration_emission() {
    // The source emits immediately upon registration; an emitter hooked
    // up atomically must not miss that first value.
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = log.clone();
    queue::install_and_flush(|| {
        let _ = Task::new(async move {
            let mut emitter = hook_up(|collector: weft::Collector<u32>| {
                // Registration side fires straight away.
                let _awaiters = collector.send(7);
            });
            let first = emitter.listen().await.unwrap();
            l.lock().unwrap().push(first);
        })
        .detach();
    });
    assert_eq!(*log.lock().unwrap(), vec![7]);
}

#[test]
fn collector_keeps_channel_alive_without_signal_handle() {
    let signal = Signal::new();
    let collector = signal.collector();
    let emitter = signal.emitter();
    drop(signal);
    let listener = Task::new(async move { emitter.listen().await.unwrap() }).start();
    assert!(listener.is_pending());
    let _ = collector.send(5u8);
    assert_eq!(*listener.wait().unwrap(), 5);
}
