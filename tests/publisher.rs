//! Publisher / subscriber: ordered delivery, lag policies, close.

use std::thread;
use std::time::Duration;

use weft::{Publisher, ReadMode, RecvError, Task};

#[test]
fn every_subscriber_observes_every_value() {
    let publisher = Publisher::new(8);
    let mut a = publisher.subscribe(ReadMode::FailOnLag);
    let mut b = publisher.subscribe(ReadMode::FailOnLag);
    for v in 0..5 {
        publisher.publish(v);
    }
    let seen_a: Vec<i32> = (0..5).map(|_| a.recv_blocking().unwrap()).collect();
    let seen_b: Vec<i32> = (0..5).map(|_| b.recv_blocking().unwrap()).collect();
    assert_eq!(seen_a, vec![0, 1, 2, 3, 4]);
    assert_eq!(seen_b, seen_a);
}

#[test]
fn subscriber_registered_late_misses_history_it_predates() {
    let publisher = Publisher::new(8);
    publisher.publish("early");
    let mut sub = publisher.subscribe(ReadMode::FailOnLag);
    publisher.publish("late");
    assert_eq!(sub.recv_blocking().unwrap(), "late");
}

#[test]
fn lagged_subscriber_fails_then_recovers() {
    let publisher = Publisher::new(2);
    let mut sub = publisher.subscribe(ReadMode::FailOnLag);
    for v in 0..5 {
        publisher.publish(v);
    }
    // Ring holds [3, 4]; values 0..=2 are gone.
    assert_eq!(sub.recv_blocking(), Err(RecvError::Lagged(3)));
    assert_eq!(sub.recv_blocking(), Ok(3));
    assert_eq!(sub.recv_blocking(), Ok(4));
}

#[test]
fn skip_mode_jumps_to_oldest_retained() {
    let publisher = Publisher::new(2);
    let mut sub = publisher.subscribe(ReadMode::SkipToLatest);
    for v in 0..5 {
        publisher.publish(v);
    }
    assert_eq!(sub.recv_blocking(), Ok(3));
    assert_eq!(sub.recv_blocking(), Ok(4));
}

#[test]
fn close_wakes_and_exhausts() {
    let publisher = Publisher::new(4);
    let mut sub = publisher.subscribe(ReadMode::FailOnLag);
    let reader = Task::new(async move {
        let first = sub.recv().await;
        let second = sub.recv().await;
        (first, second)
    })
    .start();
    assert!(reader.is_pending());
    publisher.publish(1u8);
    publisher.close();
    assert_eq!(
        *reader.wait().unwrap(),
        (Ok(1), Err(RecvError::Closed))
    );
}

#[test]
fn blocking_iteration_ends_at_close() {
    let publisher = Publisher::new(16);
    let mut sub = publisher.subscribe(ReadMode::SkipToLatest);
    let feeder = thread::spawn(move || {
        for v in 0..10 {
            publisher.publish(v);
            thread::sleep(Duration::from_millis(1));
        }
        publisher.close();
    });
    let seen: Vec<i32> = sub.iter().collect();
    feeder.join().unwrap();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
}

#[test]
fn cloned_subscriber_keeps_its_own_cursor() {
    let publisher = Publisher::new(8);
    let mut sub = publisher.subscribe(ReadMode::FailOnLag);
    publisher.publish(10);
    assert_eq!(sub.recv_blocking(), Ok(10));
    let mut fork = sub.clone();
    publisher.publish(20);
    assert_eq!(sub.recv_blocking(), Ok(20));
    assert_eq!(fork.recv_blocking(), Ok(20));
}
