//! Lock-free awaiter chain.
//!
//! An intrusive LIFO stack of suspended consumers hanging off a single
//! atomic head pointer. Subscribers CAS-push nodes (release, so the
//! publisher sees the node's fields); the publisher swaps the head out in
//! one shot (acquire) and walks the detached list, converting each node's
//! registered action into either a handle carried by the returned suspend
//! point or an immediate wake.
//!
//! Two sentinel head values never point at nodes: `UNINIT` marks a chain
//! that has not been armed yet, `READY` marks a resolved chain on which
//! further subscription attempts must fail.
//!
//! Nodes are reference-counted rather than borrowed from the waiter's
//! frame: a consumer dropped mid-wait marks its node abandoned and the
//! publisher skips it, which keeps cancellation safe without unlinking.

use std::ptr;
use std::sync::Arc;
use std::task::Waker;

use crate::suspend::SuspendPoint;
use crate::sync::{AtomicPtr, AtomicU8, Ordering};
use crate::task::TaskHandle;

const UNINIT: *mut Node = 1 as *mut Node;
const READY: *mut Node = 2 as *mut Node;

const WAITING: u8 = 0;
const FIRED: u8 = 1;
const ABANDONED: u8 = 2;

/// What to do with a consumer when the chain publishes.
pub(crate) enum Action {
    /// A cooperative task: claimed and carried in the suspend point.
    Task(TaskHandle),
    /// A foreign waker (outside executor or a blocking gate): woken at
    /// publish time.
    Waker(Waker),
}

pub(crate) struct Node {
    next: AtomicPtr<Node>,
    state: AtomicU8,
    action: std::cell::UnsafeCell<Option<Action>>,
}

unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    fn new(action: Action) -> Arc<Self> {
        Arc::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU8::new(WAITING),
            action: std::cell::UnsafeCell::new(Some(action)),
        })
    }
}

/// Subscription receipt. Dropping it without the chain having fired
/// leaves the node in place but marked abandoned.
pub(crate) struct Subscription {
    node: Arc<Node>,
}

impl Subscription {
    pub(crate) fn is_fired(&self) -> bool {
        self.node.state.load(Ordering::Acquire) == FIRED
    }

    pub(crate) fn abandon(&self) {
        let _ = self.node.state.compare_exchange(
            WAITING,
            ABANDONED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

pub(crate) struct Chain {
    head: AtomicPtr<Node>,
}

impl Chain {
    /// A chain that must be armed before use (future semantics).
    pub(crate) fn new_uninit() -> Self {
        Self {
            head: AtomicPtr::new(UNINIT),
        }
    }

    /// A chain that accepts subscribers immediately and is never marked
    /// ready (signal semantics: it publishes repeatedly).
    pub(crate) fn new_pending() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn is_uninit(&self) -> bool {
        self.head.load(Ordering::Relaxed) == UNINIT
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.head.load(Ordering::Acquire) == READY
    }

    /// UNINIT -> empty pending. False when the chain was already armed.
    pub(crate) fn arm(&self) -> bool {
        self.head
            .compare_exchange(
                UNINIT,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Pushes a subscriber unless the chain is already resolved (or was
    /// never armed), in which case the action is handed back.
    pub(crate) fn subscribe(&self, action: Action) -> Result<Subscription, Action> {
        let node = Node::new(action);
        let raw = Arc::into_raw(node.clone()) as *mut Node;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            if head == READY || head == UNINIT {
                // Reclaim the reference that was meant for the chain and
                // give the action back to the caller.
                unsafe { drop(Arc::from_raw(raw)) };
                // Pair with the publisher's release so the caller sees
                // the resolved state it is about to read.
                self.head.load(Ordering::Acquire);
                let action = unsafe { (*node.action.get()).take() };
                return Err(action.expect("unpublished node lost its action"));
            }
            node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, raw, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return Ok(Subscription { node }),
                Err(actual) => head = actual,
            }
        }
    }

    /// Swaps the whole chain out and converts it into a suspend point.
    /// With `mark_ready` the head is left at the READY sentinel so later
    /// subscriptions fail; otherwise the chain empties and stays usable.
    pub(crate) fn publish(&self, mark_ready: bool) -> SuspendPoint {
        let target = if mark_ready { READY } else { ptr::null_mut() };
        let mut cur = self.head.swap(target, Ordering::AcqRel);
        let mut sp = SuspendPoint::new();
        while !cur.is_null() && cur != UNINIT && cur != READY {
            let node = unsafe { Arc::from_raw(cur as *const Node) };
            cur = node.next.load(Ordering::Relaxed);
            let fired = node
                .state
                .compare_exchange(WAITING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if fired {
                match unsafe { (*node.action.get()).take() } {
                    Some(Action::Task(handle)) => {
                        if handle.claim() {
                            sp.push(handle);
                        }
                    }
                    Some(Action::Waker(waker)) => waker.wake(),
                    None => {}
                }
            }
        }
        sp
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        // Release any nodes still linked (e.g. abandoned subscribers).
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_null() && cur != UNINIT && cur != READY {
            let node = unsafe { Arc::from_raw(cur as *const Node) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};

    fn count_waker(counter: &Arc<AtomicUsize>) -> Waker {
        struct W(Arc<AtomicUsize>);
        impl std::task::Wake for W {
            fn wake(self: Arc<Self>) {
                self.0.fetch_add(1, StdOrdering::SeqCst);
            }
        }
        Waker::from(Arc::new(W(counter.clone())))
    }

    #[test]
    fn publish_fires_each_subscriber_once() {
        let chain = Chain::new_pending();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            chain
                .subscribe(Action::Waker(count_waker(&hits)))
                .ok()
                .unwrap();
        }
        let sp = chain.publish(false);
        assert!(sp.is_empty());
        assert_eq!(hits.load(StdOrdering::SeqCst), 3);
        // The chain emptied; nothing more fires.
        let _ = chain.publish(false);
        assert_eq!(hits.load(StdOrdering::SeqCst), 3);
    }

    #[test]
    fn ready_chain_refuses_subscription() {
        let chain = Chain::new_pending();
        let _ = chain.publish(true);
        let hits = Arc::new(AtomicUsize::new(0));
        assert!(chain.subscribe(Action::Waker(count_waker(&hits))).is_err());
        assert_eq!(hits.load(StdOrdering::SeqCst), 0);
    }

    #[test]
    fn abandoned_subscriber_is_skipped() {
        let chain = Chain::new_pending();
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = chain
            .subscribe(Action::Waker(count_waker(&hits)))
            .ok()
            .unwrap();
        sub.abandon();
        let _ = chain.publish(false);
        assert_eq!(hits.load(StdOrdering::SeqCst), 0);
    }

    #[test]
    fn unarmed_chain_rejects_then_accepts_after_arm() {
        let chain = Chain::new_uninit();
        let hits = Arc::new(AtomicUsize::new(0));
        assert!(chain.subscribe(Action::Waker(count_waker(&hits))).is_err());
        assert!(chain.arm());
        assert!(!chain.arm());
        assert!(chain.subscribe(Action::Waker(count_waker(&hits))).is_ok());
        let _ = chain.publish(true);
        assert_eq!(hits.load(StdOrdering::SeqCst), 1);
    }
}
