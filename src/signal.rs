//! Weak broadcast value channel.
//!
//! One [`Collector`] fans a value out to any number of awaiting
//! [`Emitter`]s. Emitters hold the shared state weakly: the channel lives
//! exactly as long as a collector (or the [`Signal`] itself) does, and
//! when the last strong holder drops, every parked emitter resolves with
//! [`AwaitError::Canceled`].
//!
//! Subscription happens at await time, so an emitter that is not
//! currently awaiting misses emissions. When registration with an
//! external source has to be atomic with the first await, use
//! [`hook_up`].

use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use crate::chain::{Action, Chain, Subscription};
use crate::error::AwaitError;
use crate::suspend::SuspendPoint;
use crate::task::{self, Task};

struct SignalState<T> {
    chain: Chain,
    value: Mutex<Option<T>>,
}

impl<T> Drop for SignalState<T> {
    fn drop(&mut self) {
        // Wake everyone; their weak upgrade now fails.
        let _awaiters = self.chain.publish(false);
    }
}

/// Shared broadcast channel; holds the state strongly.
pub struct Signal<T> {
    state: Arc<SignalState<T>>,
}

impl<T: Clone> Signal<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState {
                chain: Chain::new_pending(),
                value: Mutex::new(None),
            }),
        }
    }

    /// The sending side. Holds the state strongly.
    pub fn collector(&self) -> Collector<T> {
        Collector {
            state: self.state.clone(),
        }
    }

    /// An awaitable receiver. Holds the state weakly.
    pub fn emitter(&self) -> Emitter<T> {
        Emitter {
            state: Arc::downgrade(&self.state),
        }
    }
}

impl<T: Clone + Send + 'static> Signal<T> {
    /// Registers a callback receiving every emission; it keeps receiving
    /// while it returns true. Implemented as a detached listener task.
    pub fn connect(&self, mut f: impl FnMut(&T) -> bool + Send + 'static) {
        let emitter = self.emitter();
        let _ = Task::new(async move {
            while let Ok(value) = emitter.listen().await {
                if !f(&value) {
                    break;
                }
            }
        })
        .detach();
    }
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").finish_non_exhaustive()
    }
}

/// The sending half; invoke [`send`](Collector::send) to broadcast.
pub struct Collector<T> {
    state: Arc<SignalState<T>>,
}

impl<T: Clone> Collector<T> {
    /// Stores the value and wakes every parked emitter. The returned
    /// suspend point carries the awaiting tasks; await it to transfer
    /// execution to them, or drop it to queue them.
    pub fn send(&self, value: T) -> SuspendPoint {
        *self.state.value.lock().unwrap() = Some(value);
        self.state.chain.publish(false)
    }

    /// A strong handle back to the signal.
    pub fn signal(&self) -> Signal<T> {
        Signal {
            state: self.state.clone(),
        }
    }
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Collector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector").finish_non_exhaustive()
    }
}

/// The receiving half; await [`listen`](Emitter::listen) for the next
/// emission.
pub struct Emitter<T> {
    state: Weak<SignalState<T>>,
}

impl<T: Clone> Emitter<T> {
    pub fn listen(&self) -> Listen<'_, T> {
        Listen {
            state: &self.state,
            wait: ListenWait::new(),
        }
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").finish_non_exhaustive()
    }
}

/// Per-await subscription state shared by [`Listen`] and the hooked
/// variant.
struct ListenWait {
    sub: Option<Subscription>,
    waker: Option<Waker>,
}

impl ListenWait {
    fn new() -> Self {
        Self {
            sub: None,
            waker: None,
        }
    }

    fn poll_value<T: Clone>(
        &mut self,
        state: &Weak<SignalState<T>>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<T, AwaitError>> {
        let Some(state) = state.upgrade() else {
            self.sub = None;
            return Poll::Ready(Err(AwaitError::Canceled));
        };
        loop {
            let mut fired = false;
            if let Some(sub) = &self.sub {
                if sub.is_fired() {
                    fired = true;
                } else {
                    let keep = self
                        .waker
                        .as_ref()
                        .map_or(true, |w| w.will_wake(cx.waker()));
                    if keep {
                        return Poll::Pending;
                    }
                    sub.abandon();
                }
            }
            if fired {
                self.sub = None;
                let value = state.value.lock().unwrap().clone();
                return match value {
                    Some(v) => Poll::Ready(Ok(v)),
                    None => Poll::Ready(Err(AwaitError::Canceled)),
                };
            }
            if self.sub.is_some() {
                // The driving waker changed; re-register below.
                self.sub = None;
                self.waker = None;
            }
            let action = match task::current() {
                Some(handle) => {
                    self.waker = None;
                    Action::Task(handle)
                }
                None => {
                    let w = cx.waker().clone();
                    self.waker = Some(w.clone());
                    Action::Waker(w)
                }
            };
            match state.chain.subscribe(action) {
                Ok(sub) => {
                    self.sub = Some(sub);
                    return Poll::Pending;
                }
                Err(_) => {
                    // The chain resolved under us; the state is going away.
                    return Poll::Ready(Err(AwaitError::Canceled));
                }
            }
        }
    }
}

impl Drop for ListenWait {
    fn drop(&mut self) {
        if let Some(sub) = &self.sub {
            sub.abandon();
        }
    }
}

/// Future returned by [`Emitter::listen`]; resolves with the emitted
/// value, or [`AwaitError::Canceled`] once the channel is gone.
#[must_use]
pub struct Listen<'a, T> {
    state: &'a Weak<SignalState<T>>,
    wait: ListenWait,
}

impl<T: Clone> StdFuture for Listen<'_, T> {
    type Output = Result<T, AwaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = unsafe { self.get_unchecked_mut() };
        this.wait.poll_value(this.state, cx)
    }
}

// ===========================================================================
// Atomic subscribe-then-register
// ===========================================================================

/// Builds an emitter whose first await atomically subscribes and then
/// hands a fresh [`Collector`] to `register`, so the very first value
/// emitted after registration is observed.
pub fn hook_up<T: Clone, F: FnOnce(Collector<T>)>(register: F) -> HookedEmitter<T, F> {
    HookedEmitter {
        state: Weak::new(),
        register: Some(register),
    }
}

/// Emitter produced by [`hook_up`]. Reusable after the first await.
pub struct HookedEmitter<T, F> {
    state: Weak<SignalState<T>>,
    register: Option<F>,
}

impl<T: Clone, F: FnOnce(Collector<T>)> HookedEmitter<T, F> {
    pub fn listen(&mut self) -> HookListen<'_, T, F> {
        HookListen {
            owner: self,
            wait: ListenWait::new(),
        }
    }
}

/// Future returned by [`HookedEmitter::listen`].
#[must_use]
pub struct HookListen<'a, T, F> {
    owner: &'a mut HookedEmitter<T, F>,
    wait: ListenWait,
}

impl<T: Clone, F: FnOnce(Collector<T>)> StdFuture for HookListen<'_, T, F> {
    type Output = Result<T, AwaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = unsafe { self.get_unchecked_mut() };
        if let Some(register) = this.owner.register.take() {
            let signal = Signal::new();
            this.owner.state = Arc::downgrade(&signal.state);
            let collector = signal.collector();
            // Park first, then register: the subscription must exist
            // before the source can possibly emit.
            let parked = this.wait.poll_value(&this.owner.state, cx);
            debug_assert!(parked.is_pending());
            drop(parked);
            register(collector);
        }
        this.wait.poll_value(&this.owner.state, cx)
    }
}
