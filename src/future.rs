//! Single-shot future / promise pair.
//!
//! A [`Future`] is a write-once cell: it starts uninitialized, becomes
//! pending when its unique [`Promise`] is taken, and ends in exactly one
//! terminal state — a value, a recorded failure, or "no value" when the
//! promise was dropped unused. Terminal states never change, which is
//! what lets any number of consumers read the cell concurrently once it
//! is ready.
//!
//! Resolution is deliberately two-phase: the setter installs the value,
//! publishes the awaiter chain and gets back a [`SuspendPoint`] carrying
//! every consumer that was waiting. Nothing runs inside the setter; the
//! caller decides where those tasks resume.

use std::cell::UnsafeCell;
use std::future::{Future as StdFuture, IntoFuture};
use std::pin::Pin;
use std::ptr;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::chain::{Action, Chain, Subscription};
use crate::error::{AwaitError, TaskError};
use crate::shared::SharedFuture;
use crate::suspend::SuspendPoint;
use crate::task::Task;
use crate::wait::Gate;
use crate::{queue, task};

enum Slot<T> {
    Empty,
    Value(T),
    Failed(TaskError),
}

pub(crate) struct FutureCell<T> {
    chain: Chain,
    // Written once by the resolver before the chain is marked ready,
    // read only after observing the ready state.
    slot: UnsafeCell<Slot<T>>,
}

unsafe impl<T: Send> Send for FutureCell<T> {}
unsafe impl<T: Send + Sync> Sync for FutureCell<T> {}

impl<T> FutureCell<T> {
    fn new() -> Self {
        Self {
            chain: Chain::new_uninit(),
            slot: UnsafeCell::new(Slot::Empty),
        }
    }

    fn resolved(slot: Slot<T>) -> Self {
        let cell = Self {
            chain: Chain::new_pending(),
            slot: UnsafeCell::new(slot),
        };
        let _ = cell.chain.publish(true);
        cell
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.chain.is_ready()
    }

    pub(crate) fn is_pending(&self) -> bool {
        !self.chain.is_uninit() && !self.chain.is_ready()
    }

    /// Installs a terminal state and hands back everyone who waited.
    fn fill(&self, slot: Slot<T>) -> SuspendPoint {
        debug_assert!(!self.is_ready(), "future resolved twice");
        unsafe { *self.slot.get() = slot };
        self.chain.publish(true)
    }

    pub(crate) fn read(&self) -> Result<&T, AwaitError> {
        if !self.is_ready() {
            return Err(AwaitError::NotReady);
        }
        match unsafe { &*self.slot.get() } {
            Slot::Value(v) => Ok(v),
            Slot::Failed(e) => Err(AwaitError::Failed(e.clone())),
            Slot::Empty => Err(AwaitError::Canceled),
        }
    }

    pub(crate) fn get(&self) -> Get<'_, T> {
        Get {
            cell: self,
            sub: None,
            waker: None,
        }
    }

    pub(crate) fn sync(&self) {
        debug_assert!(
            queue::can_block(),
            "blocking wait inside an active resumption queue"
        );
        if self.is_ready() {
            return;
        }
        let gate = Arc::new(Gate::new());
        let waker = Waker::from(gate.clone());
        match self.chain.subscribe(Action::Waker(waker)) {
            Ok(_sub) => gate.wait(),
            Err(_) => {}
        }
    }
}

/// Single-shot awaitable value cell.
///
/// Obtain the setter with [`get_promise`](Future::get_promise), or use
/// [`new_with`](Future::new_with) to hand the promise straight to an
/// initiator. Await `&future` (or [`get`](Future::get)) for the value;
/// [`wait`](Future::wait) blocks a plain thread instead.
#[must_use]
pub struct Future<T> {
    cell: Arc<FutureCell<T>>,
}

impl<T> Future<T> {
    /// An uninitialized future; arm it with [`get_promise`](Future::get_promise).
    pub fn new() -> Self {
        Self {
            cell: Arc::new(FutureCell::new()),
        }
    }

    /// Arms the future and passes the promise to `init`. This is the
    /// idiomatic way to return a future from a function:
    ///
    /// ```ignore
    /// fn fetch(&self) -> Future<Reply> {
    ///     Future::new_with(|promise| self.begin(promise))
    /// }
    /// ```
    pub fn new_with(init: impl FnOnce(Promise<T>)) -> Self {
        let mut fut = Self::new();
        let promise = fut.get_promise();
        init(promise);
        fut
    }

    /// An already-resolved future.
    pub fn ready(value: T) -> Self {
        Self {
            cell: Arc::new(FutureCell::resolved(Slot::Value(value))),
        }
    }

    /// A future resolved with a recorded failure.
    pub fn failed(error: TaskError) -> Self {
        Self {
            cell: Arc::new(FutureCell::resolved(Slot::Failed(error))),
        }
    }

    /// A future resolved without a value; reads see [`AwaitError::Canceled`].
    pub fn canceled() -> Self {
        Self {
            cell: Arc::new(FutureCell::resolved(Slot::Empty)),
        }
    }

    /// Takes the unique setter. Panics when called twice.
    pub fn get_promise(&mut self) -> Promise<T> {
        assert!(self.cell.chain.arm(), "promise already taken");
        Promise {
            cell: Some(self.cell.clone()),
        }
    }

    /// True once a terminal state is installed.
    pub fn is_ready(&self) -> bool {
        self.cell.is_ready()
    }

    /// True while a promise exists and has not resolved yet.
    pub fn is_pending(&self) -> bool {
        self.cell.is_pending()
    }

    /// Non-blocking read of the terminal state.
    pub fn value(&self) -> Result<&T, AwaitError> {
        self.cell.read()
    }

    /// Moves the value out. Later reads observe cancellation.
    pub fn take(&mut self) -> Result<T, AwaitError> {
        // &mut self: the promise is spent by the time the cell is ready
        // and no awaiter reads the slot, so access is exclusive.
        self.cell.read()?;
        match unsafe { ptr::replace(self.cell.slot.get(), Slot::Empty) } {
            Slot::Value(v) => Ok(v),
            Slot::Failed(e) => Err(AwaitError::Failed(e)),
            Slot::Empty => Err(AwaitError::Canceled),
        }
    }

    /// Awaitable read; resolves to a reference into the cell.
    pub fn get(&self) -> Get<'_, T> {
        self.cell.get()
    }

    /// Awaitable readiness probe: true when the future holds a value or
    /// a failure, false when it resolved empty.
    pub fn has_value(&self) -> HasValue<'_, T> {
        HasValue { inner: self.get() }
    }

    /// Blocks the current thread until resolution, then reads.
    pub fn wait(&self) -> Result<&T, AwaitError> {
        self.cell.sync();
        self.cell.read()
    }

    /// Blocks until resolution without touching the result.
    pub fn sync(&self) {
        self.cell.sync();
    }

    /// Converts into a cloneable [`SharedFuture`], pending or not.
    pub fn into_shared(self) -> SharedFuture<T> {
        SharedFuture::from_cell(self.cell)
    }
}

impl<T: Send + Sync + 'static> Future<T> {
    /// Starts a task and binds this future to its result.
    pub fn from_task(task: Task<T>) -> Self {
        task.start()
    }
}

impl<T: Send + Sync + 'static> From<Task<T>> for Future<T> {
    fn from(task: Task<T>) -> Self {
        task.start()
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.cell.is_ready() {
            "ready"
        } else if self.cell.is_pending() {
            "pending"
        } else {
            "uninit"
        };
        f.debug_struct("Future").field("state", &state).finish()
    }
}

impl<'a, T> IntoFuture for &'a Future<T> {
    type Output = Result<&'a T, AwaitError>;
    type IntoFuture = Get<'a, T>;

    fn into_future(self) -> Get<'a, T> {
        self.get()
    }
}

// ===========================================================================
// Awaitables
// ===========================================================================

/// Future returned by [`Future::get`]; resolves to the stored value.
#[must_use]
pub struct Get<'a, T> {
    cell: &'a FutureCell<T>,
    sub: Option<Subscription>,
    waker: Option<Waker>,
}

impl<'a, T> StdFuture for Get<'a, T> {
    type Output = Result<&'a T, AwaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let cell = this.cell;
        loop {
            if cell.is_ready() {
                this.sub = None;
                return Poll::Ready(cell.read());
            }
            if let Some(sub) = &this.sub {
                if sub.is_fired() {
                    // The publisher marks ready before firing; re-check.
                    continue;
                }
                // A task handle stays valid across polls; a raw waker
                // only as long as the driver keeps the same one.
                let keep = this
                    .waker
                    .as_ref()
                    .map_or(true, |w| w.will_wake(cx.waker()));
                if keep {
                    return Poll::Pending;
                }
                sub.abandon();
            }
            if this.sub.is_some() {
                // The driving waker changed; re-register below.
                this.sub = None;
                this.waker = None;
            }
            let action = match task::current() {
                Some(handle) => {
                    this.waker = None;
                    Action::Task(handle)
                }
                None => {
                    let w = cx.waker().clone();
                    this.waker = Some(w.clone());
                    Action::Waker(w)
                }
            };
            match cell.chain.subscribe(action) {
                Ok(sub) => {
                    this.sub = Some(sub);
                    return Poll::Pending;
                }
                Err(_) => return Poll::Ready(cell.read()),
            }
        }
    }
}

impl<T> Drop for Get<'_, T> {
    fn drop(&mut self) {
        if let Some(sub) = &self.sub {
            sub.abandon();
        }
    }
}

/// Future returned by [`Future::has_value`].
#[must_use]
pub struct HasValue<'a, T> {
    inner: Get<'a, T>,
}

impl<T> StdFuture for HasValue<'_, T> {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(_)) => Poll::Ready(true),
            Poll::Ready(Err(AwaitError::Failed(_))) => Poll::Ready(true),
            Poll::Ready(Err(_)) => Poll::Ready(false),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ===========================================================================
// Promise
// ===========================================================================

/// The unique setter for a [`Future`]. Movable, not copyable; exactly one
/// set succeeds. Dropping an unused promise resolves the future empty,
/// which consumers observe as [`AwaitError::Canceled`].
pub struct Promise<T> {
    cell: Option<Arc<FutureCell<T>>>,
}

impl<T> Promise<T> {
    /// A promise that was never armed; setting through it reports false.
    pub fn spent() -> Self {
        Self { cell: None }
    }

    /// True while this promise still owns its future.
    pub fn is_armed(&self) -> bool {
        self.cell.is_some()
    }

    /// Resolves the future with a value. The returned suspend point
    /// carries every consumer that was waiting, plus a flag telling
    /// whether this promise was still armed.
    pub fn set(mut self, value: T) -> SuspendPoint<bool> {
        match self.cell.take() {
            Some(cell) => SuspendPoint::with_parts(cell.fill(Slot::Value(value)), true),
            None => SuspendPoint::with_value(false),
        }
    }

    /// Resolves the future with a recorded failure.
    pub fn set_error(mut self, error: TaskError) -> SuspendPoint<bool> {
        match self.cell.take() {
            Some(cell) => SuspendPoint::with_parts(cell.fill(Slot::Failed(error)), true),
            None => SuspendPoint::with_value(false),
        }
    }

    /// Resolves the future empty, as dropping would, but returns the
    /// suspend point for explicit placement.
    pub fn cancel(mut self) -> SuspendPoint<bool> {
        match self.cell.take() {
            Some(cell) => SuspendPoint::with_parts(cell.fill(Slot::Empty), true),
            None => SuspendPoint::with_value(false),
        }
    }

    /// Defers resolution: returns a closure that performs the set when
    /// invoked, e.g. from a worker thread.
    pub fn bind(self, value: T) -> impl FnOnce() -> SuspendPoint<bool> {
        move || self.set(value)
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::spent()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            let _unblocked = cell.fill(Slot::Empty);
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("armed", &self.is_armed())
            .finish()
    }
}
