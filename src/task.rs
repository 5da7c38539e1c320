//! Task cells and the not-yet-started coroutine type.
//!
//! A task is a reference-counted cell owning a boxed future plus an atomic
//! run-state machine. The cell's clone-able [`TaskHandle`] is the unit the
//! suspend points and the per-thread queue carry: "resuming" a handle
//! means polling the future on the current thread.
//!
//! The state machine guarantees a handle is enqueued at most once until it
//! actually runs:
//!
//! ```text
//!   IDLE ──claim──► QUEUED ──run──► RUNNING ──► IDLE / COMPLETE
//!                                     │ wake
//!                                     ▼
//!                                 NOTIFIED ──(after poll)──► QUEUED
//! ```

use std::cell::{RefCell, UnsafeCell};
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Wake, Waker};

use crate::future::{Future, Promise};
use crate::queue;
use crate::suspend::SuspendPoint;
use crate::sync::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const QUEUED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 3;
const COMPLETE: u8 = 4;

type BoxFuture = Pin<Box<dyn StdFuture<Output = ()> + Send + 'static>>;

pub(crate) struct TaskCore {
    state: AtomicU8,
    // Touched only by the thread that won the QUEUED -> RUNNING transition.
    fut: UnsafeCell<Option<BoxFuture>>,
}

unsafe impl Sync for TaskCore {}

impl Wake for TaskCore {
    fn wake(self: Arc<Self>) {
        let handle = TaskHandle { core: self };
        if handle.claim() {
            queue::resume_ready(handle);
        }
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.clone().wake();
    }
}

/// Handle to a runnable unit of work.
///
/// Cheap to clone. A handle that sits inside a [`SuspendPoint`] has
/// already been claimed for scheduling; flushing the point runs it.
#[derive(Clone)]
pub struct TaskHandle {
    core: Arc<TaskCore>,
}

impl TaskHandle {
    /// Claims the right to enqueue this task. Returns false when the task
    /// is already queued, completed, or currently running (in which case
    /// it will requeue itself after the running poll finishes).
    pub(crate) fn claim(&self) -> bool {
        let mut cur = self.core.state.load(Ordering::Acquire);
        loop {
            let next = match cur {
                IDLE => QUEUED,
                RUNNING => NOTIFIED,
                _ => return false,
            };
            match self.core.state.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next == QUEUED,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Polls the task's future once. Must only be called on a claimed
    /// (QUEUED) handle; anything else is a stale wake and is ignored.
    pub(crate) fn run(&self) {
        if self
            .core
            .state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let waker = Waker::from(self.core.clone());
        let mut cx = Context::from_waker(&waker);
        let done = {
            let _enter = CurrentGuard::enter(self.clone());
            let fut = unsafe { &mut *self.core.fut.get() };
            match fut.as_mut() {
                Some(f) => f.as_mut().poll(&mut cx).is_ready(),
                None => true,
            }
        };
        if done {
            unsafe { *self.core.fut.get() = None };
            self.core.state.store(COMPLETE, Ordering::Release);
            return;
        }
        if self
            .core
            .state
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // A wake arrived while we were polling; go around again, at
            // the back of the queue so siblings keep their turn.
            self.core.state.store(QUEUED, Ordering::Release);
            queue::resume_ready(self.clone());
        }
    }

}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("state", &self.core.state.load(Ordering::Relaxed))
            .finish()
    }
}

/// Builds a claimed handle around a future. The handle is ready to be
/// pushed into a suspend point or a queue; nothing runs until it is.
pub(crate) fn spawn_handle(fut: impl StdFuture<Output = ()> + Send + 'static) -> TaskHandle {
    TaskHandle {
        core: Arc::new(TaskCore {
            state: AtomicU8::new(QUEUED),
            fut: UnsafeCell::new(Some(Box::pin(fut))),
        }),
    }
}

// ===========================================================================
// Current-task tracking
// ===========================================================================

thread_local! {
    static CURRENT: RefCell<Option<TaskHandle>> = const { RefCell::new(None) };
    static PREFER_WAKER: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
}

/// The task whose poll is currently executing on this thread, if any.
/// Awaitables use this to register a transferable handle instead of an
/// opaque waker, so resolvers can carry them in suspend points.
pub(crate) fn current() -> Option<TaskHandle> {
    if PREFER_WAKER.with(|p| p.get() > 0) {
        return None;
    }
    CURRENT.with(|c| c.borrow().clone())
}

/// While this guard lives, awaitables on the thread register the poll
/// context's waker instead of the running task's handle. Redirect
/// adapters (e.g. a pool's wrap) rely on this to see the wake.
pub(crate) struct WakerPreference;

pub(crate) fn prefer_waker() -> WakerPreference {
    PREFER_WAKER.with(|p| p.set(p.get() + 1));
    WakerPreference
}

impl Drop for WakerPreference {
    fn drop(&mut self) {
        PREFER_WAKER.with(|p| p.set(p.get() - 1));
    }
}

struct CurrentGuard {
    prev: Option<TaskHandle>,
}

impl CurrentGuard {
    fn enter(handle: TaskHandle) -> Self {
        let prev = CURRENT.with(|c| c.borrow_mut().replace(handle));
        Self { prev }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| *c.borrow_mut() = prev);
    }
}

// ===========================================================================
// Task - a coroutine that has not started yet
// ===========================================================================

/// A coroutine body paired with nothing yet: it never starts on its own.
///
/// The first activation is explicit — [`start`](Task::start) wraps it in a
/// fresh [`Future`], [`start_with`](Task::start_with) resolves a promise
/// you already hold, and [`detach`](Task::detach) runs it for its side
/// effects. Dropping an unstarted task just drops the body.
pub struct Task<T> {
    fut: Pin<Box<dyn StdFuture<Output = T> + Send + 'static>>,
}

impl<T: Send + 'static> Task<T> {
    pub fn new(body: impl StdFuture<Output = T> + Send + 'static) -> Self {
        Self {
            fut: Box::pin(body),
        }
    }

    /// Starts the task bound to a fresh future holding its result.
    pub fn start(self) -> Future<T>
    where
        T: Sync,
    {
        Future::new_with(|promise| {
            let _ = self.start_with(promise);
        })
    }

    /// Starts the task so that it resolves `promise` on completion.
    ///
    /// The returned suspend point carries the task; consuming it (or
    /// letting it drop) performs the first activation. The attached flag
    /// is false when the promise was already spent, in which case the
    /// task is discarded unstarted.
    pub fn start_with(self, promise: Promise<T>) -> SuspendPoint<bool>
    where
        T: Sync,
    {
        if !promise.is_armed() {
            return SuspendPoint::with_value(false);
        }
        let fut = self.fut;
        let handle = spawn_handle(async move {
            let value = fut.await;
            let _ = promise.set(value);
        });
        let mut sp = SuspendPoint::with_value(true);
        sp.push(handle);
        sp
    }

    /// Starts the task with its result discarded.
    pub fn detach(self) -> SuspendPoint {
        let fut = self.fut;
        let handle = spawn_handle(async move {
            let _ = fut.await;
        });
        SuspendPoint::from_handle(handle)
    }
}
