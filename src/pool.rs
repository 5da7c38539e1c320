//! Fixed worker pool integrated with the runtime.
//!
//! Jobs travel through a lock-free injection queue; a small mutex and
//! condvar only put idle workers to sleep. Everything promise-shaped
//! cancels cleanly on shutdown: a job dropped unexecuted releases its
//! captured promise, which consumers observe as
//! [`AwaitError::Canceled`](crate::AwaitError::Canceled).

use std::fmt;
use std::future::{Future as StdFuture, IntoFuture};
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;

use crossbeam_queue::SegQueue;
use pin_project_lite::pin_project;

use crate::error::AwaitError;
use crate::future::{Future, Promise};
use crate::queue;
use crate::rt_debug;
use crate::suspend::SuspendPoint;
use crate::sync::{AtomicBool, Ordering};
use crate::task::Task;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    exit: bool,
    workers: Vec<thread::JoinHandle<()>>,
}

pub(crate) struct PoolInner {
    jobs: SegQueue<Job>,
    mx: Mutex<PoolState>,
    cond: Condvar,
}

impl PoolInner {
    fn submit(&self, job: Job) {
        let st = self.mx.lock().unwrap();
        if st.exit {
            // Dropping the job runs its cancellation side effects.
            return;
        }
        self.jobs.push(job);
        self.cond.notify_one();
    }
}

/// Cheap crate-internal handle for collaborators (scheduler, wrappers)
/// that must outlive-or-survive the owning pool gracefully.
pub(crate) struct PoolRef(Arc<PoolInner>);

impl PoolRef {
    pub(crate) fn submit(&self, job: Job) {
        self.0.submit(job);
    }
}

impl Clone for PoolRef {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

thread_local! {
    static CURRENT_POOL: std::cell::RefCell<Option<PoolRef>> =
        const { std::cell::RefCell::new(None) };
}

fn on_pool(inner: &Arc<PoolInner>) -> bool {
    CURRENT_POOL.with(|c| {
        c.borrow()
            .as_ref()
            .map_or(false, |p| Arc::ptr_eq(&p.0, inner))
    })
}

fn worker(inner: Arc<PoolInner>, index: usize) {
    rt_debug!("pool worker {index} up");
    CURRENT_POOL.with(|c| *c.borrow_mut() = Some(PoolRef(inner.clone())));
    let mut st = inner.mx.lock().unwrap();
    loop {
        if st.exit {
            break;
        }
        if let Some(job) = inner.jobs.pop() {
            drop(st);
            // A panicking job cancels its captured promises during the
            // unwind; the worker itself stays up.
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                rt_debug!("pool job panicked");
            }
            st = inner.mx.lock().unwrap();
        } else {
            st = inner.cond.wait(st).unwrap();
        }
    }
    drop(st);
    CURRENT_POOL.with(|c| *c.borrow_mut() = None);
    rt_debug!("pool worker {index} down");
}

/// A fixed set of worker threads sharing one job queue.
///
/// `co_await`-style transfer is [`transfer`](ThreadPool::transfer) (or
/// awaiting `&pool` directly); [`run`](ThreadPool::run) bridges plain
/// closures into futures; [`resume`](ThreadPool::resume) redirects a
/// suspend point's tasks onto workers.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Starts `threads` workers; 0 means one per available core.
    pub fn new(threads: usize) -> Self {
        let threads = if threads == 0 {
            thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            threads
        };
        let inner = Arc::new(PoolInner {
            jobs: SegQueue::new(),
            mx: Mutex::new(PoolState {
                exit: false,
                workers: Vec::new(),
            }),
            cond: Condvar::new(),
        });
        let handles = (0..threads)
            .map(|i| {
                thread::spawn({
                    let inner = inner.clone();
                    move || worker(inner, i)
                })
            })
            .collect();
        inner.mx.lock().unwrap().workers = handles;
        Self { inner }
    }

    pub(crate) fn handle(&self) -> PoolRef {
        PoolRef(self.inner.clone())
    }

    /// Moves the awaiting task onto a pool worker. Resolves with
    /// [`AwaitError::Canceled`] when the pool stops first.
    pub fn transfer(&self) -> Transfer {
        Transfer {
            pool: self.handle(),
            state: Arc::new(TransferState {
                fired: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                inflight: AtomicBool::new(false),
                waker: Mutex::new(None),
            }),
        }
    }

    /// Runs a closure on a worker, delivering its return value through a
    /// future. A closure that panics (or is dropped on shutdown) leaves
    /// the future canceled.
    pub fn run<R: Send + Sync + 'static>(
        &self,
        f: impl FnOnce() -> R + Send + 'static,
    ) -> Future<R> {
        Future::new_with(|promise| {
            self.inner.submit(Box::new(move || {
                let _ = promise.set(f());
            }));
        })
    }

    /// Fire-and-forget enqueue.
    pub fn run_detached(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.submit(Box::new(f));
    }

    /// Starts a task on a worker, delivering its result through a future.
    pub fn run_task<T: Send + Sync + 'static>(&self, task: Task<T>) -> Future<T> {
        Future::new_with(|promise| {
            self.inner.submit(Box::new(move || {
                let _ = task.start_with(promise);
            }));
        })
    }

    /// Starts a task on a worker with its result discarded.
    pub fn run_task_detached<T: Send + 'static>(&self, task: Task<T>) {
        self.inner.submit(Box::new(move || {
            let _started = task.detach();
        }));
    }

    /// Resolves a promise from a worker thread, so consumers resume
    /// there rather than here.
    pub fn resolve<T: Send + Sync + 'static>(&self, promise: Promise<T>, value: T) {
        if promise.is_armed() {
            let deliver = promise.bind(value);
            self.inner.submit(Box::new(move || {
                let _unblocked = deliver();
            }));
        }
    }

    /// Dispatches every task carried by a suspend point onto workers and
    /// returns the attached value.
    pub fn resume<V>(&self, mut point: SuspendPoint<V>) -> V {
        while let Some(handle) = point.pop() {
            self.inner.submit(Box::new(move || {
                queue::resume_ready(handle);
            }));
        }
        point
            .take_value()
            .expect("suspend point consumed before resume")
    }

    /// Wraps an awaitable so that its resumption always lands on a pool
    /// worker rather than on the resolver's thread.
    pub fn wrap<F: StdFuture>(&self, fut: F) -> Wrap<F> {
        Wrap {
            pool: self.handle(),
            inner: fut,
        }
    }

    /// True when the calling thread is one of this pool's workers.
    pub fn on_worker(&self) -> bool {
        on_pool(&self.inner)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.mx.lock().unwrap().exit
    }

    /// Stops all workers. A worker calling this detaches itself so the
    /// stopping caller never joins its own thread.
    pub fn stop(&self) {
        let workers = {
            let mut st = self.inner.mx.lock().unwrap();
            st.exit = true;
            self.inner.cond.notify_all();
            mem::take(&mut st.workers)
        };
        // Cancel whatever never ran.
        while let Some(job) = self.inner.jobs.pop() {
            drop(job);
        }
        let me = thread::current().id();
        for handle in workers {
            if handle.thread().id() == me {
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
        rt_debug!("pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl<'a> IntoFuture for &'a ThreadPool {
    type Output = Result<(), AwaitError>;
    type IntoFuture = Transfer;

    fn into_future(self) -> Transfer {
        self.transfer()
    }
}

// ===========================================================================
// Transfer
// ===========================================================================

struct TransferState {
    fired: AtomicBool,
    canceled: AtomicBool,
    inflight: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl TransferState {
    fn wake(&self) {
        if let Some(w) = self.waker.lock().unwrap().take() {
            w.wake();
        }
    }
}

/// Job-side guard: completing wakes the waiter on the worker; dropping
/// unexecuted cancels the transfer.
struct TransferJob(Arc<TransferState>);

impl TransferJob {
    fn complete(self) {
        self.0.inflight.store(false, Ordering::Release);
        self.0.fired.store(true, Ordering::Release);
        self.0.wake();
        mem::forget(self);
    }
}

impl Drop for TransferJob {
    fn drop(&mut self) {
        self.0.canceled.store(true, Ordering::Release);
        self.0.wake();
    }
}

/// Future returned by [`ThreadPool::transfer`].
#[must_use]
pub struct Transfer {
    pool: PoolRef,
    state: Arc<TransferState>,
}

impl StdFuture for Transfer {
    type Output = Result<(), AwaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.state.canceled.load(Ordering::Acquire) {
            return Poll::Ready(Err(AwaitError::Canceled));
        }
        if this.state.fired.load(Ordering::Acquire) {
            if on_pool(&this.pool.0) {
                return Poll::Ready(Ok(()));
            }
            // The wake raced a poll on the origin thread; hop again.
            this.state.fired.store(false, Ordering::Release);
        }
        *this.state.waker.lock().unwrap() = Some(cx.waker().clone());
        if !this.state.inflight.swap(true, Ordering::AcqRel) {
            let job = TransferJob(this.state.clone());
            this.pool.submit(Box::new(move || job.complete()));
        }
        Poll::Pending
    }
}

// ===========================================================================
// Wrap
// ===========================================================================

pin_project! {
    /// Awaitable adapter produced by [`ThreadPool::wrap`]; wakes of the
    /// inner future are re-dispatched through the pool so the awaiting
    /// task resumes on a worker.
    #[must_use]
    pub struct Wrap<F> {
        pool: PoolRef,
        #[pin]
        inner: F,
    }
}

struct Redirect {
    pool: PoolRef,
    waker: Waker,
}

impl Wake for Redirect {
    fn wake(self: Arc<Self>) {
        let waker = self.waker.clone();
        let relay = WakeJob(Some(waker));
        self.pool.submit(Box::new(move || relay.fire()));
    }
}

/// Wakes on a worker when run, or inline as a last resort when the pool
/// dropped the job.
struct WakeJob(Option<Waker>);

impl WakeJob {
    fn fire(mut self) {
        if let Some(w) = self.0.take() {
            w.wake();
        }
    }
}

impl Drop for WakeJob {
    fn drop(&mut self) {
        if let Some(w) = self.0.take() {
            w.wake();
        }
    }
}

impl<F: StdFuture> StdFuture for Wrap<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.project();
        let redirect = Arc::new(Redirect {
            pool: this.pool.clone(),
            waker: cx.waker().clone(),
        });
        let waker = Waker::from(redirect);
        let mut rcx = Context::from_waker(&waker);
        // Awaitables under this poll must register the redirect waker,
        // not the running task's handle.
        let _pref = crate::task::prefer_waker();
        this.inner.poll(&mut rcx)
    }
}
