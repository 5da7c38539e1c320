//! Timed delivery of promise resolutions.
//!
//! The scheduler keeps a deadline-ordered heap of `(when, promise, id)`
//! entries under a mutex and resolves each promise at or after its
//! deadline — never inline at schedule time, always from the worker
//! pass. It can run on a dedicated thread, inside a thread pool slot, or
//! be driven manually through [`get_expired`](Scheduler::get_expired).
//!
//! Entries cancel by identifier: the promise is pulled off the heap and
//! resolved right here, either empty (consumers see
//! [`AwaitError::Canceled`](crate::AwaitError::Canceled)) or with a
//! caller-supplied error.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::TaskError;
use crate::future::{Future, Promise};
use crate::generator::{generator, Generator};
use crate::pool::ThreadPool;
use crate::rt_debug;
use crate::stop::{StopSource, StopToken};
use crate::task::Task;

/// Opaque pointer-sized identifier for cancellable entries. Point it at
/// anything with a unique address:
///
/// ```ignore
/// let tag = 0u8;
/// let sleep = sched.sleep_for(dur, Ident::of(&tag));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct Ident(usize);

impl Ident {
    /// Identifier of entries scheduled without one.
    pub const NONE: Ident = Ident(0);

    pub fn of<T>(target: &T) -> Ident {
        Ident(target as *const T as usize)
    }
}

struct Entry {
    at: Instant,
    promise: Promise<()>,
    id: Ident,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap, we want the earliest deadline
    // on top.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.at.cmp(&self.at)
    }
}

/// Result of a manual drive pass.
pub enum Expired {
    /// An entry whose deadline passed; resolve its promise.
    Due(Promise<()>),
    /// Nothing due; the earliest deadline still pending.
    NextAt(Instant),
    /// The heap is empty.
    Empty,
}

struct SchedInner {
    heap: Mutex<BinaryHeap<Entry>>,
    cond: Condvar,
}

impl SchedInner {
    fn schedule(&self, id: Ident, promise: Promise<()>, at: Instant) {
        let mut heap = self.heap.lock().unwrap();
        let is_new_min = heap.peek().map_or(true, |top| top.at > at);
        heap.push(Entry { at, promise, id });
        if is_new_min {
            self.cond.notify_all();
        }
    }

    fn get_expired(&self, now: Instant) -> Expired {
        let mut heap = self.heap.lock().unwrap();
        let next = match heap.peek() {
            None => return Expired::Empty,
            Some(top) => top.at,
        };
        if next <= now {
            Expired::Due(heap.pop().unwrap().promise)
        } else {
            Expired::NextAt(next)
        }
    }

    fn remove(&self, id: Ident) -> Option<Promise<()>> {
        let mut heap = self.heap.lock().unwrap();
        if !heap.iter().any(|e| e.id == id) {
            return None;
        }
        let mut found = None;
        let entries = mem::take(&mut *heap).into_vec();
        for entry in entries {
            if found.is_none() && entry.id == id {
                found = Some(entry.promise);
            } else {
                heap.push(entry);
            }
        }
        found
    }

    fn sleep_until(self: &Arc<Self>, at: Instant, id: Ident) -> Future<()> {
        Future::new_with(|promise| self.schedule(id, promise, at))
    }

    fn clear(&self) {
        let entries = mem::take(&mut *self.heap.lock().unwrap());
        // Dropping the promises resolves every waiter canceled.
        drop(entries);
    }
}

enum WorkerSeat {
    Idle,
    Thread(thread::JoinHandle<()>),
    // Resolved when the pool-hosted worker loop exits.
    Pool(Future<()>),
}

/// Deadline scheduler with cancellation by identifier.
pub struct Scheduler {
    inner: Arc<SchedInner>,
    stop: StopSource,
    seat: Mutex<WorkerSeat>,
    pool: Mutex<Option<crate::pool::PoolRef>>,
}

impl Scheduler {
    /// An inactive scheduler; drive it manually or start a worker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedInner {
                heap: Mutex::new(BinaryHeap::new()),
                cond: Condvar::new(),
            }),
            stop: StopSource::new(),
            seat: Mutex::new(WorkerSeat::Idle),
            pool: Mutex::new(None),
        }
    }

    /// Starts the worker on a dedicated thread.
    pub fn start_thread(&self) {
        let mut seat = self.seat.lock().unwrap();
        assert!(
            matches!(*seat, WorkerSeat::Idle),
            "scheduler already started"
        );
        let inner = self.inner.clone();
        let token = self.stop.token();
        *seat = WorkerSeat::Thread(thread::spawn(move || worker_loop(inner, token, None)));
    }

    /// Starts the worker inside a thread pool slot. Expired promises are
    /// then resolved on pool workers, so resumed tasks run there too.
    pub fn start_in(&self, pool: &ThreadPool) {
        let mut seat = self.seat.lock().unwrap();
        assert!(
            matches!(*seat, WorkerSeat::Idle),
            "scheduler already started"
        );
        let handle = pool.handle();
        *self.pool.lock().unwrap() = Some(handle.clone());
        let inner = self.inner.clone();
        let token = self.stop.token();
        let done = Future::new_with(|promise| {
            let loop_pool = handle.clone();
            handle.submit(Box::new(move || {
                worker_loop(inner, token, Some(loop_pool));
                let _ = promise.set(());
            }));
        });
        *seat = WorkerSeat::Pool(done);
    }

    /// Schedules a promise for resolution at or after `at`.
    pub fn schedule(&self, id: Ident, promise: Promise<()>, at: Instant) {
        self.inner.schedule(id, promise, at);
    }

    /// Manual drive: pops one due entry, or reports the next deadline.
    pub fn get_expired(&self, now: Instant) -> Expired {
        self.inner.get_expired(now)
    }

    /// A future resolving at `at`; cancellation fails it.
    pub fn sleep_until(&self, at: Instant, id: Ident) -> Future<()> {
        self.inner.sleep_until(at, id)
    }

    /// A future resolving after `dur`, measured from now.
    pub fn sleep_for(&self, dur: Duration, id: Ident) -> Future<()> {
        self.inner.sleep_until(Instant::now() + dur, id)
    }

    /// Cancels one entry with the identifier; its future resolves
    /// canceled promptly and never fires at its deadline. False when no
    /// entry matched.
    pub fn cancel(&self, id: Ident) -> bool {
        match self.inner.remove(id) {
            Some(promise) => {
                self.deliver(move || {
                    let _unblocked = promise.cancel();
                });
                true
            }
            None => false,
        }
    }

    /// Like [`cancel`](Scheduler::cancel), but the future fails with the
    /// supplied error instead.
    pub fn cancel_with(&self, id: Ident, error: TaskError) -> bool {
        match self.inner.remove(id) {
            Some(promise) => {
                self.deliver(move || {
                    let _unblocked = promise.set_error(error);
                });
                true
            }
            None => false,
        }
    }

    /// Runs a resolution on the bound pool when there is one, inline
    /// otherwise.
    fn deliver(&self, resolve: impl FnOnce() + Send + 'static) {
        match &*self.pool.lock().unwrap() {
            Some(pool) => pool.submit(Box::new(resolve)),
            None => resolve(),
        }
    }

    /// A generator ticking every `dur`, yielding 0, 1, 2, … until the
    /// token stops it. Deadlines advance from the previous target, not
    /// from wakeup time, so processing delays do not accumulate drift.
    pub fn interval(&self, dur: Duration, token: StopToken) -> Generator<u64> {
        let inner = self.inner.clone();
        generator(move |y| async move {
            let tag = Arc::new(0u8);
            let id = Ident::of(&*tag);
            let _cancel = token.on_stop({
                let inner = inner.clone();
                move || {
                    if let Some(promise) = inner.remove(id) {
                        drop(promise);
                    }
                }
            });
            let mut next = Instant::now() + dur;
            let mut tick: u64 = 0;
            while !token.is_stop_requested() {
                let sleep = inner.sleep_until(next, id);
                if sleep.get().await.is_err() {
                    break;
                }
                next += dur;
                y.emit(tick).await;
                tick += 1;
            }
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop.request_stop();
        self.inner.cond.notify_all();
        let seat = mem::replace(self.seat.get_mut().unwrap(), WorkerSeat::Idle);
        match seat {
            WorkerSeat::Idle => {}
            WorkerSeat::Thread(handle) => {
                let _ = handle.join();
            }
            WorkerSeat::Pool(done) => done.sync(),
        }
        self.inner.clear();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("entries", &self.inner.heap.lock().unwrap().len())
            .finish()
    }
}

fn worker_loop(inner: Arc<SchedInner>, token: StopToken, pool: Option<crate::pool::PoolRef>) {
    let _notify = token.on_stop({
        let inner = inner.clone();
        move || inner.cond.notify_all()
    });
    let mut heap = inner.heap.lock().unwrap();
    while !token.is_stop_requested() {
        let now = Instant::now();
        let next = heap.peek().map(|top| top.at);
        let due = match next {
            Some(at) if at <= now => Some(heap.pop().unwrap().promise),
            Some(at) => {
                let timeout = at.saturating_duration_since(now);
                let (guard, _timed_out) = inner.cond.wait_timeout(heap, timeout).unwrap();
                heap = guard;
                None
            }
            None => {
                heap = inner.cond.wait(heap).unwrap();
                None
            }
        };
        if let Some(promise) = due {
            drop(heap);
            rt_debug!("scheduler delivering");
            match &pool {
                Some(p) => {
                    let deliver = promise.bind(());
                    p.submit(Box::new(move || {
                        let _unblocked = deliver();
                    }));
                }
                None => {
                    // The suspend point drains right here, on the worker.
                    let _ = promise.set(());
                }
            }
            heap = inner.heap.lock().unwrap();
        }
    }
}

/// Runs a task to completion, using this thread as the scheduler worker
/// until the task's future resolves.
///
/// This is the single-threaded mode: no pool, no dedicated thread.
pub fn run_with<T: Send + Sync + 'static>(sched: &Scheduler, task: Task<T>) -> Future<T> {
    let fut = task.start();
    while !fut.is_ready() {
        let now = Instant::now();
        match sched.get_expired(now) {
            Expired::Due(promise) => {
                // The suspend point drains here, advancing the task.
                let _ = promise.set(());
            }
            Expired::NextAt(at) => {
                thread::sleep(at.saturating_duration_since(now));
            }
            Expired::Empty => {
                // The task is parked on something other than a deadline.
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
    fut
}
