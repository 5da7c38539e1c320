//! Asynchronous FIFO mutex with transferable ownership.
//!
//! The whole lock state is one atomic pointer playing three roles:
//! null = unlocked, a sentinel = locked with no waiters, anything else =
//! locked with a lock-free LIFO stack of waiter nodes. Release reverses
//! the stack into the owner's FIFO queue exactly once per batch, so
//! wakeup order matches arrival order within each release epoch.
//!
//! Releasing does not run the next owner: it hands back a
//! [`SuspendPoint`] carrying the woken waiter, which the caller can
//! await, redirect to a thread pool, or drop to flush. Acquisitions are
//! not cancellable in the sense of losing their place; a waiter whose
//! lock future is dropped is skipped at hand-off time (and if the grant
//! already happened, the drop releases the mutex again).

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::hint;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::ptr;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::suspend::SuspendPoint;
use crate::sync::{AtomicPtr, AtomicU8, Ordering};
use crate::task::{self, TaskHandle};

const LOCKED: *mut Waiter = 1 as *mut Waiter;

const WAITING: u8 = 0;
const GRANTED: u8 = 1;
const ABANDONED: u8 = 2;
const UPDATING: u8 = 3;

enum WaitAction {
    Task(TaskHandle),
    Waker(Waker),
}

struct Waiter {
    next: AtomicPtr<Waiter>,
    state: AtomicU8,
    action: UnsafeCell<Option<WaitAction>>,
}

unsafe impl Send for Waiter {}
unsafe impl Sync for Waiter {}

impl Waiter {
    fn new(action: WaitAction) -> Arc<Self> {
        Arc::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU8::new(WAITING),
            action: UnsafeCell::new(Some(action)),
        })
    }

    /// Marks the waiter as the next owner and takes its wake action.
    /// Fails when the waiter abandoned the acquisition.
    fn grant(&self) -> Result<Option<WaitAction>, ()> {
        loop {
            match self.state.compare_exchange(
                WAITING,
                GRANTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(unsafe { (*self.action.get()).take() }),
                Err(UPDATING) => hint::spin_loop(),
                Err(_) => return Err(()),
            }
        }
    }

    fn update_action(&self, action: WaitAction) -> bool {
        if self
            .state
            .compare_exchange(WAITING, UPDATING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        unsafe { *self.action.get() = Some(action) };
        self.state.store(WAITING, Ordering::Release);
        true
    }

    /// Withdraws from the queue. Returns true when the grant already
    /// happened, in which case the caller owns the mutex.
    fn try_abandon(&self) -> bool {
        loop {
            match self.state.compare_exchange(
                WAITING,
                ABANDONED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return false,
                Err(UPDATING) => hint::spin_loop(),
                Err(GRANTED) => return true,
                Err(_) => return false,
            }
        }
    }

    fn is_granted(&self) -> bool {
        self.state.load(Ordering::Acquire) == GRANTED
    }
}

/// Asynchronous mutual exclusion with FIFO hand-off.
pub struct Mutex<T> {
    state: AtomicPtr<Waiter>,
    // FIFO of already-ordered waiters; touched only by the current owner.
    ordered: UnsafeCell<VecDeque<Arc<Waiter>>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: AtomicPtr::new(ptr::null_mut()),
            ordered: UnsafeCell::new(VecDeque::new()),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        // By-value receiver: no lock future can still borrow the mutex,
        // so the waiter stack is necessarily empty.
        let me = mem::ManuallyDrop::new(self);
        unsafe {
            drop(ptr::read(&me.ordered));
            ptr::read(&me.data).into_inner()
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Acquires the lock, suspending until ownership arrives.
    pub fn lock(&self) -> Lock<'_, T> {
        Lock {
            mutex: self,
            node: None,
        }
    }

    /// Acquires the lock only when free right now.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, TryLockError> {
        if self
            .state
            .compare_exchange(
                ptr::null_mut(),
                LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Ok(MutexGuard { mutex: self })
        } else {
            Err(TryLockError(()))
        }
    }

    /// Release protocol. Caller must own the lock.
    fn grant_next(&self) -> SuspendPoint {
        loop {
            let next = unsafe { (*self.ordered.get()).pop_front() };
            if let Some(waiter) = next {
                match waiter.grant() {
                    Ok(action) => {
                        let mut sp = SuspendPoint::new();
                        match action {
                            Some(WaitAction::Task(handle)) => {
                                if handle.claim() {
                                    sp.push(handle);
                                }
                            }
                            Some(WaitAction::Waker(waker)) => waker.wake(),
                            None => {}
                        }
                        return sp;
                    }
                    Err(()) => continue,
                }
            }
            if self
                .state
                .compare_exchange(LOCKED, ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return SuspendPoint::new();
            }
            // New waiters piled up since we last looked; order them.
            let head = self.state.swap(LOCKED, Ordering::Acquire);
            self.enqueue_reversed(head);
        }
    }

    /// Drains a detached LIFO stack into the owner's FIFO queue.
    fn enqueue_reversed(&self, mut head: *mut Waiter) {
        let mut batch = Vec::new();
        while !head.is_null() && head != LOCKED {
            let node = unsafe { Arc::from_raw(head as *const Waiter) };
            head = node.next.load(Ordering::Relaxed);
            batch.push(node);
        }
        let ordered = unsafe { &mut *self.ordered.get() };
        for node in batch.into_iter().rev() {
            ordered.push_back(node);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Future returned by [`Mutex::lock`].
#[must_use]
pub struct Lock<'a, T> {
    mutex: &'a Mutex<T>,
    node: Option<Arc<Waiter>>,
}

impl<'a, T> Future for Lock<'a, T> {
    type Output = MutexGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = unsafe { self.get_unchecked_mut() };
        if let Some(node) = &this.node {
            if node.is_granted() {
                this.node = None;
                return Poll::Ready(MutexGuard { mutex: this.mutex });
            }
            // Keep the registered waker fresh; a task handle is stable.
            if let Some(action) = foreign_action(cx) {
                let _ = node.update_action(action);
                if node.is_granted() {
                    this.node = None;
                    return Poll::Ready(MutexGuard { mutex: this.mutex });
                }
            }
            return Poll::Pending;
        }

        // Fast path.
        if this
            .mutex
            .state
            .compare_exchange(
                ptr::null_mut(),
                LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return Poll::Ready(MutexGuard { mutex: this.mutex });
        }

        // Slow path: push a waiter onto the LIFO.
        let action = match task::current() {
            Some(handle) => WaitAction::Task(handle),
            None => WaitAction::Waker(cx.waker().clone()),
        };
        let node = Waiter::new(action);
        let raw = Arc::into_raw(node.clone()) as *mut Waiter;
        let mut head = this.mutex.state.load(Ordering::Relaxed);
        loop {
            if head.is_null() {
                // Unlocked again; retake the fast path.
                match this.mutex.state.compare_exchange(
                    ptr::null_mut(),
                    LOCKED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { drop(Arc::from_raw(raw)) };
                        return Poll::Ready(MutexGuard { mutex: this.mutex });
                    }
                    Err(actual) => {
                        head = actual;
                        continue;
                    }
                }
            }
            node.next.store(head, Ordering::Relaxed);
            match this
                .mutex
                .state
                .compare_exchange_weak(head, raw, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        this.node = Some(node);
        Poll::Pending
    }
}

fn foreign_action(cx: &mut Context<'_>) -> Option<WaitAction> {
    match task::current() {
        Some(_) => None,
        None => Some(WaitAction::Waker(cx.waker().clone())),
    }
}

impl<T> Drop for Lock<'_, T> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            if node.try_abandon() {
                // The grant raced our drop; we own the lock, release it.
                let _next = self.mutex.grant_next();
            }
        }
    }
}

/// Ownership token; dropping it releases the mutex.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
    /// Releases explicitly, returning the suspend point that carries the
    /// next owner (empty when nobody waited). Await it to yield directly
    /// to the next acquirer, or hand it to a thread pool.
    pub fn release(self) -> SuspendPoint {
        let mutex = self.mutex;
        mem::forget(self);
        mutex.grant_next()
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let _next = self.mutex.grant_next();
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Error returned by [`Mutex::try_lock`].
#[derive(Debug)]
pub struct TryLockError(());

impl fmt::Display for TryLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock is already held")
    }
}

impl StdError for TryLockError {}

impl<T> Drop for Mutex<T> {
    fn drop(&mut self) {
        // Free any waiter nodes still linked in the stack or the queue.
        let mut cur = self.state.load(Ordering::Relaxed);
        while !cur.is_null() && cur != LOCKED {
            let node = unsafe { Arc::from_raw(cur as *const Waiter) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}
