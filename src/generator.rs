//! Pull generators with optional per-step input.
//!
//! A generator couples a coroutine body with a one-slot exchange: the
//! body emits values through its [`Yielder`], the consumer pulls them
//! with [`send`](Generator::send) / [`next`](Generator::next). Each
//! advance optionally carries an argument which the body receives as the
//! result of its emit — two-way communication over a single channel.
//!
//! The body starts fully suspended; the first advance activates it. At
//! most one advance may be outstanding at a time.

use std::future::Future as StdFuture;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use futures_core::Stream;

use crate::error::{NoMoreValues, TaskError};
use crate::future::Future;
use crate::queue;
use crate::task::{spawn_handle, Task, TaskHandle};
use crate::wait;

struct GenState<T, A> {
    value: Option<T>,
    arg: Option<A>,
    // Advance epoch; an emit only completes once a newer advance arrived.
    round: u64,
    busy: bool,
    done: bool,
    handle: Option<TaskHandle>,
    consumer: Option<Waker>,
    producer: Option<Waker>,
}

struct GenCore<T, A> {
    st: Mutex<GenState<T, A>>,
}

impl<T, A> GenCore<T, A> {
    fn new() -> Self {
        Self {
            st: Mutex::new(GenState {
                value: None,
                arg: None,
                round: 0,
                busy: false,
                done: false,
                handle: None,
                consumer: None,
                producer: None,
            }),
        }
    }
}

/// Builds a generator from a body that receives the [`Yielder`].
///
/// ```ignore
/// let mut fib = generator(|y| async move {
///     let (mut a, mut b) = (1u64, 1u64);
///     loop {
///         y.emit(b).await;
///         (a, b) = (b, a + b);
///     }
/// });
/// ```
pub fn generator<T, A, F, Fut>(body: F) -> Generator<T, A>
where
    T: Send + 'static,
    A: Send + 'static,
    F: FnOnce(Yielder<T, A>) -> Fut,
    Fut: StdFuture<Output = ()> + Send + 'static,
{
    let core = Arc::new(GenCore::new());
    let fut = body(Yielder { core: core.clone() });
    let finisher = core.clone();
    let handle = spawn_handle(async move {
        fut.await;
        let waker = {
            let mut st = finisher.st.lock().unwrap();
            st.done = true;
            st.busy = false;
            st.consumer.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
    });
    core.st.lock().unwrap().handle = Some(handle);
    Generator { core }
}

/// The producer half handed to a generator body.
pub struct Yielder<T, A = ()> {
    core: Arc<GenCore<T, A>>,
}

impl<T, A> Yielder<T, A> {
    /// Emits a value and suspends until the next advance; resolves to
    /// that advance's argument.
    pub fn emit(&self, value: T) -> Emit<'_, T, A> {
        Emit {
            yielder: self,
            value: Some(value),
            round: None,
        }
    }

    /// Takes the pending advance's argument without emitting. Call it
    /// before the first emit of a step to look at the current input.
    pub fn take_arg(&self) -> Option<A> {
        self.core.st.lock().unwrap().arg.take()
    }
}

/// Future returned by [`Yielder::emit`].
#[must_use]
pub struct Emit<'a, T, A> {
    yielder: &'a Yielder<T, A>,
    value: Option<T>,
    round: Option<u64>,
}

impl<T, A> StdFuture for Emit<'_, T, A> {
    type Output = A;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<A> {
        // No field is ever pinned; only the slot options move.
        let this = unsafe { self.get_unchecked_mut() };
        let mut st = this.yielder.core.st.lock().unwrap();
        match this.round {
            None => {
                this.round = Some(st.round);
                st.value = Some(this.value.take().expect("emit value"));
                st.producer = Some(cx.waker().clone());
                let consumer = st.consumer.take();
                drop(st);
                if let Some(w) = consumer {
                    w.wake();
                }
                Poll::Pending
            }
            Some(round) if st.round > round => {
                let arg = st.arg.take().expect("advance argument already taken");
                Poll::Ready(arg)
            }
            Some(_) => {
                st.producer = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

// ===========================================================================
// Advancing
// ===========================================================================

struct AdvanceInner<T, A> {
    core: Arc<GenCore<T, A>>,
    arg: Option<A>,
    fired: bool,
}

impl<T, A> AdvanceInner<T, A> {
    fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let mut wake: Option<Waker> = None;
        let mut start: Option<TaskHandle> = None;
        {
            let mut st = self.core.st.lock().unwrap();
            if !self.fired {
                if st.done {
                    return Poll::Ready(None);
                }
                assert!(!st.busy, "generator advanced while an advance is pending");
                st.busy = true;
                st.round = st.round.wrapping_add(1);
                st.arg = Some(self.arg.take().expect("advance argument"));
                self.fired = true;
                wake = st.producer.take();
                start = st.handle.take();
            }
        }
        if let Some(w) = wake {
            w.wake();
        } else if let Some(h) = start {
            queue::resume_ready(h);
        }
        let mut st = self.core.st.lock().unwrap();
        if let Some(v) = st.value.take() {
            st.busy = false;
            return Poll::Ready(Some(v));
        }
        if st.done {
            st.busy = false;
            return Poll::Ready(None);
        }
        st.consumer = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Future returned by [`Generator::send`] / [`Generator::next`].
/// Resolves to the next value, or `None` on exhaustion.
#[must_use]
pub struct Advance<'a, T, A> {
    inner: AdvanceInner<T, A>,
    _gen: PhantomData<&'a mut Generator<T, A>>,
}

impl<T, A> StdFuture for Advance<'_, T, A> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = unsafe { self.get_unchecked_mut() };
        this.inner.poll_step(cx)
    }
}

/// A lazy sequence produced by a coroutine body.
pub struct Generator<T, A = ()> {
    core: Arc<GenCore<T, A>>,
}

impl<T, A> Generator<T, A> {
    /// Advances the generator, passing `arg` as the pending input.
    pub fn send(&mut self, arg: A) -> Advance<'_, T, A> {
        Advance {
            inner: AdvanceInner {
                core: self.core.clone(),
                arg: Some(arg),
                fired: false,
            },
            _gen: PhantomData,
        }
    }

    /// Blocking form of [`send`](Generator::send).
    pub fn send_blocking(&mut self, arg: A) -> Option<T> {
        wait::block_on(self.send(arg))
    }

    /// True once the body returned; detectable without advancing.
    pub fn done(&self) -> bool {
        self.core.st.lock().unwrap().done
    }
}

impl<T> Generator<T, ()> {
    /// Advances an argument-less generator.
    pub fn next(&mut self) -> Advance<'_, T, ()> {
        self.send(())
    }

    /// Blocking form of [`next`](Generator::next).
    pub fn next_blocking(&mut self) -> Option<T> {
        wait::block_on(self.next())
    }

    /// Synchronous iteration; each step blocks until the body yields.
    pub fn iter(&mut self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.next_blocking())
    }
}

impl<T, A> Generator<T, A>
where
    T: Send + Sync + 'static,
    A: Send + 'static,
{
    /// Callable form: one advance per call, delivered through a future.
    /// An exhausted generator yields a future failed with [`NoMoreValues`].
    pub fn call_with(&mut self, arg: A) -> Future<T> {
        if self.done() {
            return Future::failed(TaskError::new(NoMoreValues));
        }
        let core = self.core.clone();
        Future::new_with(|promise| {
            let _ = Task::new(async move {
                let step = AdvanceInner {
                    core,
                    arg: Some(arg),
                    fired: false,
                };
                match AdvanceFuture(step).await {
                    Some(v) => {
                        let _ = promise.set(v);
                    }
                    None => {
                        let _ = promise.set_error(TaskError::new(NoMoreValues));
                    }
                }
            })
            .detach();
        })
    }
}

impl<T: Send + Sync + 'static> Generator<T, ()> {
    /// Callable form of [`next`](Generator::next).
    pub fn call(&mut self) -> Future<T> {
        self.call_with(())
    }
}

struct AdvanceFuture<T, A>(AdvanceInner<T, A>);

impl<T, A> StdFuture for AdvanceFuture<T, A> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = unsafe { self.get_unchecked_mut() };
        this.0.poll_step(cx)
    }
}

impl<T, A> Drop for Generator<T, A> {
    fn drop(&mut self) {
        // Break the body <-> state reference cycle so an unfinished
        // coroutine frame is destroyed with its generator.
        let mut st = self.core.st.lock().unwrap();
        st.handle = None;
        st.producer = None;
        st.consumer = None;
        st.value = None;
    }
}

impl<T: Send + 'static> Stream for Generator<T, ()> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let (wake, start) = {
            let mut st = this.core.st.lock().unwrap();
            if let Some(v) = st.value.take() {
                st.busy = false;
                return Poll::Ready(Some(v));
            }
            if st.done {
                return Poll::Ready(None);
            }
            if st.busy {
                st.consumer = Some(cx.waker().clone());
                return Poll::Pending;
            }
            st.busy = true;
            st.round = st.round.wrapping_add(1);
            st.arg = Some(());
            st.consumer = Some(cx.waker().clone());
            (st.producer.take(), st.handle.take())
        };
        if let Some(w) = wake {
            w.wake();
        } else if let Some(h) = start {
            queue::resume_ready(h);
        }
        let mut st = this.core.st.lock().unwrap();
        if let Some(v) = st.value.take() {
            st.busy = false;
            return Poll::Ready(Some(v));
        }
        if st.done {
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

impl<T, A> std::fmt::Debug for Generator<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("done", &self.done())
            .finish()
    }
}
