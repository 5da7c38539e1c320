//! Suspend points: batches of ready tasks handed back to the caller.
//!
//! A function that unblocks consumers must not run them inside itself.
//! Instead it returns a [`SuspendPoint`] carrying the now-runnable
//! handles (and, in the typed form, a result value). The caller picks the
//! moment: await it to let the readied tasks run first, call
//! [`flush`](SuspendPoint::flush) to queue them, or just drop it — the
//! destructor never loses a handle.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use smallvec::SmallVec;

use crate::queue;
use crate::task::TaskHandle;

// Three handles cover the common fan-out without touching the heap.
const INLINE: usize = 3;

/// A movable batch of ready-to-run task handles, optionally carrying a
/// value. Each handle is resumed exactly once.
#[must_use = "dropping a suspend point resumes its tasks immediately"]
pub struct SuspendPoint<V = ()> {
    handles: SmallVec<[TaskHandle; INLINE]>,
    value: Option<V>,
}

impl SuspendPoint<()> {
    /// An empty suspend point.
    pub fn new() -> Self {
        Self {
            handles: SmallVec::new(),
            value: Some(()),
        }
    }

    pub(crate) fn from_handle(handle: TaskHandle) -> Self {
        let mut sp = Self::new();
        sp.push(handle);
        sp
    }
}

impl Default for SuspendPoint<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SuspendPoint<V> {
    pub(crate) fn with_value(value: V) -> Self {
        Self {
            handles: SmallVec::new(),
            value: Some(value),
        }
    }

    pub(crate) fn with_parts(handles: SuspendPoint<()>, value: V) -> Self {
        let mut sp = Self::with_value(value);
        sp.absorb(handles);
        sp
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// The attached result, if the point still carries one.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub(crate) fn take_value(&mut self) -> Option<V> {
        self.value.take()
    }

    pub(crate) fn push(&mut self, handle: TaskHandle) {
        self.handles.push(handle);
    }

    /// Moves every handle of `other` into this point. The absorbed
    /// point's value (if any) is discarded with it.
    pub fn absorb<U>(&mut self, mut other: SuspendPoint<U>) {
        self.handles.extend(other.handles.drain(..));
    }

    /// Removes one handle for direct transfer; `None` when empty.
    pub fn pop(&mut self) -> Option<TaskHandle> {
        self.handles.pop()
    }

    /// Schedules all carried handles. With an active queue they are
    /// enqueued behind existing work; otherwise a queue is installed and
    /// fully drained before this returns.
    pub fn flush(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        let handles = mem::take(&mut self.handles);
        if queue::is_active() {
            for h in handles {
                queue::resume_ready(h);
            }
        } else {
            queue::install_and_flush(|| {
                for h in handles {
                    queue::resume_ready(h);
                }
            });
        }
    }
}

impl<V> Drop for SuspendPoint<V> {
    fn drop(&mut self) {
        self.flush();
    }
}

impl<V> std::fmt::Debug for SuspendPoint<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendPoint")
            .field("handles", &self.handles.len())
            .finish()
    }
}

/// Awaiting a suspend point parks the current task at the back of the
/// queue and lets the carried handles run first; the await resolves to
/// the attached value.
impl<V: Unpin> Future for SuspendPoint<V> {
    type Output = V;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<V> {
        let this = &mut *self;
        if !this.handles.is_empty() {
            if queue::is_active() {
                let handles = mem::take(&mut this.handles);
                for h in handles {
                    queue::resume_ready(h);
                }
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            // Awaited outside the cooperative scope: run them here.
            this.flush();
        }
        Poll::Ready(
            this.value
                .take()
                .expect("suspend point polled after completion"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::spawn_handle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_handle(counter: &Arc<AtomicUsize>) -> TaskHandle {
        let c = counter.clone();
        spawn_handle(async move {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn drop_resumes_each_handle_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        for n in [0usize, 1, 3, 4] {
            counter.store(0, Ordering::SeqCst);
            let mut sp = SuspendPoint::new();
            for _ in 0..n {
                sp.push(counting_handle(&counter));
            }
            drop(sp);
            assert_eq!(counter.load(Ordering::SeqCst), n);
        }
    }

    #[test]
    fn pop_then_drop_runs_everything() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut sp = SuspendPoint::new();
        for _ in 0..4 {
            sp.push(counting_handle(&counter));
        }
        let one = sp.pop().unwrap();
        crate::queue::resume_ready(one);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        drop(sp);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn absorb_merges_and_keeps_value() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut a = SuspendPoint::with_value(7u32);
        a.push(counting_handle(&counter));
        let mut b = SuspendPoint::new();
        b.push(counting_handle(&counter));
        b.push(counting_handle(&counter));
        a.absorb(b);
        assert_eq!(a.len(), 3);
        assert_eq!(a.value(), Some(&7));
        drop(a);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
