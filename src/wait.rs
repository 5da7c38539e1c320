//! Blocking support for synchronous access paths.
//!
//! A [`Gate`] is a condvar-backed flag that doubles as a [`Waker`], so any
//! awaitable in the crate can be waited on from a plain thread. Blocking
//! while a resumption queue is active on the thread is a programming
//! error; debug builds assert, release builds block.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use crate::queue;
use crate::sync::{Condvar, Mutex};

pub(crate) struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn open(&self) {
        let mut open = self.open.lock().unwrap();
        *open = true;
        self.cond.notify_all();
    }

    /// Blocks until the gate opens, then re-arms it.
    pub(crate) fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
        *open = false;
    }
}

impl Wake for Gate {
    fn wake(self: Arc<Self>) {
        self.open();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.open();
    }
}

/// Drives a future to completion on the current thread.
pub(crate) fn block_on<F: Future>(fut: F) -> F::Output {
    debug_assert!(
        queue::can_block(),
        "blocking wait inside an active resumption queue"
    );
    let gate = Arc::new(Gate::new());
    let waker = Waker::from(gate.clone());
    let mut cx = Context::from_waker(&waker);
    let mut fut = pin!(fut);
    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(out) => return out,
            Poll::Pending => gate.wait(),
        }
    }
}
