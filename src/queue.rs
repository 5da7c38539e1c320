//! Per-thread resumption queue.
//!
//! Every thread owns a stack of FIFO queues of ready task handles. While
//! an activation is installed, resuming a task only enqueues it; the
//! activation drains the queue when it unwinds. This is what lets a
//! promise setter unblock N tasks and still return to its caller before
//! any of them executes.
//!
//! Activations nest: a recursive install pushes a fresh queue which fully
//! drains before the nested scope returns, while items already sitting in
//! the outer queue stay put until the outer drain resumes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::task::TaskHandle;

thread_local! {
    static STACK: RefCell<Vec<VecDeque<TaskHandle>>> = const { RefCell::new(Vec::new()) };
}

/// True while a resumption queue is installed on this thread.
pub fn is_active() -> bool {
    STACK.with(|s| !s.borrow().is_empty())
}

/// True when blocking the thread cannot starve queued work: either no
/// queue is installed, or the active queue is empty.
pub fn can_block() -> bool {
    STACK.with(|s| s.borrow().last().map_or(true, |q| q.is_empty()))
}

/// Schedules a claimed handle. With an active queue this only enqueues;
/// otherwise a queue is installed, the handle runs, and everything it
/// transitively readies drains before the call returns.
pub(crate) fn resume_ready(handle: TaskHandle) {
    let handle = match try_push(handle) {
        None => return,
        Some(h) => h,
    };
    install_and_flush(move || {
        let again = try_push(handle);
        debug_assert!(again.is_none());
    });
}

fn try_push(handle: TaskHandle) -> Option<TaskHandle> {
    STACK.with(|s| {
        let mut stack = s.borrow_mut();
        match stack.last_mut() {
            Some(q) => {
                q.push_back(handle);
                None
            }
            None => Some(handle),
        }
    })
}

/// Pops the next ready handle off the active queue.
pub(crate) fn next_ready() -> Option<TaskHandle> {
    STACK.with(|s| s.borrow_mut().last_mut().and_then(|q| q.pop_front()))
}

/// Installs a fresh queue, runs `f`, then drains the queue on every exit
/// path (including unwinding) and restores the previous activation.
pub fn install_and_flush<R>(f: impl FnOnce() -> R) -> R {
    STACK.with(|s| s.borrow_mut().push(VecDeque::new()));
    let _flush = FlushGuard;
    f()
}

struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        while let Some(handle) = next_ready() {
            handle.run();
        }
        STACK.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

/// Yields the current task to the back of the active queue, letting every
/// other ready task run one step first.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::spawn_handle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn resume_without_queue_runs_inline() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        resume_ready(spawn_handle(async move {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn install_defers_until_scope_exit() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        install_and_flush(|| {
            resume_ready(spawn_handle(async move {
                r.fetch_add(1, Ordering::SeqCst);
            }));
            // The setter's statement runs before the resumed task.
            assert_eq!(ran.load(Ordering::SeqCst), 0);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_install_drains_before_outer() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let l1 = log.clone();
        let l2 = log.clone();
        install_and_flush(|| {
            resume_ready(spawn_handle(async move {
                l1.lock().unwrap().push("outer");
            }));
            install_and_flush(|| {
                resume_ready(spawn_handle(async move {
                    l2.lock().unwrap().push("inner");
                }));
            });
            assert_eq!(*log.lock().unwrap(), vec!["inner"]);
        });
        assert_eq!(*log.lock().unwrap(), vec!["inner", "outer"]);
    }
}
