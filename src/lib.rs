//! Cooperative coroutine runtime core.
//!
//! `weft` is a small runtime built around three ideas:
//!
//! 1. **Single-shot futures with explicit promises.** A [`Future`] is a
//!    write-once cell; its unique [`Promise`] resolves it from anywhere.
//!    Resolution does not run the unblocked consumers — it hands them back
//!    to the resolver as a [`SuspendPoint`].
//! 2. **A per-thread resumption queue.** Ready tasks are pushed onto a
//!    thread-local FIFO and run when the current activation unwinds, so a
//!    setter always returns to its caller before any consumer executes.
//! 3. **Explicit cross-thread hand-off.** There is no ambient executor.
//!    Work moves between threads only through the [`ThreadPool`] and the
//!    [`Scheduler`], both of which speak the same promise/suspend-point
//!    surface.
//!
//! ```text
//!      │                                │
//!      │ owner ─────────┐               │ owner ──┐
//!      │                ▼               │         │
//!      │            ┌────────┐          ▼         │
//!      ▼            │        │     ┌─────────┐    │
//!    .await ◄───────┤ Future │◄────┤ Promise │◄───┘
//!      │            │        │     └────┬────┘
//!      │            └────────┘          │
//!      ▼                                ▼
//!    task resumes              set() → SuspendPoint
//! ```
//!
//! Tasks are polled inline on whichever thread flushes them; within one
//! thread the queue preserves strict FIFO order, which is what makes the
//! round-robin cooperative examples deterministic.

mod chain;
mod error;
mod future;
mod generator;
mod mutex;
mod pool;
mod publisher;
mod scheduler;
mod shared;
mod signal;
mod stop;
mod suspend;
mod sync;
mod task;
mod wait;

pub mod queue;

pub use error::{AwaitError, NoMoreValues, TaskError};
pub use future::{Future, Get, HasValue, Promise};
pub use generator::{generator, Advance, Emit, Generator, Yielder};
pub use mutex::{Lock, Mutex, MutexGuard, TryLockError};
pub use pool::{ThreadPool, Transfer, Wrap};
pub use publisher::{Publisher, ReadMode, Recv, RecvError, Subscriber};
pub use queue::{yield_now, YieldNow};
pub use scheduler::{run_with, Expired, Ident, Scheduler};
pub use shared::SharedFuture;
pub use signal::{hook_up, Collector, Emitter, HookListen, HookedEmitter, Listen, Signal};
pub use stop::{StopCallback, StopSource, StopToken};
pub use suspend::SuspendPoint;
pub use task::{Task, TaskHandle};

/// Returns true when `WEFT_DEBUG=1` is set in the environment.
pub(crate) fn debug_enabled() -> bool {
    use std::sync::OnceLock;
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var("WEFT_DEBUG").map_or(false, |v| v == "1"))
}

macro_rules! rt_debug {
    ($($arg:tt)*) => {
        if $crate::debug_enabled() {
            eprintln!("[weft] {}", format!($($arg)*));
        }
    };
}

pub(crate) use rt_debug;
