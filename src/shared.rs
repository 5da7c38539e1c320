//! Cloneable wrapper over the single-shot future cell.
//!
//! Where [`Future`] has one owner, a [`SharedFuture`] is a cheap handle
//! to the same cell: clone it across awaiters, read the value from all of
//! them once resolved. While the cell is pending it is kept alive by the
//! promise's own reference, so dropping every shared handle before
//! resolution is fine — the setter still lands in a live cell.

use std::future::IntoFuture;
use std::sync::Arc;

use crate::error::AwaitError;
use crate::future::{Future, FutureCell, Get, Promise};
use crate::task::Task;

/// Reference-counted, cloneable future.
#[must_use]
pub struct SharedFuture<T> {
    cell: Arc<FutureCell<T>>,
}

impl<T> SharedFuture<T> {
    pub(crate) fn from_cell(cell: Arc<FutureCell<T>>) -> Self {
        Self { cell }
    }

    /// Arms a fresh cell and passes the promise to `init`.
    pub fn new_with(init: impl FnOnce(Promise<T>)) -> Self {
        Future::new_with(init).into_shared()
    }

    /// Wraps the future produced by `f`.
    pub fn of(f: impl FnOnce() -> Future<T>) -> Self {
        f().into_shared()
    }

    /// An already-resolved shared future.
    pub fn ready(value: T) -> Self {
        Future::ready(value).into_shared()
    }

    pub fn is_ready(&self) -> bool {
        self.cell.is_ready()
    }

    pub fn is_pending(&self) -> bool {
        self.cell.is_pending()
    }

    /// Non-blocking read.
    pub fn value(&self) -> Result<&T, AwaitError> {
        self.cell.read()
    }

    /// Awaitable read.
    pub fn get(&self) -> Get<'_, T> {
        self.cell.get()
    }

    /// Blocks until resolution, then reads.
    pub fn wait(&self) -> Result<&T, AwaitError> {
        self.cell.sync();
        self.cell.read()
    }

    /// Blocks until resolution without touching the result.
    pub fn sync(&self) {
        self.cell.sync();
    }
}

impl<T: Send + Sync + 'static> SharedFuture<T> {
    /// Starts a task and shares its result.
    pub fn from_task(task: Task<T>) -> Self {
        task.start().into_shared()
    }
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> From<Future<T>> for SharedFuture<T> {
    fn from(fut: Future<T>) -> Self {
        fut.into_shared()
    }
}

impl<T> std::fmt::Debug for SharedFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.is_ready() {
            "ready"
        } else if self.is_pending() {
            "pending"
        } else {
            "uninit"
        };
        f.debug_struct("SharedFuture")
            .field("state", &state)
            .finish()
    }
}

impl<'a, T> IntoFuture for &'a SharedFuture<T> {
    type Output = Result<&'a T, AwaitError>;
    type IntoFuture = Get<'a, T>;

    fn into_future(self) -> Get<'a, T> {
        self.get()
    }
}
