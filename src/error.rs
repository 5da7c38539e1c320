//! Error kinds surfaced by futures, generators and the scheduler.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Cloneable, type-erased failure stored in a future's failure slot.
///
/// Futures can be read by many consumers, so the stored error must be
/// cheap to hand out repeatedly; it is reference-counted and every read
/// observes the same underlying error.
#[derive(Clone)]
pub struct TaskError(Arc<dyn StdError + Send + Sync + 'static>);

impl TaskError {
    /// Wraps a concrete error.
    pub fn new<E: StdError + Send + Sync + 'static>(err: E) -> Self {
        Self(Arc::new(err))
    }

    /// Builds an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self(Arc::new(Message(message.into())))
    }

    /// Borrows the underlying error, e.g. for downcasting.
    pub fn get(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }

    /// Returns true when the underlying error is of type `E`.
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.0.downcast_ref::<E>().is_some()
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

struct Message(String);

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

/// Outcome of reading a future that did not deliver a plain value.
#[derive(Clone, Debug)]
pub enum AwaitError {
    /// Read attempted before resolution, outside of a wait.
    NotReady,
    /// The producer went away without delivering a value.
    Canceled,
    /// The producer recorded a failure.
    Failed(TaskError),
}

impl AwaitError {
    /// Returns true for the cancellation outcome.
    pub fn is_canceled(&self) -> bool {
        matches!(self, AwaitError::Canceled)
    }
}

impl fmt::Display for AwaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AwaitError::NotReady => f.write_str("value is not ready"),
            AwaitError::Canceled => f.write_str("await canceled"),
            AwaitError::Failed(e) => write!(f, "task failed: {e}"),
        }
    }
}

impl StdError for AwaitError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            AwaitError::Failed(e) => Some(e.get()),
            _ => None,
        }
    }
}

/// Raised when an exhausted generator is advanced through its callable
/// form; the returned future fails with this error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoMoreValues;

impl fmt::Display for NoMoreValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no more values")
    }
}

impl StdError for NoMoreValues {}
