//! Synchronization primitive aliases for loom testing.
//!
//! Compiled with `--cfg loom` this module resolves to loom's checked types
//! so the lock-free chain and mutex protocols can be model-checked;
//! otherwise it resolves to std.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};

#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};

#[cfg(loom)]
pub(crate) use loom::sync::{Condvar, Mutex};

#[cfg(not(loom))]
pub(crate) use std::sync::{Condvar, Mutex};
