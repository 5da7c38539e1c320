//! Many-consumer value stream over a bounded history ring.
//!
//! A [`Publisher`] appends values with dense, monotonically increasing
//! sequence numbers into a ring of fixed capacity. Every [`Subscriber`]
//! keeps its own cursor; a subscriber that falls more than one ring
//! behind is *lagged* and its next read behaves according to its
//! [`ReadMode`]: report the loss, or silently snap to the oldest retained
//! value.

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::wait;

struct Ring<T> {
    buf: VecDeque<T>,
    // Sequence number of buf[0].
    head: u64,
    capacity: usize,
    closed: bool,
    waiters: Vec<Waker>,
}

impl<T> Ring<T> {
    fn tail(&self) -> u64 {
        self.head + self.buf.len() as u64
    }
}

/// Policy applied when a subscriber's cursor fell off the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// The read fails with [`RecvError::Lagged`] carrying the number of
    /// lost values; the cursor snaps to the oldest retained value.
    FailOnLag,
    /// The cursor snaps silently and the read returns the oldest
    /// retained value.
    SkipToLatest,
}

/// Error returned by [`Subscriber::recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// The subscriber lost this many values to ring overwrite.
    Lagged(u64),
    /// The publisher closed; no further values will arrive.
    Closed,
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Lagged(n) => write!(f, "subscriber lagged, {n} values lost"),
            RecvError::Closed => f.write_str("publisher closed"),
        }
    }
}

impl StdError for RecvError {}

/// The writing half of the stream.
pub struct Publisher<T> {
    ring: Arc<Mutex<Ring<T>>>,
}

impl<T: Clone> Publisher<T> {
    /// Creates a publisher retaining the last `capacity` values.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "publisher capacity must be non-zero");
        Self {
            ring: Arc::new(Mutex::new(Ring {
                buf: VecDeque::with_capacity(capacity),
                head: 0,
                capacity,
                closed: false,
                waiters: Vec::new(),
            })),
        }
    }

    /// Appends a value, assigning it the next sequence number, and wakes
    /// every subscriber parked at the tail.
    pub fn publish(&self, value: T) {
        let waiters = {
            let mut ring = self.ring.lock().unwrap();
            if ring.closed {
                return;
            }
            ring.buf.push_back(value);
            if ring.buf.len() > ring.capacity {
                ring.buf.pop_front();
                ring.head += 1;
            }
            std::mem::take(&mut ring.waiters)
        };
        for w in waiters {
            w.wake();
        }
    }

    /// Closes the stream; parked subscribers wake and observe
    /// [`RecvError::Closed`] once they exhaust the retained history.
    pub fn close(&self) {
        let waiters = {
            let mut ring = self.ring.lock().unwrap();
            ring.closed = true;
            std::mem::take(&mut ring.waiters)
        };
        for w in waiters {
            w.wake();
        }
    }

    /// Registers a subscriber that observes every value published from
    /// this point on.
    pub fn subscribe(&self, mode: ReadMode) -> Subscriber<T> {
        let ring = self.ring.lock().unwrap();
        Subscriber {
            ring: self.ring.clone(),
            cursor: ring.tail(),
            mode,
        }
    }
}

impl<T> Drop for Publisher<T> {
    fn drop(&mut self) {
        let waiters = {
            let mut ring = self.ring.lock().unwrap();
            ring.closed = true;
            std::mem::take(&mut ring.waiters)
        };
        for w in waiters {
            w.wake();
        }
    }
}

impl<T> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}

/// A reading cursor over the publisher's history.
pub struct Subscriber<T> {
    ring: Arc<Mutex<Ring<T>>>,
    cursor: u64,
    mode: ReadMode,
}

impl<T: Clone> Subscriber<T> {
    /// Awaits the value at the cursor.
    pub fn recv(&mut self) -> Recv<'_, T> {
        Recv { sub: self }
    }

    /// Blocking form of [`recv`](Subscriber::recv) for plain threads.
    pub fn recv_blocking(&mut self) -> Result<T, RecvError> {
        wait::block_on(self.recv())
    }

    /// Synchronous iteration until the publisher closes. Lag is resolved
    /// per the subscriber's mode; reported losses are skipped over.
    pub fn iter(&mut self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || loop {
            match self.recv_blocking() {
                Ok(v) => return Some(v),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        })
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Result<T, RecvError>> {
        let mut ring = self.ring.lock().unwrap();
        if self.cursor < ring.head {
            let missed = ring.head - self.cursor;
            self.cursor = ring.head;
            match self.mode {
                ReadMode::FailOnLag => return Poll::Ready(Err(RecvError::Lagged(missed))),
                ReadMode::SkipToLatest => {}
            }
        }
        if self.cursor < ring.tail() {
            let idx = (self.cursor - ring.head) as usize;
            let value = ring.buf[idx].clone();
            self.cursor += 1;
            return Poll::Ready(Ok(value));
        }
        if ring.closed {
            return Poll::Ready(Err(RecvError::Closed));
        }
        ring.waiters.push(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            ring: self.ring.clone(),
            cursor: self.cursor,
            mode: self.mode,
        }
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("cursor", &self.cursor)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Future returned by [`Subscriber::recv`].
#[must_use]
pub struct Recv<'a, T> {
    sub: &'a mut Subscriber<T>,
}

impl<T: Clone> Future for Recv<'_, T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = unsafe { self.get_unchecked_mut() };
        this.sub.poll_recv(cx)
    }
}
