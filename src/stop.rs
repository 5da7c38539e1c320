//! Three-state cancellation handshake.
//!
//! A [`StopSource`] owns the request side, [`StopToken`]s query it, and
//! callbacks registered through [`StopToken::on_stop`] run exactly once —
//! at request time, or immediately when the request already happened.

use std::sync::{Arc, Mutex};

use crate::sync::{AtomicBool, Ordering};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct StopShared {
    requested: AtomicBool,
    callbacks: Mutex<Vec<Option<Callback>>>,
}

/// The requesting side of the handshake.
pub struct StopSource {
    shared: Arc<StopShared>,
}

impl StopSource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(StopShared {
                requested: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Hands out a queryable token.
    pub fn token(&self) -> StopToken {
        StopToken {
            shared: Some(self.shared.clone()),
        }
    }

    /// Requests the stop and runs all registered callbacks. Returns
    /// false when the stop was already requested.
    pub fn request_stop(&self) -> bool {
        if self.shared.requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callbacks = std::mem::take(&mut *self.shared.callbacks.lock().unwrap());
        for cb in callbacks.into_iter().flatten() {
            cb();
        }
        true
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared.requested.load(Ordering::Acquire)
    }
}

impl Clone for StopSource {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StopSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSource")
            .field("requested", &self.is_stop_requested())
            .finish()
    }
}

/// The querying side; cheap to clone and pass around.
#[derive(Clone)]
pub struct StopToken {
    shared: Option<Arc<StopShared>>,
}

impl StopToken {
    /// A token with no source behind it; never reports a stop.
    pub fn never() -> Self {
        Self { shared: None }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared
            .as_ref()
            .map_or(false, |s| s.requested.load(Ordering::Acquire))
    }

    /// Registers a callback to run at stop request. If the request
    /// already happened the callback runs right here. The registration
    /// is dropped with the returned guard.
    pub fn on_stop(&self, f: impl FnOnce() + Send + 'static) -> StopCallback {
        let Some(shared) = &self.shared else {
            return StopCallback {
                shared: None,
                key: 0,
            };
        };
        {
            let mut callbacks = shared.callbacks.lock().unwrap();
            if !shared.requested.load(Ordering::Acquire) {
                let key = callbacks.len();
                callbacks.push(Some(Box::new(f)));
                return StopCallback {
                    shared: Some(shared.clone()),
                    key,
                };
            }
        }
        f();
        StopCallback {
            shared: None,
            key: 0,
        }
    }
}

impl std::fmt::Debug for StopToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopToken")
            .field("requested", &self.is_stop_requested())
            .finish()
    }
}

/// Registration guard returned by [`StopToken::on_stop`]; dropping it
/// deregisters the callback if it has not run yet.
pub struct StopCallback {
    shared: Option<Arc<StopShared>>,
    key: usize,
}

impl Drop for StopCallback {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            let mut callbacks = shared.callbacks.lock().unwrap();
            if let Some(slot) = callbacks.get_mut(self.key) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};

    #[test]
    fn callback_runs_on_request() {
        let src = StopSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _cb = src.token().on_stop(move || {
            h.fetch_add(1, StdOrdering::SeqCst);
        });
        assert!(!src.token().is_stop_requested());
        assert!(src.request_stop());
        assert!(!src.request_stop());
        assert_eq!(hits.load(StdOrdering::SeqCst), 1);
    }

    #[test]
    fn late_registration_fires_immediately() {
        let src = StopSource::new();
        src.request_stop();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _cb = src.token().on_stop(move || {
            h.fetch_add(1, StdOrdering::SeqCst);
        });
        assert_eq!(hits.load(StdOrdering::SeqCst), 1);
    }

    #[test]
    fn dropped_registration_never_fires() {
        let src = StopSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cb = src.token().on_stop(move || {
            h.fetch_add(1, StdOrdering::SeqCst);
        });
        drop(cb);
        src.request_stop();
        assert_eq!(hits.load(StdOrdering::SeqCst), 0);
    }

    #[test]
    fn never_token_is_inert() {
        let token = StopToken::never();
        assert!(!token.is_stop_requested());
        let _cb = token.on_stop(|| panic!("must not run"));
    }
}
