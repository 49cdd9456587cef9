//! Cooperative cancellation.
//!
//! A [`CancellationSource`] owns a one-shot signal. [`CancellationToken`]s
//! handed out by the source observe the signal and accept callback
//! registrations; the edge from unsignaled to signaled fires every
//! registered callback exactly once, on the canceling thread. Registering
//! after the edge fires the callback immediately, on the registering thread.
//!
//! ```
//! use ravel::cancel::CancellationSource;
//!
//! let source = CancellationSource::new();
//! let token = source.token();
//! assert!(!token.is_requested());
//! source.cancel();
//! assert!(token.is_requested());
//! ```

use slab::Slab;

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::{Arc, Mutex, Weak};

type Callback = Box<dyn FnOnce() + Send>;

struct Inner {
    requested: AtomicBool,
    callbacks: Mutex<Slab<Callback>>,
}

impl Inner {
    fn cancel(&self) {
        // The store makes `is_requested` observable before callbacks run;
        // the lock serializes against concurrent `register` calls so that
        // every callback runs exactly once, here or there.
        self.requested.store(true, Release);

        let drained: Vec<Callback> = {
            let mut callbacks = self.callbacks.lock().unwrap();
            callbacks.drain().collect()
        };

        for callback in drained {
            callback();
        }
    }
}

/// Owns a one-shot cancellation signal. Clones share the signal.
#[derive(Clone)]
pub struct CancellationSource {
    inner: Arc<Inner>,
}

impl CancellationSource {
    /// Creates a new, unsignaled source.
    pub fn new() -> CancellationSource {
        CancellationSource {
            inner: Arc::new(Inner {
                requested: AtomicBool::new(false),
                callbacks: Mutex::new(Slab::new()),
            }),
        }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: Some(self.inner.clone()),
        }
    }

    /// Signals cancellation. Idempotent; the first call runs the registered
    /// callbacks on this thread.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Returns `true` if `cancel` has been called.
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Acquire)
    }
}

impl Default for CancellationSource {
    fn default() -> CancellationSource {
        CancellationSource::new()
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("CancellationSource")
            .field("is_requested", &self.is_requested())
            .finish()
    }
}

/// Observes a [`CancellationSource`].
///
/// A token is a cheap handle; clones observe the same source. The token
/// obtained from [`CancellationToken::none`] can never be canceled.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Option<Arc<Inner>>,
}

impl CancellationToken {
    /// A token that can never be canceled.
    pub fn none() -> CancellationToken {
        CancellationToken { inner: None }
    }

    /// Returns `true` if cancellation has been requested.
    pub fn is_requested(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.requested.load(Acquire),
            None => false,
        }
    }

    /// Returns `true` if the token is backed by a source and can therefore
    /// ever become requested.
    pub fn can_be_canceled(&self) -> bool {
        self.inner.is_some()
    }

    /// Registers a callback to run when cancellation is requested.
    ///
    /// If cancellation was already requested the callback runs immediately on
    /// this thread. The returned [`Registration`] deregisters the callback
    /// when dropped (a callback that already ran is gone either way).
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> Registration {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return Registration { source: Weak::new(), key: 0 },
        };

        {
            let mut callbacks = inner.callbacks.lock().unwrap();
            // Checked under the lock: a concurrent `cancel` either already
            // drained (then `requested` is visible here) or will drain this
            // entry after we insert it.
            if !inner.requested.load(Acquire) {
                let key = callbacks.insert(Box::new(callback));
                return Registration {
                    source: Arc::downgrade(inner),
                    key,
                };
            }
        }

        callback();
        Registration { source: Weak::new(), key: 0 }
    }

    /// Returns `true` if both tokens observe the same source. Tokens from
    /// [`CancellationToken::none`] compare equal to each other.
    pub fn same_source(&self, other: &CancellationToken) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl PartialEq for CancellationToken {
    fn eq(&self, other: &CancellationToken) -> bool {
        self.same_source(other)
    }
}

impl Eq for CancellationToken {}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("CancellationToken")
            .field("can_be_canceled", &self.can_be_canceled())
            .field("is_requested", &self.is_requested())
            .finish()
    }
}

/// Deregisters a cancellation callback when dropped.
pub struct Registration {
    source: Weak<Inner>,
    key: usize,
}

impl Registration {
    /// Removes the callback if it has not run yet. Equivalent to dropping.
    pub fn deregister(self) {}
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.source.upgrade() {
            let mut callbacks = inner.callbacks.lock().unwrap();
            if callbacks.contains(self.key) {
                callbacks.remove(self.key);
            }
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Registration").finish()
    }
}
