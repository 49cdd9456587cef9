//! Blocking support: a manual-reset event.
//!
//! Waiters block on a mutex/condvar pair behind an atomic fast path; setters
//! publish through the atomic and broadcast. Once set, an event stays set.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const UNSET: usize = 0;
const SET: usize = 1;

pub(crate) struct Event {
    state: AtomicUsize,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Event {
    pub(crate) fn new() -> Event {
        Event {
            state: AtomicUsize::new(UNSET),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.state.load(Acquire) == SET
    }

    /// Sets the event and wakes every waiter. Idempotent.
    pub(crate) fn set(&self) {
        self.state.store(SET, Release);

        // Taking the lock closes the race with a waiter that checked the
        // state and is about to block: either it sees SET, or it is already
        // inside `wait` and receives the broadcast.
        let _guard = self.mutex.lock().unwrap();
        self.condvar.notify_all();
    }

    /// Blocks until the event is set or `timeout` elapses. `None` waits
    /// indefinitely. Returns `true` if the event was set.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.is_set() {
            return true;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.mutex.lock().unwrap();

        loop {
            if self.is_set() {
                return true;
            }

            match deadline {
                None => {
                    guard = self.condvar.wait(guard).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return self.is_set();
                    }
                    let (next, _timed_out) = self
                        .condvar
                        .wait_timeout(guard, deadline - now)
                        .unwrap();
                    guard = next;
                }
            }
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Event")
            .field("is_set", &self.is_set())
            .finish()
    }
}
