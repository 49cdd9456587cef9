//! Promise-style tasks: completion produced externally rather than by
//! running a body.
//!
//! Concurrent completion attempts are serialized by a completion
//! reservation in the state word; exactly one caller wins, publishes the
//! terminal bit, and drains continuations.

use crate::cancel::CancellationToken;
use crate::task::core::Cell;
use crate::task::error::{Failure, OperationCanceled, PanicPayload};
use crate::task::options::CreationOptions;
use crate::task::state;
use crate::task::Task;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// The producer side of an externally-completed task.
///
/// ```
/// use ravel::Promise;
/// use std::thread;
///
/// let promise = Promise::new();
/// let task = promise.task();
///
/// thread::spawn(move || {
///     assert!(promise.try_set_result(7));
/// });
///
/// assert_eq!(task.result().unwrap(), 7);
/// ```
pub struct Promise<T> {
    task: Task<T>,
}

impl<T: Send + 'static> Promise<T> {
    /// Creates a promise and its task, in `WaitingForActivation`.
    pub fn new() -> Promise<T> {
        Promise {
            task: Task::from_cell(Arc::new(Cell::new(
                None,
                None,
                CreationOptions::NONE,
                false,
            ))),
        }
    }

    /// The consumer-side handle.
    pub fn task(&self) -> Task<T> {
        self.task.clone()
    }

    /// Completes the task with `value`. Exactly one `try_set_*` call
    /// returns `true`; the rest lose the reservation and return `false`.
    pub fn try_set_result(&self, value: T) -> bool {
        self.task.try_complete_value(value)
    }

    /// Completes the task as faulted, capturing `error` as a panic-style
    /// payload.
    pub fn try_set_error(&self, error: impl Any + Send + 'static) -> bool {
        self.task.try_complete_failures(vec![Failure::Panic(
            PanicPayload::new(Box::new(error)),
        )])
    }

    /// Completes the task as canceled, carrying `token`.
    pub fn try_set_canceled(&self, token: CancellationToken) -> bool {
        self.task
            .try_complete_canceled(OperationCanceled::new(token))
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Promise<T> {
        Promise::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Promise").finish()
    }
}

// Internal completion entry points, shared by `Promise`, the combinators,
// and the `from_*` constructors.
impl<T: Send + 'static> Task<T> {
    pub(crate) fn try_complete_value(&self, value: T) -> bool {
        if !self.cell().header.state.reserve_completion() {
            return false;
        }
        self.cell().store_value(value);
        self.any().promise_complete(state::RAN_TO_COMPLETION);
        true
    }

    pub(crate) fn try_complete_failures(&self, failures: Vec<Failure>) -> bool {
        if !self.cell().header.state.reserve_completion() {
            return false;
        }
        self.cell().header.with_holder(|holder| {
            for failure in failures {
                holder.add_failure(failure);
            }
        });
        self.any().promise_complete(state::FAULTED);
        true
    }

    pub(crate) fn try_complete_canceled(&self, oc: OperationCanceled) -> bool {
        if !self.cell().header.state.reserve_completion() {
            return false;
        }
        if oc.token().can_be_canceled() {
            self.cell()
                .header
                .set_cancellation_token(oc.token().clone());
        }
        self.cell()
            .header
            .with_holder(|holder| holder.set_cancellation(oc));
        self.any().promise_complete(state::CANCELED);
        true
    }

    /// An already-completed task holding `value`.
    pub fn from_result(value: T) -> Task<T> {
        let task = Promise::new().task;
        let set = task.try_complete_value(value);
        debug_assert!(set);
        task
    }

    /// An already-faulted task capturing `error`.
    pub fn from_error(error: impl Any + Send + 'static) -> Task<T> {
        let task: Task<T> = Promise::new().task;
        let set = task.try_complete_failures(vec![Failure::Panic(PanicPayload::new(
            Box::new(error),
        ))]);
        debug_assert!(set);
        task
    }

    /// An already-canceled task carrying `token`.
    pub fn from_canceled(token: CancellationToken) -> Task<T> {
        let task: Task<T> = Promise::new().task;
        let set = task.try_complete_canceled(OperationCanceled::new(token));
        debug_assert!(set);
        task
    }

    /// Creates a bare promise cell for combinators that complete it
    /// internally.
    pub(crate) fn promise_task() -> Task<T> {
        Promise::new().task
    }
}

// `Cell::new` seeds promises with `Stage::Running`; an external completer
// stores the value before publishing the terminal bit.
impl<T: Send + 'static> Cell<T> {
    pub(crate) fn store_value(&self, value: T) {
        *self.stage.lock().unwrap() = crate::task::core::Stage::Finished(value);
    }
}
