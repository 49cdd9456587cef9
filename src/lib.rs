#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! A thread-based task runtime.
//!
//! ravel represents deferred units of work as [`Task`] handles, composes them
//! into graphs of dependent computations, coordinates their completion across
//! threads, and propagates results, failures, and cancellation.
//!
//! At the center is a lock-light lifecycle state machine that unifies:
//!
//! * user-scheduled compute tasks, run by a pluggable [`scheduler`]
//!   (a work-stealing thread pool by default),
//! * externally-completed promises ([`Promise`]),
//! * parent/child attachment trees with aggregated error propagation,
//! * a continuation list that races task completion against new
//!   registrations,
//! * cooperative cancellation ([`cancel`]) integrated with both scheduling
//!   and execution.
//!
//! # Example
//!
//! ```
//! use ravel::Task;
//!
//! let task = Task::new(|| 6 * 7);
//! task.start().unwrap();
//! assert_eq!(task.result().unwrap(), 42);
//! ```
//!
//! Failures are captured, not re-thrown in place: a panic unwinding out of a
//! task body is held by the task and surfaces as an [`AggregateError`] when a
//! consumer waits on the task or reads its result. Cancellation is
//! cooperative and flows through [`cancel::CancellationToken`]; a body
//! acknowledges it by panicking with an [`OperationCanceled`] payload
//! carrying the task's token.

#[macro_use]
extern crate lazy_static;

pub mod cancel;
pub mod scheduler;
pub mod task;
pub mod time;

mod park;

pub use self::task::error::{
    AggregateError, DisposeError, Failure, OperationCanceled, PanicPayload, StartError,
    WaitError,
};
pub use self::task::exceptions::set_unobserved_hook;
pub use self::task::options::{ContinueOptions, CreationOptions};
pub use self::task::promise::Promise;
pub use self::task::{
    current_id, run, run_cancelable, run_flatten, wait_all, wait_all_timeout, wait_any,
    wait_any_timeout, when_all, when_any, Status, Task,
};
pub use self::scheduler::QueueError;
