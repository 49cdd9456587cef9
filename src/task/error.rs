use crate::cancel::CancellationToken;
use crate::scheduler::QueueError;

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A preserved panic payload, shareable between every consumer of a failed
/// task.
///
/// Panic payloads are `Send` but not necessarily `Sync`, so the shared form
/// keeps the payload behind a lock and extracts the conventional string
/// message up front.
#[derive(Clone)]
pub struct PanicPayload {
    message: Option<Arc<str>>,
    payload: Arc<Mutex<Box<dyn Any + Send + 'static>>>,
}

impl PanicPayload {
    pub(crate) fn new(payload: Box<dyn Any + Send + 'static>) -> PanicPayload {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            Some(Arc::from(*s))
        } else {
            payload
                .downcast_ref::<String>()
                .map(|s| Arc::from(s.as_str()))
        };
        PanicPayload {
            message,
            payload: Arc::new(Mutex::new(payload)),
        }
    }

    /// The panic message, when the payload was a string.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Inspects the raw payload.
    pub fn with_payload<R>(&self, f: impl FnOnce(&(dyn Any + Send + 'static)) -> R) -> R {
        let payload = self.payload.lock().unwrap();
        f(&**payload)
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => write!(fmt, "PanicPayload({:?})", message),
            None => write!(fmt, "PanicPayload(..)"),
        }
    }
}

/// A captured task failure.
///
/// Failures are captured where they happen and surface later, when a
/// consumer waits on the task or reads its result.
#[derive(Clone)]
pub enum Failure {
    /// A panic unwound out of the task body. The payload is preserved.
    Panic(PanicPayload),
    /// The task (or a constituent of a combinator) was canceled.
    Canceled(OperationCanceled),
    /// The scheduler rejected the task when it was queued.
    Scheduler(QueueError),
}

impl Failure {
    /// Returns `true` for a cancellation signal.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Failure::Canceled(_))
    }

    /// The panic payload, if the failure is a panic.
    pub fn panic_payload(&self) -> Option<&PanicPayload> {
        match self {
            Failure::Panic(payload) => Some(payload),
            _ => None,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Panic(payload) => match payload.message() {
                Some(message) => write!(fmt, "task panicked: {}", message),
                None => write!(fmt, "task panicked"),
            },
            Failure::Canceled(oc) => oc.fmt(fmt),
            Failure::Scheduler(err) => write!(fmt, "scheduler error: {}", err),
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Panic(payload) => payload.fmt(fmt),
            Failure::Canceled(oc) => write!(fmt, "Canceled({:?})", oc),
            Failure::Scheduler(err) => write!(fmt, "Scheduler({:?})", err),
        }
    }
}

/// One or more captured failures, in the order they were recorded.
///
/// Waiting on a faulted task, reading its result, or waiting on a combinator
/// with faulted constituents produces this aggregate.
#[derive(Clone, Debug)]
pub struct AggregateError {
    failures: Vec<Failure>,
}

impl AggregateError {
    pub(crate) fn new(failures: Vec<Failure>) -> AggregateError {
        AggregateError { failures }
    }

    /// The captured failures, oldest first.
    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// Returns `true` if every captured failure is a cancellation.
    pub fn is_cancellation_only(&self) -> bool {
        self.failures.iter().all(Failure::is_cancellation)
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "one or more tasks failed")?;
        for failure in &self.failures {
            write!(fmt, "; {}", failure)?;
        }
        Ok(())
    }
}

impl Error for AggregateError {}

/// An operation observed a requested cancellation.
///
/// Carries the token whose cancellation was observed, so callers can tell a
/// wait interrupted by their own token apart from a task canceled by
/// another.
#[derive(Clone, Debug)]
pub struct OperationCanceled {
    token: CancellationToken,
}

impl OperationCanceled {
    /// Creates a cancellation signal carrying `token`.
    ///
    /// A task body acknowledges cooperative cancellation by panicking with
    /// this value: `std::panic::panic_any(OperationCanceled::new(token))`.
    /// If the payload's token is the task's own, already-requested token, the
    /// task completes as canceled rather than faulted.
    pub fn new(token: CancellationToken) -> OperationCanceled {
        OperationCanceled { token }
    }

    pub(crate) fn untokened() -> OperationCanceled {
        OperationCanceled {
            token: CancellationToken::none(),
        }
    }

    /// The token whose cancellation was observed.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl fmt::Display for OperationCanceled {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "the operation was canceled")
    }
}

impl Error for OperationCanceled {}

/// The reason a wait ended without producing the task's value.
#[derive(Clone, Debug)]
pub enum WaitError {
    /// The token passed to the wait was canceled, or the task itself was
    /// canceled by the very token the wait was given.
    Canceled(OperationCanceled),
    /// The task reached a terminal state carrying failures.
    Faulted(AggregateError),
}

impl fmt::Display for WaitError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Canceled(oc) => oc.fmt(fmt),
            WaitError::Faulted(err) => err.fmt(fmt),
        }
    }
}

impl Error for WaitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WaitError::Canceled(oc) => Some(oc),
            WaitError::Faulted(err) => Some(err),
        }
    }
}

/// The reason a `start` or `run_synchronously` call was rejected.
///
/// Rejection is synchronous and leaves the task unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartError {
    /// The task has already been given to a scheduler.
    AlreadyStarted,
    /// Promise-style tasks are completed externally, never started.
    Promise,
    /// Continuation tasks are activated by their antecedent, never started.
    Continuation,
    /// The task already reached a terminal state.
    Completed,
    /// The scheduler rejected the task; the task has transitioned to
    /// faulted with this error captured.
    Queue(QueueError),
}

impl fmt::Display for StartError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::AlreadyStarted => "task was already started".fmt(fmt),
            StartError::Promise => "promise-style tasks cannot be started".fmt(fmt),
            StartError::Continuation => "continuation tasks cannot be started".fmt(fmt),
            StartError::Completed => "task has already completed".fmt(fmt),
            StartError::Queue(err) => write!(fmt, "scheduler rejected the task: {}", err),
        }
    }
}

impl Error for StartError {}

/// `dispose` was called on a task that has not completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisposeError(pub(crate) ());

impl fmt::Display for DisposeError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        "task may only be disposed in a terminal state".fmt(fmt)
    }
}

impl Error for DisposeError {}
