//! Tasks: deferred units of work with a lifecycle.
//!
//! A [`Task`] is a cloneable handle to a computation that will run at most
//! once, on a scheduler. Its lifecycle is a monotone state machine:
//! created, scheduled, running, optionally waiting on attached children,
//! then exactly one of ran-to-completion, faulted, or canceled. Completion
//! fires registered continuations and wakes blocked waiters.

pub(crate) mod continuations;
pub(crate) mod core;
pub(crate) mod current;
pub(crate) mod error;
pub(crate) mod exceptions;
mod id;
pub(crate) mod options;
pub(crate) mod promise;
pub(crate) mod state;

mod run;
mod unwrap;
mod wait;
mod when_all;
mod when_any;

pub use self::run::{run, run_cancelable, run_flatten};
pub use self::wait::{wait_all, wait_all_timeout, wait_any, wait_any_timeout};
pub use self::when_all::when_all;
pub use self::when_any::when_any;

use self::continuations::{Continuation, Entry, Register, SpawnContinuation};
use self::core::{AnyCell, AnyTask, Cell};
use self::error::{AggregateError, DisposeError, OperationCanceled, StartError, WaitError};
use self::options::{ContinueOptions, CreationOptions};
use crate::cancel::CancellationToken;
use crate::scheduler::{self, QueuedTask, SchedulerHandle, SpawnHint};

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The public projection of a task's lifecycle state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Constructed, not yet given to a scheduler.
    Created,
    /// A promise or continuation, waiting to be triggered externally.
    WaitingForActivation,
    /// Accepted by a scheduler, not yet running.
    WaitingToRun,
    /// The body is executing.
    Running,
    /// The body returned; attached children are still running.
    WaitingForChildrenToComplete,
    /// Terminal: produced a value.
    RanToCompletion,
    /// Terminal: canceled.
    Canceled,
    /// Terminal: failed.
    Faulted,
}

impl Status {
    /// True for the three terminal states.
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            Status::RanToCompletion | Status::Canceled | Status::Faulted
        )
    }
}

/// A handle to a deferred computation producing a `T`.
///
/// Handles are cheap to clone; all clones observe the same underlying task.
pub struct Task<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Task<T> {
        Task {
            cell: self.cell.clone(),
        }
    }
}

impl<T: Send + 'static> Task<T> {
    /// Creates a task that will run `body` once started.
    pub fn new(body: impl FnOnce() -> T + Send + 'static) -> Task<T> {
        Task::new_with_all(
            body,
            None,
            CancellationToken::none(),
            CreationOptions::NONE,
        )
    }

    /// Creates a task whose body receives a shared state object, also
    /// retrievable later through [`Task::async_state`].
    pub fn with_state<S>(
        body: impl FnOnce(&S) -> T + Send + 'static,
        state: S,
    ) -> Task<T>
    where
        S: Any + Send + Sync,
    {
        let state: Arc<dyn Any + Send + Sync> = Arc::new(state);
        let captured = state.clone();
        Task::build(
            Some(Box::new(move || {
                let state = captured
                    .downcast_ref::<S>()
                    .expect("async state type changed underneath the body");
                body(state)
            })),
            Some(state),
            CancellationToken::none(),
            CreationOptions::NONE,
            false,
            None,
        )
    }

    /// Creates a task with creation options.
    pub fn new_with(
        body: impl FnOnce() -> T + Send + 'static,
        options: CreationOptions,
    ) -> Task<T> {
        Task::new_with_all(body, None, CancellationToken::none(), options)
    }

    /// Creates a task bound to a cancellation token. If the token is
    /// requested before the task starts, the task completes as canceled and
    /// is never scheduled.
    pub fn new_cancelable(
        body: impl FnOnce() -> T + Send + 'static,
        token: CancellationToken,
    ) -> Task<T> {
        Task::new_with_all(body, None, token, CreationOptions::NONE)
    }

    /// Creates a task, specifying everything.
    pub fn new_with_all(
        body: impl FnOnce() -> T + Send + 'static,
        state: Option<Arc<dyn Any + Send + Sync>>,
        token: CancellationToken,
        options: CreationOptions,
    ) -> Task<T> {
        Task::build(Some(Box::new(body)), state, token, options, false, None)
    }

    pub(crate) fn build(
        body: Option<Box<dyn FnOnce() -> T + Send>>,
        state: Option<Arc<dyn Any + Send + Sync>>,
        token: CancellationToken,
        options: CreationOptions,
        continuation: bool,
        scheduler: Option<SchedulerHandle>,
    ) -> Task<T> {
        let cell = Arc::new(Cell::new(body, state, options, continuation));
        let task = Task { cell };

        if let Some(scheduler) = scheduler {
            let _ = task.cell.header.set_scheduler(scheduler);
        }

        if options.contains(CreationOptions::ATTACHED_TO_PARENT) {
            current::with_current(|parent| {
                if let Some(parent) = parent {
                    let denies = parent
                        .header()
                        .state
                        .load()
                        .options()
                        .contains(CreationOptions::DENY_CHILD_ATTACH);
                    if !denies {
                        task.cell.header.set_parent(parent.downgrade());
                        parent.header().add_child();
                    }
                }
            });
        }

        if token.can_be_canceled() {
            task.cell.header.set_cancellation_token(token.clone());
            if token.is_requested() {
                task.any()
                    .cancel_unreached(Some(OperationCanceled::new(token)));
            } else {
                let target = task.any();
                let registration = token.register(move || target.internal_cancel(false));
                task.cell.header.store_registration(registration);
            }
        }

        task
    }

    pub(crate) fn from_cell(cell: Arc<Cell<T>>) -> Task<T> {
        Task { cell }
    }

    pub(crate) fn any(&self) -> AnyTask {
        let cell: Arc<dyn AnyCell> = self.cell.clone();
        AnyTask(cell)
    }

    pub(crate) fn cell(&self) -> &Cell<T> {
        &self.cell
    }

    // ===== starting =====

    /// Starts the task on the ambient scheduler (the current task's
    /// scheduler, or the default pool).
    pub fn start(&self) -> Result<(), StartError> {
        self.start_on(&scheduler::ambient())
    }

    /// Starts the task on `scheduler`. Fails without mutating the task if
    /// the task is a promise or continuation, already completed, or already
    /// has a scheduler.
    pub fn start_on(&self, scheduler: &SchedulerHandle) -> Result<(), StartError> {
        let header = &self.cell.header;
        self.check_startable()?;

        header
            .set_scheduler(scheduler.clone())
            .map_err(|_| StartError::AlreadyStarted)?;

        if header.state.mark_started().is_err() {
            // A cancellation callback fired between construction and start;
            // the task is completing as canceled. Exit quietly.
            return Ok(());
        }

        self.queue_to(scheduler)
    }

    /// Runs the task on the calling thread via the ambient scheduler,
    /// falling back to queueing plus a blocking wait if the scheduler
    /// declines to inline.
    pub fn run_synchronously(&self) -> Result<(), StartError> {
        self.run_synchronously_on(&scheduler::ambient())
    }

    /// Like [`Task::run_synchronously`], on a specific scheduler.
    pub fn run_synchronously_on(&self, scheduler: &SchedulerHandle) -> Result<(), StartError> {
        let header = &self.cell.header;
        self.check_startable()?;

        header
            .set_scheduler(scheduler.clone())
            .map_err(|_| StartError::AlreadyStarted)?;

        if header.state.mark_started().is_err() {
            wait::block_until_completed(&self.any());
            return Ok(());
        }

        let queued = QueuedTask::new(self.any());
        if !scheduler.try_inline(&queued, false) {
            self.queue_to(scheduler)?;
        }

        if !self.is_completed() {
            wait::block_until_completed(&self.any());
        }
        Ok(())
    }

    fn check_startable(&self) -> Result<(), StartError> {
        let snap = self.cell.header.state.load();
        if snap.is_promise() {
            return Err(StartError::Promise);
        }
        if snap.is_continuation() {
            return Err(StartError::Continuation);
        }
        if snap.is_completed() {
            return Err(StartError::Completed);
        }
        if snap.is_started() {
            return Err(StartError::AlreadyStarted);
        }
        Ok(())
    }

    fn queue_to(&self, scheduler: &SchedulerHandle) -> Result<(), StartError> {
        let options = self.cell.header.state.load().options();
        let hint = SpawnHint::new(
            options.contains(CreationOptions::PREFER_FAIRNESS),
            options.contains(CreationOptions::LONG_RUNNING),
        );
        match scheduler.queue(QueuedTask::new(self.any()), hint) {
            Ok(()) => Ok(()),
            Err(err) => {
                // The scheduler's failure becomes the task's failure.
                self.cell
                    .header
                    .with_holder(|h| h.add_failure(error::Failure::Scheduler(err.clone())));
                self.any().finish(false);
                Err(StartError::Queue(err))
            }
        }
    }

    // ===== waiting =====

    /// Blocks until the task completes. Faults and cancellation surface as
    /// the error.
    pub fn wait(&self) -> Result<(), WaitError> {
        wait::wait_core(&self.any(), None, None).map(|_| ())
    }

    /// Blocks until the task completes or `timeout` elapses. `Ok(false)`
    /// means the timeout elapsed first; a zero timeout polls without
    /// blocking.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, WaitError> {
        wait::wait_core(&self.any(), Some(timeout), None)
    }

    /// Blocks until the task completes or `token` is canceled. A wait
    /// interrupted by its own token fails with
    /// [`WaitError::Canceled`].
    pub fn wait_cancelable(&self, token: &CancellationToken) -> Result<(), WaitError> {
        wait::wait_core(&self.any(), None, Some(token)).map(|_| ())
    }

    /// Bounded, cancelable wait.
    pub fn wait_timeout_cancelable(
        &self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<bool, WaitError> {
        wait::wait_core(&self.any(), Some(timeout), Some(token))
    }

    // ===== results =====

    /// Blocks until the task completes and returns its value.
    pub fn result(&self) -> Result<T, WaitError>
    where
        T: Clone,
    {
        self.wait()?;
        Ok(self
            .cell
            .clone_value()
            .expect("completed task has no value"))
    }

    /// The value, if the task already ran to completion.
    pub fn try_result(&self) -> Option<T>
    where
        T: Clone,
    {
        if self.cell.header.state.load().is_ran_to_completion() {
            self.cell.clone_value()
        } else {
            None
        }
    }

    // ===== continuations =====

    /// Registers a continuation to run when this task completes. The
    /// returned task completes when the continuation does.
    pub fn continue_with<U>(
        &self,
        f: impl FnOnce(&Task<T>) -> U + Send + 'static,
    ) -> Task<U>
    where
        U: Send + 'static,
    {
        self.continue_with_opts(f, CancellationToken::none(), ContinueOptions::NONE, None)
    }

    /// Registers a continuation with a token, options, and scheduler.
    ///
    /// The gating predicates in `options` decide whether the continuation
    /// runs or is canceled once the antecedent completes; `EXECUTE_SYNCHRONOUSLY`
    /// prefers the completer's thread; the token cancels the continuation
    /// before it runs (immediately, or at antecedent completion under
    /// `LAZY_CANCELLATION`).
    pub fn continue_with_opts<U>(
        &self,
        f: impl FnOnce(&Task<T>) -> U + Send + 'static,
        token: CancellationToken,
        options: ContinueOptions,
        scheduler: Option<&SchedulerHandle>,
    ) -> Task<U>
    where
        U: Send + 'static,
    {
        let antecedent = self.clone();
        let scheduler = scheduler
            .cloned()
            .unwrap_or_else(scheduler::ambient);

        let continuation: Task<U> = Task::build(
            Some(Box::new(move || f(&antecedent))),
            None,
            CancellationToken::none(),
            options.creation(),
            true,
            Some(scheduler),
        );

        let lazy = options.contains(ContinueOptions::LAZY_CANCELLATION);
        if token.can_be_canceled() {
            continuation.cell.header.set_cancellation_token(token.clone());
            if !lazy && token.is_requested() {
                continuation
                    .any()
                    .cancel_unreached(Some(OperationCanceled::new(token.clone())));
            }
        }

        let entry = Entry::new(Continuation::Spawn(SpawnContinuation {
            task: continuation.any(),
            options,
        }));

        match self.cell.header.continuations.add(entry, false) {
            Register::Added(id) => {
                if token.can_be_canceled() && !lazy && !continuation.is_completed() {
                    let target = continuation.any();
                    let antecedent = self.any();
                    let registration = token.register(move || {
                        target.internal_cancel(false);
                        antecedent.header().continuations.remove(id);
                    });
                    continuation.cell.header.store_registration(registration);
                }
            }
            Register::NotQueued(entry) => {
                // Lost the race with completion: the registering thread runs
                // the continuation itself.
                continuations::run_inline(&self.any(), entry.continuation);
            }
        }

        continuation
    }

    // ===== lifecycle odds and ends =====

    /// Releases the completion event. Only legal once the task has reached a
    /// terminal state.
    pub fn dispose(&self) -> Result<(), DisposeError> {
        self.any().dispose()
    }

    // ===== accessors =====

    /// The task's id: non-zero, unique within the process run, assigned on
    /// first observation.
    pub fn id(&self) -> u32 {
        self.cell.header.id()
    }

    /// The current lifecycle state.
    pub fn status(&self) -> Status {
        self.cell.header.state.load().status()
    }

    /// True once the task has reached any terminal state.
    pub fn is_completed(&self) -> bool {
        self.cell.header.state.load().is_completed()
    }

    /// True if the task terminated with captured failures.
    pub fn is_faulted(&self) -> bool {
        self.cell.header.state.load().is_faulted()
    }

    /// True if the task terminated as canceled.
    pub fn is_canceled(&self) -> bool {
        self.cell.header.state.load().is_canceled()
    }

    /// The captured failures of a faulted task, marked observed.
    pub fn exception(&self) -> Option<AggregateError> {
        if self.is_faulted() {
            Some(self.cell.header.aggregate(true))
        } else {
            None
        }
    }

    /// The options the task was created with.
    pub fn creation_options(&self) -> CreationOptions {
        self.cell.header.state.load().options()
    }

    /// The state object passed at construction, if any.
    pub fn async_state(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.cell.async_state.clone()
    }
}

impl Task<()> {
    /// An already-completed task. Cached; clones are cheap.
    pub fn completed() -> Task<()> {
        lazy_static! {
            static ref COMPLETED: Task<()> = Task::from_result(());
        }
        COMPLETED.clone()
    }
}

/// The id of the task running on the current thread, if any.
pub fn current_id() -> Option<u32> {
    current::with_current(|current| current.map(|task| task.header().id()))
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Task")
            .field("id", &self.cell.header.id())
            .field("state", &self.cell.header.state)
            .finish()
    }
}
