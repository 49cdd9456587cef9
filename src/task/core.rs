//! The task cell: header, contingent properties, and the lifecycle
//! protocol (execute, finish stages, cancellation cleanup).

use crate::cancel::{CancellationToken, Registration};
use crate::park::Event;
use crate::scheduler::SchedulerHandle;
use crate::task::continuations::Continuations;
use crate::task::current;
use crate::task::error::{AggregateError, Failure, OperationCanceled};
use crate::task::exceptions::ExceptionHolder;
use crate::task::id::IdSlot;
use crate::task::options::CreationOptions;
use crate::task::state::{self, State};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::{AcqRel, Relaxed};
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// The untyped face of a task cell. Everything the runtime does to a task
/// that does not involve its value type goes through here.
pub(crate) trait AnyCell: Send + Sync + 'static {
    fn header(&self) -> &Header;

    /// Takes the body out of the stage and runs it, recording the value or
    /// classifying the panic. Exactly-once is the caller's responsibility.
    fn invoke_body(&self);

    /// Drops the body (and its captured state) if it never ran. A stored
    /// value is kept.
    fn release_body(&self);
}

/// A cloneable type-erased task handle.
#[derive(Clone)]
pub(crate) struct AnyTask(pub(crate) Arc<dyn AnyCell>);

/// Per-task state that exists on every task, however plain.
pub(crate) struct Header {
    pub(crate) state: State,
    id: IdSlot,
    pub(crate) continuations: Continuations,
    scheduler: OnceLock<SchedulerHandle>,
    parent: Mutex<Option<Weak<dyn AnyCell>>>,
    props: OnceLock<Box<ContingentProperties>>,
}

/// Lazily-allocated auxiliary state, materialized only when a task acquires
/// non-default behavior: a cancelable token, attached children, waiters, or
/// failures. Published via `OnceLock`; a lost allocation race is discarded.
pub(crate) struct ContingentProperties {
    event: Mutex<Option<Arc<Event>>>,
    holder: Mutex<Option<ExceptionHolder>>,
    token: Mutex<CancellationToken>,
    registration: Mutex<Option<Registration>>,
    internal_canceled: std::sync::atomic::AtomicBool,
    /// One for the task itself, plus one per attached child. The last
    /// decrement triggers finish stage two.
    countdown: AtomicU32,
    exceptional_children: Mutex<Vec<AnyTask>>,
}

impl ContingentProperties {
    fn new() -> ContingentProperties {
        ContingentProperties {
            event: Mutex::new(None),
            holder: Mutex::new(None),
            token: Mutex::new(CancellationToken::none()),
            registration: Mutex::new(None),
            internal_canceled: std::sync::atomic::AtomicBool::new(false),
            countdown: AtomicU32::new(1),
            exceptional_children: Mutex::new(Vec::new()),
        }
    }

    /// Decrements the completion countdown; `true` means it hit zero.
    fn signal(&self) -> bool {
        self.countdown.fetch_sub(1, AcqRel) == 1
    }
}

impl Header {
    pub(crate) fn new(options: CreationOptions, promise: bool, continuation: bool) -> Header {
        Header {
            state: State::new(options, promise, continuation),
            id: IdSlot::new(),
            continuations: Continuations::new(),
            scheduler: OnceLock::new(),
            parent: Mutex::new(None),
            props: OnceLock::new(),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id.get()
    }

    pub(crate) fn scheduler(&self) -> Option<SchedulerHandle> {
        self.scheduler.get().cloned()
    }

    /// Fills the scheduler slot. Fails if it was already filled; once
    /// non-null the slot never changes.
    pub(crate) fn set_scheduler(&self, scheduler: SchedulerHandle) -> Result<(), ()> {
        self.scheduler.set(scheduler).map_err(|_| ())
    }

    pub(crate) fn hides_scheduler(&self) -> bool {
        self.state
            .load()
            .options()
            .contains(CreationOptions::HIDE_SCHEDULER)
    }

    fn props_opt(&self) -> Option<&ContingentProperties> {
        self.props.get().map(|b| &**b)
    }

    pub(crate) fn ensure_props(&self) -> &ContingentProperties {
        self.props.get_or_init(|| Box::new(ContingentProperties::new()))
    }

    // ===== cancellation plumbing =====

    pub(crate) fn set_cancellation_token(&self, token: CancellationToken) {
        *self.ensure_props().token.lock().unwrap() = token;
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        match self.props_opt() {
            Some(props) => props.token.lock().unwrap().clone(),
            None => CancellationToken::none(),
        }
    }

    pub(crate) fn store_registration(&self, registration: Registration) {
        *self.ensure_props().registration.lock().unwrap() = Some(registration);
    }

    pub(crate) fn deregister_cancellation(&self) {
        if let Some(props) = self.props_opt() {
            drop(props.registration.lock().unwrap().take());
        }
    }

    pub(crate) fn record_internal_cancellation(&self) {
        self.ensure_props()
            .internal_canceled
            .store(true, Relaxed);
    }

    /// True if the task should observe cancellation before running its body.
    pub(crate) fn cancellation_requested(&self) -> bool {
        match self.props_opt() {
            Some(props) => {
                props.internal_canceled.load(Relaxed)
                    || props.token.lock().unwrap().is_requested()
            }
            None => false,
        }
    }

    /// The cancellation signal this task completed (or will complete) with.
    pub(crate) fn cancellation_signal(&self) -> OperationCanceled {
        let token = self.cancellation_token();
        if token.can_be_canceled() {
            OperationCanceled::new(token)
        } else {
            OperationCanceled::untokened()
        }
    }

    // ===== exception holder =====

    pub(crate) fn with_holder<R>(&self, f: impl FnOnce(&mut ExceptionHolder) -> R) -> R {
        let props = self.ensure_props();
        let mut slot = props.holder.lock().unwrap();
        f(slot.get_or_insert_with(ExceptionHolder::new))
    }

    fn try_with_holder<R>(&self, f: impl FnOnce(&mut ExceptionHolder) -> R) -> Option<R> {
        let props = self.props_opt()?;
        let mut slot = props.holder.lock().unwrap();
        slot.as_mut().map(f)
    }

    /// True if a recorded failure forces the faulted terminal state.
    fn holder_is_faulting(&self) -> bool {
        self.try_with_holder(|h| h.is_faulting()).unwrap_or(false)
    }

    fn holder_has_cancellation(&self) -> bool {
        self.try_with_holder(|h| h.cancellation().is_some())
            .unwrap_or(false)
    }

    /// Snapshots this task's failures for a consumer, optionally marking
    /// them observed. A canceled task with no recorded signal synthesizes
    /// one from its token.
    pub(crate) fn collect_failures(&self, observe: bool) -> Vec<Failure> {
        let recorded = self
            .try_with_holder(|h| if observe { h.observe() } else { h.peek() })
            .unwrap_or_default();
        if recorded.is_empty() && self.state.load().is_canceled() {
            vec![Failure::Canceled(self.cancellation_signal())]
        } else {
            recorded
        }
    }

    pub(crate) fn aggregate(&self, observe: bool) -> AggregateError {
        AggregateError::new(self.collect_failures(observe))
    }

    pub(crate) fn mark_holder_observed(&self) {
        self.try_with_holder(|h| h.mark_observed());
    }

    // ===== completion event =====

    /// Materializes the completion event. The caller re-checks completion
    /// after this returns: the completer only signals an event that already
    /// exists.
    pub(crate) fn completion_event(&self) -> Arc<Event> {
        let props = self.ensure_props();
        let event = {
            let mut slot = props.event.lock().unwrap();
            slot.get_or_insert_with(|| Arc::new(Event::new())).clone()
        };
        if self.state.load().is_completed() {
            event.set();
        }
        event
    }

    pub(crate) fn signal_completion_event(&self) {
        if let Some(props) = self.props_opt() {
            if let Some(event) = &*props.event.lock().unwrap() {
                event.set();
            }
        }
    }

    fn release_completion_event(&self) {
        if let Some(props) = self.props_opt() {
            props.event.lock().unwrap().take();
        }
    }

    // ===== parent/child =====

    pub(crate) fn set_parent(&self, parent: Weak<dyn AnyCell>) {
        *self.parent.lock().unwrap() = Some(parent);
    }

    /// The parent, if attached and still alive. Kept after completion so an
    /// explicit wait by the parent can mark this task's failure observed;
    /// the reference is weak, so no lifetime cycle forms.
    pub(crate) fn parent_task(&self) -> Option<AnyTask> {
        self.parent
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(AnyTask)
    }

    /// Accounts for a newly attached child.
    pub(crate) fn add_child(&self) {
        self.ensure_props().countdown.fetch_add(1, AcqRel);
    }

    pub(crate) fn push_exceptional_child(&self, child: AnyTask) {
        self.ensure_props()
            .exceptional_children
            .lock()
            .unwrap()
            .push(child);
    }

    /// A child finished; `true` means this task was the last thing standing
    /// and must run finish stage two.
    pub(crate) fn signal_child_completed(&self) -> bool {
        match self.props_opt() {
            Some(props) => props.signal(),
            None => false,
        }
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Header")
            .field("state", &self.state)
            .finish()
    }
}

/// What the typed half of a cell holds, over time.
pub(crate) enum Stage<T> {
    /// The body has not run.
    Pending(Box<dyn FnOnce() -> T + Send>),
    /// The body is running (or panicked; the panic lives in the holder).
    Running,
    /// The body (or an external `try_set_result`) produced the value.
    Finished(T),
    /// The body was dropped without producing a value.
    Released,
}

/// A task cell: the header plus the typed stage.
pub(crate) struct Cell<T> {
    pub(crate) header: Header,
    pub(crate) stage: Mutex<Stage<T>>,
    pub(crate) async_state: Option<Arc<dyn Any + Send + Sync>>,
    /// Captured at construction; the body runs inside it. This is the
    /// execution-context flow of the runtime: whatever tracing context the
    /// constructing thread had follows the task onto whichever thread runs
    /// it.
    pub(crate) span: tracing::Span,
}

impl<T: Send + 'static> Cell<T> {
    pub(crate) fn new(
        body: Option<Box<dyn FnOnce() -> T + Send>>,
        async_state: Option<Arc<dyn Any + Send + Sync>>,
        options: CreationOptions,
        continuation: bool,
    ) -> Cell<T> {
        let promise = body.is_none();
        let stage = match body {
            Some(body) => Stage::Pending(body),
            None => Stage::Running,
        };
        Cell {
            header: Header::new(options, promise, continuation),
            stage: Mutex::new(stage),
            async_state,
            span: tracing::Span::current(),
        }
    }

    pub(crate) fn clone_value(&self) -> Option<T>
    where
        T: Clone,
    {
        match &*self.stage.lock().unwrap() {
            Stage::Finished(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub(crate) fn has_body(&self) -> bool {
        matches!(&*self.stage.lock().unwrap(), Stage::Pending(_))
    }
}

impl<T: Send + 'static> AnyCell for Cell<T> {
    fn header(&self) -> &Header {
        &self.header
    }

    fn invoke_body(&self) {
        let body = {
            let mut stage = self.stage.lock().unwrap();
            match std::mem::replace(&mut *stage, Stage::Running) {
                Stage::Pending(body) => body,
                other => {
                    *stage = other;
                    return;
                }
            }
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _entered = self.span.enter();
            body()
        }));

        match result {
            Ok(value) => {
                *self.stage.lock().unwrap() = Stage::Finished(value);
            }
            Err(payload) => self.classify_panic(payload),
        }
    }

    fn release_body(&self) {
        let mut stage = self.stage.lock().unwrap();
        if matches!(&*stage, Stage::Pending(_) | Stage::Running) {
            *stage = Stage::Released;
        }
    }
}

impl<T: Send + 'static> Cell<T> {
    /// Classifies a panic that unwound out of the body: an
    /// `OperationCanceled` payload carrying this task's requested token is
    /// an acknowledged cancellation; anything else is a fault.
    fn classify_panic(&self, payload: Box<dyn Any + Send + 'static>) {
        if let Some(oc) = payload.downcast_ref::<OperationCanceled>() {
            let own = self.header.cancellation_token();
            if own.can_be_canceled() && own.same_source(oc.token()) && own.is_requested() {
                self.header
                    .state
                    .set_flag(state::CANCELLATION_ACKNOWLEDGED);
                let oc = oc.clone();
                self.header.with_holder(|h| h.set_cancellation(oc));
                return;
            }
            let oc = oc.clone();
            self.header
                .with_holder(|h| h.add_failure(Failure::Canceled(oc)));
            return;
        }
        self.header.with_holder(|h| h.add_panic(payload));
    }
}

// ===== the lifecycle protocol =====

impl AnyTask {
    pub(crate) fn header(&self) -> &Header {
        self.0.header()
    }

    pub(crate) fn ptr_eq(&self, other: &AnyTask) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn downgrade(&self) -> Weak<dyn AnyCell> {
        Arc::downgrade(&self.0)
    }

    /// The strict execution entry, for external schedulers: a second call on
    /// a task that was not canceled is a scheduler contract violation.
    pub(crate) fn run(&self) {
        if !self.run_tolerant() && !self.header().state.load().is_canceled() {
            panic!(
                "task {} handed to the execution entry more than once",
                self.header().id()
            );
        }
    }

    /// The tolerant execution entry: claims the invocation atomically and
    /// returns `false` if another path (an inline execution, a canceler)
    /// claimed it first. The default pool runs queued tasks through here,
    /// which is what makes inlining a still-queued task safe.
    pub(crate) fn run_tolerant(&self) -> bool {
        let header = self.header();

        if header.state.mark_invoked().is_err() {
            return false;
        }

        if header.state.load().is_canceled() {
            // A canceler won the completion race while the task was queued;
            // nothing left to do here.
            return true;
        }

        if header.cancellation_requested() {
            // Canceled between queueing and execution: observe it without
            // running the body.
            let signal = header.cancellation_signal();
            header.with_holder(|h| h.set_cancellation(signal));
            self.finish(false);
            return true;
        }

        {
            let _current = current::enter(self.clone());
            self.0.invoke_body();
        }

        self.finish(true);
        true
    }

    /// Finish stage one: wait out attached children, then move on.
    pub(crate) fn finish(&self, body_ran: bool) {
        if !body_ran {
            self.finish_stage_two();
            return;
        }

        let header = self.header();
        match header.props_opt() {
            None => self.finish_stage_two(),
            Some(props) => {
                if props.signal() {
                    self.finish_stage_two();
                } else {
                    // The last child to complete triggers stage two from its
                    // own thread.
                    header.state.mark_waiting_on_children();
                }
            }
        }
    }

    /// Finish stage two: adopt exceptional children, publish the terminal
    /// bit, wake waiters, detach from the token.
    pub(crate) fn finish_stage_two(&self) {
        let header = self.header();

        self.adopt_exceptional_children();

        let terminal = if header.holder_is_faulting() {
            state::FAULTED
        } else if header.holder_has_cancellation() {
            state::CANCELED
        } else {
            state::RAN_TO_COMPLETION
        };

        if !header.state.transition_to_complete(terminal) {
            // A cancellation callback completed the task before its body
            // ever ran; that path owns the cleanup.
            return;
        }
        tracing::trace!(
            id = header.id(),
            status = ?header.state.load().status(),
            "task completed"
        );

        header.signal_completion_event();
        header.deregister_cancellation();

        self.finish_stage_three();
    }

    /// Finish stage three: release the body, notify the parent, drain
    /// continuations.
    fn finish_stage_three(&self) {
        self.0.release_body();

        let header = self.header();
        if let Some(parent) = header.parent_task() {
            let snap = header.state.load();
            if (snap.is_faulted() || snap.is_canceled())
                && !snap.is_exception_observed_by_parent()
            {
                parent.header().push_exceptional_child(self.clone());
            }
            if parent.header().signal_child_completed() {
                parent.finish_stage_two();
            }
        }

        crate::task::continuations::drain(self);
    }

    /// Pulls the failures of every exceptional child into this task's
    /// holder, unless the child's failure was already observed by an
    /// explicit wait in this task's body.
    fn adopt_exceptional_children(&self) {
        let header = self.header();
        let children = match header.props_opt() {
            Some(props) => std::mem::take(&mut *props.exceptional_children.lock().unwrap()),
            None => return,
        };

        for child in children {
            let child_header = child.header();
            if child_header.state.load().is_exception_observed_by_parent() {
                child_header.mark_holder_observed();
                continue;
            }
            for failure in child_header.collect_failures(true) {
                header.with_holder(|h| h.add_failure(failure));
            }
        }
    }

    /// Sideways cancellation, from a token callback or the runtime itself.
    ///
    /// Tries to pull the task out of its scheduler's queue; if that works
    /// (or the task never started, or the scheduler asked for atomic start
    /// transitions) the canceler races the execution entry for the right to
    /// complete the task. Losing the race means the task is running and must
    /// observe cancellation itself.
    pub(crate) fn internal_cancel(&self, dequeue_only: bool) {
        let header = self.header();
        let snap = header.state.load();
        if snap.is_completed() {
            return;
        }

        let mut popped = false;
        if snap.is_started() {
            if let Some(scheduler) = header.scheduler() {
                popped = scheduler.try_dequeue(&crate::scheduler::QueuedTask::new(self.clone()));
            }
        }

        header.record_internal_cancellation();

        let requires_atomic = header
            .scheduler()
            .map(|s| s.requires_atomic_start())
            .unwrap_or(false);

        if !dequeue_only || popped || requires_atomic {
            let won = header
                .state
                .atomic_update(
                    state::CANCELED,
                    state::DELEGATE_INVOKED
                        | state::COMPLETION_RESERVED
                        | state::COMPLETED_MASK,
                )
                .is_ok();
            if won {
                let signal = header.cancellation_signal();
                header.with_holder(|h| h.set_cancellation(signal));
                self.cancellation_cleanup();
            }
        }
    }

    /// Completes a continuation task that will never run: its gating
    /// predicate excluded it, or its token fired first.
    pub(crate) fn cancel_unreached(&self, oc: Option<OperationCanceled>) {
        let header = self.header();
        let won = header
            .state
            .atomic_update(
                state::CANCELED,
                state::DELEGATE_INVOKED | state::COMPLETION_RESERVED | state::COMPLETED_MASK,
            )
            .is_ok();
        if !won {
            return;
        }
        let signal = oc.unwrap_or_else(|| header.cancellation_signal());
        header.with_holder(|h| h.set_cancellation(signal));
        self.cancellation_cleanup();
    }

    fn cancellation_cleanup(&self) {
        let header = self.header();
        tracing::trace!(id = header.id(), "task canceled");
        header.signal_completion_event();
        header.deregister_cancellation();
        self.finish_stage_three();
    }

    /// Publishes a terminal bit chosen by an external completer (promise
    /// `try_set_*`), after the completion reservation was won.
    pub(crate) fn promise_complete(&self, terminal: u32) {
        let header = self.header();
        // The completion reservation keeps every other completer out.
        let published = header.state.transition_to_complete(terminal);
        debug_assert!(published);
        tracing::trace!(
            id = header.id(),
            status = ?header.state.load().status(),
            "promise completed"
        );
        header.signal_completion_event();
        header.deregister_cancellation();
        self.finish_stage_three();
    }

    /// Marks this task's failure as observed by its parent if the waiting
    /// task is, in fact, the parent.
    pub(crate) fn update_exception_observed_status(&self) {
        let header = self.header();
        let snap = header.state.load();
        if !(snap.is_faulted() || snap.is_canceled()) {
            return;
        }
        let Some(parent) = header.parent_task() else {
            return;
        };
        current::with_current(|current| {
            if let Some(current) = current {
                if current.ptr_eq(&parent) {
                    header
                        .state
                        .set_flag(state::EXCEPTION_OBSERVED_BY_PARENT);
                }
            }
        });
    }

    /// `dispose`: only legal in a terminal state; releases the completion
    /// event. Idempotent.
    pub(crate) fn dispose(&self) -> Result<(), crate::task::error::DisposeError> {
        let header = self.header();
        let snap = header.state.load();
        if snap.is_disposed() {
            return Ok(());
        }
        if !snap.is_completed() {
            return Err(crate::task::error::DisposeError(()));
        }
        header.release_completion_event();
        header.state.set_flag(state::DISPOSED);
        Ok(())
    }
}

impl std::fmt::Debug for AnyTask {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("AnyTask")
            .field("id", &self.header().id())
            .field("state", &self.header().state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compute_cell() -> Arc<Cell<u32>> {
        Arc::new(Cell::new(
            Some(Box::new(|| 5)),
            None,
            CreationOptions::NONE,
            false,
        ))
    }

    #[test]
    fn body_is_held_until_invoked() {
        let cell = compute_cell();
        assert!(cell.has_body());
        cell.invoke_body();
        assert!(!cell.has_body());
        assert_eq!(cell.clone_value(), Some(5));
    }

    #[test]
    fn release_drops_an_unrun_body() {
        let cell = compute_cell();
        cell.release_body();
        assert!(!cell.has_body());
        assert_eq!(cell.clone_value(), None);
    }

    #[test]
    fn release_keeps_a_finished_value() {
        let cell = compute_cell();
        cell.invoke_body();
        cell.release_body();
        assert_eq!(cell.clone_value(), Some(5));
    }

    #[test]
    fn promise_cells_carry_no_body() {
        let cell: Cell<u32> = Cell::new(None, None, CreationOptions::NONE, false);
        assert!(!cell.has_body());
        assert!(cell.header.state.load().is_promise());
    }

    #[test]
    fn a_panicking_body_records_a_fault() {
        let cell: Arc<Cell<u32>> = Arc::new(Cell::new(
            Some(Box::new(|| panic!("unit boom"))),
            None,
            CreationOptions::NONE,
            false,
        ));
        cell.invoke_body();
        assert!(cell.header.aggregate(true).failures().len() == 1);
        assert_eq!(cell.clone_value(), None);
    }
}
