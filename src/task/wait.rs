//! Blocking waits: single-task spin-then-block, `wait_all`, `wait_any`.

use crate::cancel::CancellationToken;
use crate::park::Event;
use crate::scheduler::QueuedTask;
use crate::task::continuations::{CompleteAction, Continuation, Entry, Register};
use crate::task::core::AnyTask;
use crate::task::error::{AggregateError, Failure, OperationCanceled, WaitError};
use crate::task::Task;

use crossbeam_utils::Backoff;

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The single-task wait.
///
/// `Ok(true)` means the task completed without failures; `Ok(false)` means
/// the timeout elapsed first. A completed task's failures surface as
/// `WaitError::Faulted`, unless the task was canceled by the very token
/// this wait was given, which surfaces as `WaitError::Canceled`, as does the
/// token firing while the task is still running.
pub(crate) fn wait_core(
    task: &AnyTask,
    timeout: Option<Duration>,
    token: Option<&CancellationToken>,
) -> Result<bool, WaitError> {
    let header = task.header();
    let token = token.filter(|t| t.can_be_canceled());

    if header.state.load().is_completed() {
        return after_wait(task, token);
    }

    // An infinite, token-free wait may as well lend the task this thread.
    if timeout.is_none() && token.is_none() {
        try_inline(task);
        if header.state.load().is_completed() {
            return after_wait(task, token);
        }
    }

    if timeout == Some(Duration::ZERO) {
        // Poll-once never blocks.
        return Ok(false);
    }

    spin_briefly(task);
    if header.state.load().is_completed() {
        return after_wait(task, token);
    }

    let deadline = timeout.map(|t| Instant::now() + t);

    match token {
        None => {
            // The shared, lazily-materialized completion event. Creation
            // re-checks completion, closing the race with a completer that
            // signaled before the event existed.
            let event = header.completion_event();
            loop {
                let remaining = match deadline {
                    None => None,
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Ok(false);
                        }
                        Some(deadline - now)
                    }
                };
                event.wait(remaining);
                if header.state.load().is_completed() {
                    return after_wait(task, token);
                }
            }
        }
        Some(token) => {
            // A private event, registered ahead of user continuations and
            // also wired to the token, so either completion or cancellation
            // wakes exactly this waiter.
            let event = Arc::new(Event::new());
            let entry = Entry::new(Continuation::Event(event.clone()));
            let entry_id = match header.continuations.add(entry, true) {
                Register::Added(id) => id,
                Register::NotQueued(_) => return after_wait(task, Some(token)),
            };

            let wake = event.clone();
            let registration = token.register(move || wake.set());

            let result = loop {
                let remaining = match deadline {
                    None => None,
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break Ok(false);
                        }
                        Some(deadline - now)
                    }
                };
                event.wait(remaining);
                if header.state.load().is_completed() {
                    break after_wait(task, Some(token));
                }
                if token.is_requested() {
                    break Err(WaitError::Canceled(OperationCanceled::new(token.clone())));
                }
            };

            header.continuations.remove(entry_id);
            drop(registration);
            result
        }
    }
}

/// Blocks until the task completes, surfacing nothing. Used by
/// `run_synchronously`, which leaves failure observation to the caller's
/// later wait.
pub(crate) fn block_until_completed(task: &AnyTask) {
    let header = task.header();
    spin_briefly(task);
    let event = header.completion_event();
    while !header.state.load().is_completed() {
        event.wait(None);
    }
}

fn try_inline(task: &AnyTask) {
    let header = task.header();
    let snap = header.state.load();
    if snap.is_started() && !snap.is_invoked() {
        if let Some(scheduler) = header.scheduler() {
            scheduler.try_inline(&QueuedTask::new(task.clone()), true);
        }
    }
}

/// A bounded spin before blocking; a single-processor host yields once and
/// moves on.
fn spin_briefly(task: &AnyTask) {
    let header = task.header();
    if num_cpus::get() == 1 {
        std::thread::yield_now();
        return;
    }
    let backoff = Backoff::new();
    while !backoff.is_completed() {
        if header.state.load().is_completed() {
            return;
        }
        backoff.snooze();
    }
}

fn after_wait(task: &AnyTask, wait_token: Option<&CancellationToken>) -> Result<bool, WaitError> {
    task.update_exception_observed_status();

    let header = task.header();
    let snap = header.state.load();

    if snap.is_faulted() {
        return Err(WaitError::Faulted(header.aggregate(true)));
    }

    if snap.is_canceled() {
        let oc = header
            .collect_failures(true)
            .into_iter()
            .find_map(|f| match f {
                Failure::Canceled(oc) => Some(oc),
                _ => None,
            })
            .unwrap_or_else(|| header.cancellation_signal());

        // Canceled by the very token this wait was given: the caller's own
        // cancellation wins over the aggregate.
        if let Some(wait_token) = wait_token {
            if oc.token().can_be_canceled() && oc.token().same_source(wait_token) {
                return Err(WaitError::Canceled(oc));
            }
        }
        return Err(WaitError::Faulted(AggregateError::new(vec![
            Failure::Canceled(oc),
        ])));
    }

    Ok(true)
}

// ===== multi-task waits =====

struct CountdownAction {
    remaining: AtomicUsize,
    event: Arc<Event>,
}

impl CompleteAction for CountdownAction {
    fn invoke(&self, _completed: &AnyTask) {
        if self.remaining.fetch_sub(1, SeqCst) == 1 {
            self.event.set();
        }
    }
}

/// Blocks until every task completes; collects every fault and cancellation
/// into one aggregate, in input order.
pub fn wait_all<T: Send + 'static>(tasks: &[Task<T>]) -> Result<(), AggregateError> {
    wait_all_timeout(tasks, None).map(|_| ())
}

/// Bounded `wait_all`. `Ok(false)` means the timeout elapsed before every
/// task completed; nothing is thrown for tasks that are still running.
pub fn wait_all_timeout<T: Send + 'static>(
    tasks: &[Task<T>],
    timeout: Option<Duration>,
) -> Result<bool, AggregateError> {
    let incomplete: Vec<&Task<T>> = tasks.iter().filter(|t| !t.is_completed()).collect();

    if !incomplete.is_empty() {
        // An unbounded wait lends this thread to whichever constituents the
        // scheduler will inline.
        if timeout.is_none() {
            for task in &incomplete {
                try_inline(&task.any());
            }
        }

        let pending: Vec<&Task<T>> = incomplete
            .iter()
            .copied()
            .filter(|t| !t.is_completed())
            .collect();

        if !pending.is_empty() {
            let action = Arc::new(CountdownAction {
                remaining: AtomicUsize::new(pending.len()),
                event: Arc::new(Event::new()),
            });

            for task in &pending {
                let entry = Entry::new(Continuation::Action(action.clone()));
                if let Register::NotQueued(_) =
                    task.cell().header.continuations.add(entry, true)
                {
                    action.invoke(&task.any());
                }
            }

            if !action.event.wait(timeout) {
                return Ok(false);
            }
        }
    }

    let mut failures = Vec::new();
    for task in tasks {
        let header = &task.cell().header;
        let snap = header.state.load();
        if snap.is_faulted() || snap.is_canceled() {
            failures.extend(header.collect_failures(true));
        }
    }

    if failures.is_empty() {
        Ok(true)
    } else {
        Err(AggregateError::new(failures))
    }
}

struct FirstDone {
    winner: AtomicUsize,
    event: Arc<Event>,
}

struct FirstDoneEntry {
    shared: Arc<FirstDone>,
    index: usize,
}

impl CompleteAction for FirstDoneEntry {
    fn invoke(&self, _completed: &AnyTask) {
        let _ = self.shared.winner.compare_exchange(
            usize::MAX,
            self.index,
            SeqCst,
            SeqCst,
        );
        self.shared.event.set();
    }
}

/// Blocks until any task completes and returns its index. Does not observe
/// or surface the completed task's failures.
pub fn wait_any<T: Send + 'static>(tasks: &[Task<T>]) -> usize {
    wait_any_timeout(tasks, None).expect("unbounded wait_any returned without a winner")
}

/// Bounded `wait_any`; `None` means no task completed in time.
pub fn wait_any_timeout<T: Send + 'static>(
    tasks: &[Task<T>],
    timeout: Option<Duration>,
) -> Option<usize> {
    assert!(!tasks.is_empty(), "wait_any requires at least one task");

    let shared = Arc::new(FirstDone {
        winner: AtomicUsize::new(usize::MAX),
        event: Arc::new(Event::new()),
    });

    for (index, task) in tasks.iter().enumerate() {
        if task.is_completed() {
            let _ = shared
                .winner
                .compare_exchange(usize::MAX, index, SeqCst, SeqCst);
            return Some(shared.winner.load(SeqCst));
        }
        let entry = Entry::new(Continuation::Action(Arc::new(FirstDoneEntry {
            shared: shared.clone(),
            index,
        })));
        if let Register::NotQueued(_) = task.cell().header.continuations.add(entry, true) {
            let _ = shared
                .winner
                .compare_exchange(usize::MAX, index, SeqCst, SeqCst);
            return Some(shared.winner.load(SeqCst));
        }
    }

    if !shared.event.wait(timeout) {
        return None;
    }
    match shared.winner.load(SeqCst) {
        usize::MAX => None,
        index => Some(index),
    }
}
