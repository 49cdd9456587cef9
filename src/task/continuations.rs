//! The continuation engine.
//!
//! Each task owns a single continuation store with a monotone progression:
//! empty, one entry, a list of entries, sealed. Sealing happens exactly once,
//! when the task completes; entries present at the seal are fired by the
//! completer, entries that arrive after it are reported back to the
//! registering thread, which must run them itself. Exactly one of the two
//! happens for every registration.

use crate::park::Event;
use crate::scheduler::{QueuedTask, SpawnHint};
use crate::task::core::AnyTask;
use crate::task::current;
use crate::task::error::Failure;
use crate::task::options::{ContinueOptions, CreationOptions};
use crate::task::state::Snapshot;

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// A trusted completion callback: runs on the completer's thread and must
/// not run arbitrary user code. Combinators and the wait subsystem use this.
pub(crate) trait CompleteAction: Send + Sync {
    fn invoke(&self, completed: &AnyTask);
}

/// A continuation task registered by `continue_with`, together with the
/// options that gate and place its execution.
#[derive(Clone)]
pub(crate) struct SpawnContinuation {
    pub(crate) task: AnyTask,
    pub(crate) options: ContinueOptions,
}

#[derive(Clone)]
pub(crate) enum Continuation {
    /// Wake a blocked waiter. Trusted, always inline.
    Event(Arc<Event>),
    /// Invoke a combinator callback. Trusted, always inline.
    Action(Arc<dyn CompleteAction>),
    /// Activate a continuation task. Runs arbitrary code: queued to its
    /// scheduler unless marked to execute synchronously.
    Spawn(SpawnContinuation),
}

pub(crate) struct Entry {
    id: u64,
    pub(crate) continuation: Continuation,
}

impl Entry {
    pub(crate) fn new(continuation: Continuation) -> Entry {
        Entry {
            id: NEXT_ENTRY_ID.fetch_add(1, Relaxed),
            continuation,
        }
    }
}

enum Store {
    Empty,
    Single(Entry),
    List(Vec<Option<Entry>>),
    Sealed,
}

/// Outcome of a registration attempt.
pub(crate) enum Register {
    /// The entry was installed; the completer will fire it.
    Added(u64),
    /// The task completed first. The caller owns the entry again and must
    /// run it directly.
    NotQueued(Entry),
}

pub(crate) struct Continuations {
    store: Mutex<Store>,
}

impl Continuations {
    pub(crate) fn new() -> Continuations {
        Continuations {
            store: Mutex::new(Store::Empty),
        }
    }

    /// Registers `entry`. `add_before` puts it ahead of existing entries
    /// (used by waiters, which must wake before user continuations run).
    pub(crate) fn add(&self, entry: Entry, add_before: bool) -> Register {
        let mut store = self.store.lock().unwrap();

        match &mut *store {
            Store::Sealed => Register::NotQueued(entry),
            Store::Empty => {
                let id = entry.id;
                *store = Store::Single(entry);
                Register::Added(id)
            }
            Store::Single(_) => {
                // Promote to a list, seeded with the existing single.
                let existing = match std::mem::replace(&mut *store, Store::Empty) {
                    Store::Single(existing) => existing,
                    _ => unreachable!(),
                };
                let id = entry.id;
                let list = if add_before {
                    vec![Some(entry), Some(existing)]
                } else {
                    vec![Some(existing), Some(entry)]
                };
                *store = Store::List(list);
                Register::Added(id)
            }
            Store::List(list) => {
                let id = entry.id;
                if add_before {
                    list.insert(0, Some(entry));
                } else {
                    list.push(Some(entry));
                }
                Register::Added(id)
            }
        }
    }

    /// Removes a registered entry. A list entry is nulled in place; a single
    /// becomes an empty list, so a store that has grown never shrinks back
    /// through empty. Returns `false` if the entry already fired or was
    /// never present.
    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut store = self.store.lock().unwrap();

        match &mut *store {
            Store::Empty | Store::Sealed => false,
            Store::Single(entry) => {
                if entry.id == id {
                    *store = Store::List(Vec::new());
                    true
                } else {
                    false
                }
            }
            Store::List(list) => {
                for slot in list.iter_mut() {
                    if slot.as_ref().map(|e| e.id) == Some(id) {
                        *slot = None;
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Seals the store, returning the entries to fire. Only the completing
    /// thread calls this, exactly once; a subsequent call returns nothing.
    fn seal(&self) -> Vec<Entry> {
        let mut store = self.store.lock().unwrap();

        match std::mem::replace(&mut *store, Store::Sealed) {
            Store::Empty | Store::Sealed => Vec::new(),
            Store::Single(entry) => vec![entry],
            Store::List(list) => list.into_iter().flatten().collect(),
        }
    }
}

impl std::fmt::Debug for Continuations {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.store.lock().unwrap();
        let state = match &*store {
            Store::Empty => "empty",
            Store::Single(_) => "single",
            Store::List(_) => "list",
            Store::Sealed => "sealed",
        };
        fmt.debug_struct("Continuations").field("store", &state).finish()
    }
}

/// Returns `true` if `options` allow the continuation to run given the
/// antecedent's terminal state.
pub(crate) fn gate_allows(options: ContinueOptions, antecedent: Snapshot) -> bool {
    if antecedent.is_ran_to_completion() {
        !options.contains(ContinueOptions::NOT_ON_RAN_TO_COMPLETION)
    } else if antecedent.is_faulted() {
        !options.contains(ContinueOptions::NOT_ON_FAULTED)
    } else {
        !options.contains(ContinueOptions::NOT_ON_CANCELED)
    }
}

/// Drains and fires the completed task's continuations.
///
/// Two passes: the first queues every continuation bound for a scheduler,
/// the second runs the synchronous ones on this thread. Waker events and
/// combinator callbacks are trusted and always run inline.
pub(crate) fn drain(completed: &AnyTask) {
    let entries = completed.header().continuations.seal();
    if entries.is_empty() {
        return;
    }

    let force_async = completed
        .header()
        .state
        .load()
        .options()
        .contains(CreationOptions::RUN_CONTINUATIONS_ASYNC);

    let mut inline = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.continuation {
            Continuation::Spawn(spawn)
                if force_async || !spawn.options.contains(ContinueOptions::EXECUTE_SYNCHRONOUSLY) =>
            {
                launch(completed, spawn, true);
            }
            other => inline.push(other),
        }
    }

    for continuation in inline {
        run_inline(completed, continuation);
    }
}

/// Runs a single continuation on the current thread. Used by the drain's
/// second pass and by registering threads that lost the completion race.
pub(crate) fn run_inline(completed: &AnyTask, continuation: Continuation) {
    match continuation {
        Continuation::Event(event) => event.set(),
        Continuation::Action(action) => action.invoke(completed),
        Continuation::Spawn(spawn) => {
            let sync = spawn.options.contains(ContinueOptions::EXECUTE_SYNCHRONOUSLY)
                && !completed
                    .header()
                    .state
                    .load()
                    .options()
                    .contains(CreationOptions::RUN_CONTINUATIONS_ASYNC);
            launch(completed, spawn, !sync);
        }
    }
}

/// Activates a continuation task: applies the gating predicates and the lazy
/// cancellation check, then either runs it here or hands it to its
/// scheduler.
fn launch(completed: &AnyTask, spawn: SpawnContinuation, queue: bool) {
    let antecedent = completed.header().state.load();

    if !gate_allows(spawn.options, antecedent) {
        spawn.task.cancel_unreached(None);
        return;
    }

    if spawn.options.contains(ContinueOptions::LAZY_CANCELLATION) {
        let token = spawn.task.header().cancellation_token();
        if token.is_requested() {
            spawn.task.cancel_unreached(None);
            return;
        }
    }

    // A cancellation callback may already have completed the task.
    if spawn.task.header().state.mark_started().is_err() {
        return;
    }

    if !queue {
        if let Some(_depth) = current::reserve_inline_depth() {
            // Tolerant entry: a waiter may have inlined the task already.
            spawn.task.run_tolerant();
            return;
        }
        // Inline budget exhausted; fall through to the scheduler.
    }

    let scheduler = spawn
        .task
        .header()
        .scheduler()
        .unwrap_or_else(crate::scheduler::default);
    let hint = SpawnHint::new(
        spawn.options.contains(ContinueOptions::PREFER_FAIRNESS),
        spawn.options.contains(ContinueOptions::LONG_RUNNING),
    );
    if let Err(err) = scheduler.queue(QueuedTask::new(spawn.task.clone()), hint) {
        spawn
            .task
            .header()
            .with_holder(|holder| holder.add_failure(Failure::Scheduler(err)));
        spawn.task.finish(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_entry() -> (Entry, Arc<Event>) {
        let event = Arc::new(Event::new());
        (Entry::new(Continuation::Event(event.clone())), event)
    }

    #[test]
    fn grows_single_to_list() {
        let conts = Continuations::new();
        let (a, _) = event_entry();
        let (b, _) = event_entry();
        assert!(matches!(conts.add(a, false), Register::Added(_)));
        assert!(matches!(conts.add(b, false), Register::Added(_)));
        assert_eq!(conts.seal().len(), 2);
    }

    #[test]
    fn add_before_puts_entry_first() {
        let conts = Continuations::new();
        let (a, _) = event_entry();
        let (b, b_event) = event_entry();
        conts.add(a, false);
        conts.add(b, true);
        let drained = conts.seal();
        match &drained[0].continuation {
            Continuation::Event(event) => assert!(Arc::ptr_eq(event, &b_event)),
            _ => panic!("expected event entry"),
        }
    }

    #[test]
    fn sealed_store_rejects_registration() {
        let conts = Continuations::new();
        conts.seal();
        let (entry, _) = event_entry();
        assert!(matches!(conts.add(entry, false), Register::NotQueued(_)));
    }

    #[test]
    fn removed_single_leaves_a_list_not_empty() {
        let conts = Continuations::new();
        let (a, _) = event_entry();
        let id = match conts.add(a, false) {
            Register::Added(id) => id,
            _ => panic!(),
        };
        assert!(conts.remove(id));
        // Still a (now empty) list: further seals drain nothing, but the
        // store never reports itself empty again.
        assert!(matches!(&*conts.store.lock().unwrap(), Store::List(_)));
    }

    #[test]
    fn remove_after_seal_reports_gone() {
        let conts = Continuations::new();
        let (a, _) = event_entry();
        let id = match conts.add(a, false) {
            Register::Added(id) => id,
            _ => panic!(),
        };
        conts.seal();
        assert!(!conts.remove(id));
    }
}
