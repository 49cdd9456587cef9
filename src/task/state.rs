use crate::task::options::CreationOptions;
use crate::task::Status;

use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::{AcqRel, Acquire};

/// The task's state word.
///
/// A single atomic `u32` partitioned into bit ranges: the low byte holds the
/// public creation options, the second byte holds internal creation flags,
/// and the upper bits hold the lifecycle. All multi-bit lifecycle changes go
/// through RMW loops, which establishes an unambiguous modification order.
pub(crate) struct State {
    val: AtomicU32,
}

/// Current state value.
#[derive(Copy, Clone)]
pub(crate) struct Snapshot(u32);

type UpdateResult = Result<Snapshot, Snapshot>;

/// The task is a promise: completed externally, never by running a body.
const PROMISE: u32 = 0x100;

/// The task is a continuation, activated by its antecedent's drain.
const CONTINUATION: u32 = 0x200;

/// `start` succeeded; a scheduler owns the task.
pub(crate) const STARTED: u32 = 0x1_0000;

/// The execution entry has been claimed. Guarantees exactly-once invocation.
pub(crate) const DELEGATE_INVOKED: u32 = 0x2_0000;

/// `dispose` ran; the completion event has been released.
pub(crate) const DISPOSED: u32 = 0x4_0000;

/// The parent observed this task's failure via an explicit wait, so the
/// failure is not re-surfaced through the parent's aggregate.
pub(crate) const EXCEPTION_OBSERVED_BY_PARENT: u32 = 0x8_0000;

/// The body acknowledged cancellation by panicking with the task's token.
pub(crate) const CANCELLATION_ACKNOWLEDGED: u32 = 0x10_0000;

/// Terminal: the task failed.
pub(crate) const FAULTED: u32 = 0x20_0000;

/// Terminal: the task was canceled.
pub(crate) const CANCELED: u32 = 0x40_0000;

/// The body returned but attached children are still running.
pub(crate) const WAITING_ON_CHILDREN: u32 = 0x80_0000;

/// Terminal: the task produced its value.
pub(crate) const RAN_TO_COMPLETION: u32 = 0x100_0000;

/// The task is a promise or continuation that has not been triggered yet.
pub(crate) const WAITING_FOR_ACTIVATION: u32 = 0x200_0000;

/// A `try_set_*` caller holds the exclusive right to complete the task.
pub(crate) const COMPLETION_RESERVED: u32 = 0x400_0000;

/// Any terminal bit. At most one is ever set, and once set it stays set.
pub(crate) const COMPLETED_MASK: u32 = FAULTED | CANCELED | RAN_TO_COMPLETION;

impl State {
    pub(crate) fn new(options: CreationOptions, promise: bool, continuation: bool) -> State {
        let mut val = options.0 & CreationOptions::MASK;
        if promise {
            val |= PROMISE | WAITING_FOR_ACTIVATION;
        }
        if continuation {
            val |= CONTINUATION | WAITING_FOR_ACTIVATION;
        }
        State {
            val: AtomicU32::new(val),
        }
    }

    /// Loads the current state, establishes `Acquire` ordering.
    pub(crate) fn load(&self) -> Snapshot {
        Snapshot(self.val.load(Acquire))
    }

    /// ORs `new_bits` in, failing (without a write) if any of `illegal_bits`
    /// is already set. The universal transition primitive.
    pub(crate) fn atomic_update(&self, new_bits: u32, illegal_bits: u32) -> UpdateResult {
        self.fetch_update(|curr| {
            if curr.0 & illegal_bits != 0 {
                None
            } else {
                Some(Snapshot(curr.0 | new_bits))
            }
        })
    }

    /// Marks the task started, serializing against a racing cancellation
    /// callback: fails if the task is already started or already canceled.
    pub(crate) fn mark_started(&self) -> UpdateResult {
        self.atomic_update(STARTED, STARTED | CANCELED)
    }

    /// Claims the execution entry. Fails if the entry was already claimed.
    pub(crate) fn mark_invoked(&self) -> UpdateResult {
        self.atomic_update(DELEGATE_INVOKED, DELEGATE_INVOKED)
    }

    /// Serializes concurrent `try_set_*` attempts on a promise: exactly one
    /// caller wins the reservation and proceeds to publish a terminal bit.
    pub(crate) fn reserve_completion(&self) -> bool {
        self.atomic_update(COMPLETION_RESERVED, COMPLETION_RESERVED | COMPLETED_MASK)
            .is_ok()
    }

    /// Publishes exactly one terminal bit, failing if a racing completer
    /// (e.g. a cancellation callback on a task that never ran) got there
    /// first. The RMW gives every thread that subsequently observes
    /// completion a view of all stores made by the winning completer.
    pub(crate) fn transition_to_complete(&self, terminal_bit: u32) -> bool {
        debug_assert!(terminal_bit.count_ones() == 1 && terminal_bit & COMPLETED_MASK != 0);
        self.atomic_update(terminal_bit, COMPLETED_MASK).is_ok()
    }

    /// Marks the task as waiting for attached children. Lifecycle bits are
    /// monotone, so a plain OR suffices.
    pub(crate) fn mark_waiting_on_children(&self) {
        self.val.fetch_or(WAITING_ON_CHILDREN, AcqRel);
    }

    pub(crate) fn set_flag(&self, bit: u32) {
        self.val.fetch_or(bit, AcqRel);
    }

    fn fetch_update<F>(&self, mut f: F) -> UpdateResult
    where
        F: FnMut(Snapshot) -> Option<Snapshot>,
    {
        let mut curr = self.load();

        loop {
            let next = match f(curr) {
                Some(next) => next,
                None => return Err(curr),
            };

            match self
                .val
                .compare_exchange(curr.0, next.0, AcqRel, Acquire)
            {
                Ok(_) => return Ok(next),
                Err(actual) => curr = Snapshot(actual),
            }
        }
    }
}

impl Snapshot {
    pub(crate) fn is_promise(self) -> bool {
        self.0 & PROMISE == PROMISE
    }

    pub(crate) fn is_continuation(self) -> bool {
        self.0 & CONTINUATION == CONTINUATION
    }

    pub(crate) fn is_started(self) -> bool {
        self.0 & STARTED == STARTED
    }

    pub(crate) fn is_invoked(self) -> bool {
        self.0 & DELEGATE_INVOKED == DELEGATE_INVOKED
    }

    pub(crate) fn is_completed(self) -> bool {
        self.0 & COMPLETED_MASK != 0
    }

    pub(crate) fn is_faulted(self) -> bool {
        self.0 & FAULTED == FAULTED
    }

    pub(crate) fn is_canceled(self) -> bool {
        self.0 & CANCELED == CANCELED
    }

    pub(crate) fn is_ran_to_completion(self) -> bool {
        self.0 & RAN_TO_COMPLETION == RAN_TO_COMPLETION
    }

    pub(crate) fn is_cancellation_acknowledged(self) -> bool {
        self.0 & CANCELLATION_ACKNOWLEDGED == CANCELLATION_ACKNOWLEDGED
    }

    pub(crate) fn is_exception_observed_by_parent(self) -> bool {
        self.0 & EXCEPTION_OBSERVED_BY_PARENT == EXCEPTION_OBSERVED_BY_PARENT
    }

    pub(crate) fn is_disposed(self) -> bool {
        self.0 & DISPOSED == DISPOSED
    }

    pub(crate) fn options(self) -> CreationOptions {
        CreationOptions(self.0 & CreationOptions::MASK)
    }

    /// Projects the state word onto the public lifecycle.
    pub(crate) fn status(self) -> Status {
        if self.is_faulted() {
            Status::Faulted
        } else if self.is_canceled() {
            Status::Canceled
        } else if self.is_ran_to_completion() {
            Status::RanToCompletion
        } else if self.0 & WAITING_ON_CHILDREN != 0 {
            Status::WaitingForChildrenToComplete
        } else if self.is_invoked() {
            Status::Running
        } else if self.is_started() {
            Status::WaitingToRun
        } else if self.0 & WAITING_FOR_ACTIVATION != 0 {
            Status::WaitingForActivation
        } else {
            Status::Created
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(fmt)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Snapshot")
            .field("status", &self.status())
            .field("is_started", &self.is_started())
            .field("is_invoked", &self.is_invoked())
            .field("is_promise", &self.is_promise())
            .field("is_continuation", &self.is_continuation())
            .finish()
    }
}
