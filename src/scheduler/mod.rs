//! The scheduler boundary.
//!
//! A scheduler accepts tasks and eventually runs them, exactly once each,
//! via [`QueuedTask::run`]. The runtime ships a work-stealing thread pool
//! ([`pool::Pool`]); anything implementing [`Schedule`] can stand in for it.

pub mod pool;

use crate::task::core::AnyTask;

use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// A shared handle to a scheduler.
pub type SchedulerHandle = Arc<dyn Schedule>;

/// The contract between the runtime and a scheduler.
///
/// * `queue` may run the task on any thread, at any later time, exactly
///   once, by calling [`QueuedTask::run`].
/// * `try_inline` runs the task on the current thread if the scheduler
///   allows it; declining returns `false` with no state change.
/// * `try_dequeue` removes a still-queued task; it must never report success
///   for a task that has started running.
/// * `requires_atomic_start` asks the runtime to guard the execution entry
///   with an atomic transition even on the dequeue-only cancellation path.
pub trait Schedule: Send + Sync + 'static {
    /// Accepts a task for later execution.
    fn queue(&self, task: QueuedTask, hint: SpawnHint) -> Result<(), QueueError>;

    /// Runs the task on the calling thread if allowed. `was_queued` is true
    /// when the task may still be sitting in this scheduler's queue; a
    /// scheduler driving tasks through [`QueuedTask::run`] must either
    /// dequeue it first or decline, or the eventual queue pop would run the
    /// task a second time.
    fn try_inline(&self, task: &QueuedTask, was_queued: bool) -> bool;

    /// Removes a queued task. Schedulers without targeted removal return
    /// `false` and the canceled task is dropped at the execution entry.
    fn try_dequeue(&self, task: &QueuedTask) -> bool;

    /// Whether the runtime must use an atomic start transition when
    /// canceling tasks it could not dequeue.
    fn requires_atomic_start(&self) -> bool {
        false
    }
}

/// A task handed to a scheduler.
///
/// Opaque on purpose: the only things a scheduler can do with it are run it
/// and compare it for identity.
pub struct QueuedTask {
    raw: AnyTask,
}

impl QueuedTask {
    pub(crate) fn new(raw: AnyTask) -> QueuedTask {
        QueuedTask { raw }
    }

    pub(crate) fn raw(&self) -> &AnyTask {
        &self.raw
    }

    /// Runs the task on the calling thread.
    ///
    /// # Panics
    ///
    /// Calling this twice for the same task is a contract violation and
    /// panics, with one exception: a task that was completed by a canceler
    /// while it sat in the queue is silently dropped.
    pub fn run(&self) {
        self.raw.run();
    }

    /// Returns `true` if both handles refer to the same task.
    pub fn same_task(&self, other: &QueuedTask) -> bool {
        self.raw.ptr_eq(&other.raw)
    }
}

impl fmt::Debug for QueuedTask {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("QueuedTask")
            .field("id", &self.raw.header().id())
            .finish()
    }
}

/// Scheduling hints derived from the task's creation options.
#[derive(Copy, Clone, Debug, Default)]
pub struct SpawnHint {
    fair: bool,
    dedicated: bool,
}

impl SpawnHint {
    pub(crate) fn new(fair: bool, dedicated: bool) -> SpawnHint {
        SpawnHint { fair, dedicated }
    }

    /// The task asked for FIFO fairness; prefer a global queue over a local
    /// fast path.
    pub fn prefer_fairness(&self) -> bool {
        self.fair
    }

    /// The task is long-running; prefer a dedicated thread over a pool
    /// worker.
    pub fn long_running(&self) -> bool {
        self.dedicated
    }
}

/// The reason a scheduler rejected a task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The scheduler is shutting down and no longer accepts tasks.
    Shutdown,
}

impl fmt::Display for QueueError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Shutdown => "scheduler is shut down".fmt(fmt),
        }
    }
}

impl Error for QueueError {}

/// The process-wide default scheduler.
pub fn default() -> SchedulerHandle {
    pool::default_pool()
}

/// The scheduler tasks on this thread should use by default: the current
/// task's scheduler, unless it hides it, else the default pool.
pub(crate) fn ambient() -> SchedulerHandle {
    crate::task::current::with_current(|current| match current {
        Some(task) if !task.header().hides_scheduler() => {
            task.header().scheduler().unwrap_or_else(default)
        }
        _ => default(),
    })
}
