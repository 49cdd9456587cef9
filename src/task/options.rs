//! Task creation and continuation options.
//!
//! Both option types are small bit sets with `const` members, combined with
//! `|`. Creation options occupy the low byte so they can be folded directly
//! into the task's state word at construction.

use std::fmt;
use std::ops::BitOr;

/// Options controlling how a task is created and scheduled.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct CreationOptions(pub(crate) u32);

impl CreationOptions {
    /// Default behavior.
    pub const NONE: CreationOptions = CreationOptions(0);

    /// Hint to the scheduler that the task should be scheduled fairly
    /// (first-in, first-out) rather than onto a fast local queue.
    pub const PREFER_FAIRNESS: CreationOptions = CreationOptions(0x01);

    /// Hint that the task will be long-running and coarse-grained; the
    /// default pool runs such tasks on a dedicated thread rather than
    /// occupying a worker.
    pub const LONG_RUNNING: CreationOptions = CreationOptions(0x02);

    /// Attach the task to the currently executing task: the parent will not
    /// complete until this task completes, and this task's failures surface
    /// through the parent.
    pub const ATTACHED_TO_PARENT: CreationOptions = CreationOptions(0x04);

    /// Refuse attachment attempts made by child tasks created inside this
    /// task's body.
    pub const DENY_CHILD_ATTACH: CreationOptions = CreationOptions(0x08);

    /// Tasks created inside this task's body see the default scheduler as
    /// their ambient scheduler rather than this task's scheduler.
    pub const HIDE_SCHEDULER: CreationOptions = CreationOptions(0x10);

    /// Never run continuations on the thread that completed this task.
    pub const RUN_CONTINUATIONS_ASYNC: CreationOptions = CreationOptions(0x20);

    pub(crate) const MASK: u32 = 0x3f;

    /// Returns `true` if every bit of `other` is set in `self`.
    pub fn contains(self, other: CreationOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CreationOptions {
    type Output = CreationOptions;

    fn bitor(self, rhs: CreationOptions) -> CreationOptions {
        CreationOptions(self.0 | rhs.0)
    }
}

impl fmt::Debug for CreationOptions {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = fmt.debug_list();
        for (bit, name) in [
            (Self::PREFER_FAIRNESS, "PREFER_FAIRNESS"),
            (Self::LONG_RUNNING, "LONG_RUNNING"),
            (Self::ATTACHED_TO_PARENT, "ATTACHED_TO_PARENT"),
            (Self::DENY_CHILD_ATTACH, "DENY_CHILD_ATTACH"),
            (Self::HIDE_SCHEDULER, "HIDE_SCHEDULER"),
            (Self::RUN_CONTINUATIONS_ASYNC, "RUN_CONTINUATIONS_ASYNC"),
        ] {
            if self.contains(bit) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

/// Options controlling how a continuation created by
/// [`Task::continue_with_opts`](crate::Task::continue_with_opts) behaves.
///
/// The creation-option bits ([`CreationOptions`]) are a subset: a
/// `ContinueOptions` value carries them through to the continuation task.
/// The gating predicates (`NOT_ON_*` / `ONLY_ON_*`) decide whether the
/// continuation runs or is canceled when the antecedent completes.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct ContinueOptions(pub(crate) u32);

impl ContinueOptions {
    /// Default behavior.
    pub const NONE: ContinueOptions = ContinueOptions(0);

    /// See [`CreationOptions::PREFER_FAIRNESS`].
    pub const PREFER_FAIRNESS: ContinueOptions = ContinueOptions(0x01);
    /// See [`CreationOptions::LONG_RUNNING`].
    pub const LONG_RUNNING: ContinueOptions = ContinueOptions(0x02);
    /// See [`CreationOptions::ATTACHED_TO_PARENT`]. The parent is the task
    /// current on the thread calling `continue_with_opts`.
    pub const ATTACHED_TO_PARENT: ContinueOptions = ContinueOptions(0x04);
    /// See [`CreationOptions::DENY_CHILD_ATTACH`].
    pub const DENY_CHILD_ATTACH: ContinueOptions = ContinueOptions(0x08);
    /// See [`CreationOptions::HIDE_SCHEDULER`].
    pub const HIDE_SCHEDULER: ContinueOptions = ContinueOptions(0x10);
    /// See [`CreationOptions::RUN_CONTINUATIONS_ASYNC`].
    pub const RUN_CONTINUATIONS_ASYNC: ContinueOptions = ContinueOptions(0x20);

    /// Do not run the continuation if the antecedent ran to completion; the
    /// continuation is canceled instead.
    pub const NOT_ON_RAN_TO_COMPLETION: ContinueOptions = ContinueOptions(0x1_0000);
    /// Do not run the continuation if the antecedent faulted.
    pub const NOT_ON_FAULTED: ContinueOptions = ContinueOptions(0x2_0000);
    /// Do not run the continuation if the antecedent was canceled.
    pub const NOT_ON_CANCELED: ContinueOptions = ContinueOptions(0x4_0000);

    /// Run only if the antecedent ran to completion.
    pub const ONLY_ON_RAN_TO_COMPLETION: ContinueOptions =
        ContinueOptions(0x2_0000 | 0x4_0000);
    /// Run only if the antecedent faulted.
    pub const ONLY_ON_FAULTED: ContinueOptions = ContinueOptions(0x1_0000 | 0x4_0000);
    /// Run only if the antecedent was canceled.
    pub const ONLY_ON_CANCELED: ContinueOptions = ContinueOptions(0x1_0000 | 0x2_0000);

    /// Prefer running the continuation on the thread that completed the
    /// antecedent rather than queueing it.
    pub const EXECUTE_SYNCHRONOUSLY: ContinueOptions = ContinueOptions(0x8_0000);

    /// When the continuation's token fires before the antecedent completes,
    /// delay the cancellation until the antecedent completes instead of
    /// canceling the continuation immediately.
    pub const LAZY_CANCELLATION: ContinueOptions = ContinueOptions(0x10_0000);

    /// Returns `true` if every bit of `other` is set in `self`.
    pub fn contains(self, other: ContinueOptions) -> bool {
        self.0 & other.0 == other.0
    }

    /// The creation-option subset carried by this value.
    pub(crate) fn creation(self) -> CreationOptions {
        CreationOptions(self.0 & CreationOptions::MASK)
    }
}

impl BitOr for ContinueOptions {
    type Output = ContinueOptions;

    fn bitor(self, rhs: ContinueOptions) -> ContinueOptions {
        ContinueOptions(self.0 | rhs.0)
    }
}

impl fmt::Debug for ContinueOptions {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = fmt.debug_list();
        for (bit, name) in [
            (Self::PREFER_FAIRNESS, "PREFER_FAIRNESS"),
            (Self::LONG_RUNNING, "LONG_RUNNING"),
            (Self::ATTACHED_TO_PARENT, "ATTACHED_TO_PARENT"),
            (Self::DENY_CHILD_ATTACH, "DENY_CHILD_ATTACH"),
            (Self::HIDE_SCHEDULER, "HIDE_SCHEDULER"),
            (Self::RUN_CONTINUATIONS_ASYNC, "RUN_CONTINUATIONS_ASYNC"),
            (Self::NOT_ON_RAN_TO_COMPLETION, "NOT_ON_RAN_TO_COMPLETION"),
            (Self::NOT_ON_FAULTED, "NOT_ON_FAULTED"),
            (Self::NOT_ON_CANCELED, "NOT_ON_CANCELED"),
            (Self::EXECUTE_SYNCHRONOUSLY, "EXECUTE_SYNCHRONOUSLY"),
            (Self::LAZY_CANCELLATION, "LAZY_CANCELLATION"),
        ] {
            if self.contains(bit) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_subset_passes_through() {
        let opts = ContinueOptions::ATTACHED_TO_PARENT
            | ContinueOptions::EXECUTE_SYNCHRONOUSLY
            | ContinueOptions::NOT_ON_FAULTED;
        assert_eq!(opts.creation(), CreationOptions::ATTACHED_TO_PARENT);
    }

    #[test]
    fn only_on_is_the_complement_pair() {
        let o = ContinueOptions::ONLY_ON_RAN_TO_COMPLETION;
        assert!(o.contains(ContinueOptions::NOT_ON_FAULTED));
        assert!(o.contains(ContinueOptions::NOT_ON_CANCELED));
        assert!(!o.contains(ContinueOptions::NOT_ON_RAN_TO_COMPLETION));
    }
}
