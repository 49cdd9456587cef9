//! Failure capture and the unobserved-failure sink.

use crate::task::error::{AggregateError, Failure, OperationCanceled, PanicPayload};

use std::any::Any;
use std::sync::RwLock;

type UnobservedHook = Box<dyn Fn(&AggregateError) + Send + Sync>;

lazy_static! {
    static ref UNOBSERVED_HOOK: RwLock<Option<UnobservedHook>> = RwLock::new(None);
}

/// Installs the process-wide sink for failures that are dropped without ever
/// being observed. The default sink logs the aggregate at error level.
pub fn set_unobserved_hook(hook: impl Fn(&AggregateError) + Send + Sync + 'static) {
    *UNOBSERVED_HOOK.write().unwrap() = Some(Box::new(hook));
}

fn surface_unobserved(err: &AggregateError) {
    let hook = UNOBSERVED_HOOK.read().unwrap();
    match &*hook {
        Some(hook) => hook(err),
        None => tracing::error!(error = %err, "task failure was never observed"),
    }
}

/// Aggregates the failures captured by one task, in order.
///
/// `represents_cancellation` is true while the recorded failures consist
/// solely of the task's own cancellation signal; any genuine fault, and any
/// failure adopted from a child, clears it. The holder tracks whether the
/// failures were ever observed; dropping an unobserved holder surfaces the
/// aggregate on the unobserved-failure sink.
pub(crate) struct ExceptionHolder {
    failures: Vec<Failure>,
    represents_cancellation: bool,
    observed: bool,
}

impl ExceptionHolder {
    pub(crate) fn new() -> ExceptionHolder {
        ExceptionHolder {
            failures: Vec::new(),
            represents_cancellation: false,
            observed: false,
        }
    }

    /// Records a panic payload as a fault.
    pub(crate) fn add_panic(&mut self, payload: Box<dyn Any + Send + 'static>) {
        self.failures
            .push(Failure::Panic(PanicPayload::new(payload)));
        self.represents_cancellation = false;
    }

    /// Records a failure produced by the runtime (scheduler error, adopted
    /// child failure).
    pub(crate) fn add_failure(&mut self, failure: Failure) {
        self.failures.push(failure);
        self.represents_cancellation = false;
    }

    /// Records the task's own cancellation signal. Only cancellation
    /// recorded through here keeps the holder classified as "canceled, not
    /// faulted".
    pub(crate) fn set_cancellation(&mut self, oc: OperationCanceled) {
        let sole = self.failures.is_empty();
        self.failures.push(Failure::Canceled(oc));
        if sole {
            self.represents_cancellation = true;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// True if the holder forces the task to the faulted terminal state.
    pub(crate) fn is_faulting(&self) -> bool {
        !self.failures.is_empty() && !self.represents_cancellation
    }

    /// The task's own cancellation signal, if one was recorded.
    pub(crate) fn cancellation(&self) -> Option<OperationCanceled> {
        self.failures.iter().find_map(|f| match f {
            Failure::Canceled(oc) => Some(oc.clone()),
            _ => None,
        })
    }

    /// Snapshots the failures, marking them observed.
    pub(crate) fn observe(&mut self) -> Vec<Failure> {
        self.observed = true;
        self.failures.clone()
    }

    /// Snapshots the failures without affecting observed status (used when a
    /// consumer inspects rather than handles, e.g. `wait_any`).
    pub(crate) fn peek(&self) -> Vec<Failure> {
        self.failures.clone()
    }

    pub(crate) fn mark_observed(&mut self) {
        self.observed = true;
    }
}

impl Drop for ExceptionHolder {
    fn drop(&mut self) {
        if !self.observed && self.is_faulting() {
            surface_unobserved(&AggregateError::new(std::mem::take(&mut self.failures)));
        }
    }
}

impl std::fmt::Debug for ExceptionHolder {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("ExceptionHolder")
            .field("failures", &self.failures.len())
            .field("represents_cancellation", &self.represents_cancellation)
            .field("observed", &self.observed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSource;

    #[test]
    fn own_cancellation_does_not_fault() {
        let source = CancellationSource::new();
        let mut holder = ExceptionHolder::new();
        holder.set_cancellation(OperationCanceled::new(source.token()));
        assert!(!holder.is_faulting());
        assert!(holder.cancellation().is_some());
        holder.mark_observed();
    }

    #[test]
    fn panic_faults() {
        let mut holder = ExceptionHolder::new();
        holder.add_panic(Box::new("boom"));
        assert!(holder.is_faulting());
        holder.mark_observed();
    }

    #[test]
    fn adopted_cancellation_faults() {
        let source = CancellationSource::new();
        let mut holder = ExceptionHolder::new();
        holder.add_failure(Failure::Canceled(OperationCanceled::new(source.token())));
        assert!(holder.is_faulting());
        holder.mark_observed();
    }

    #[test]
    fn cancellation_then_fault_is_faulting() {
        let source = CancellationSource::new();
        let mut holder = ExceptionHolder::new();
        holder.set_cancellation(OperationCanceled::new(source.token()));
        holder.add_panic(Box::new("boom"));
        assert!(holder.is_faulting());
        assert_eq!(holder.observe().len(), 2);
    }
}
