//! The join combinator.

use crate::task::continuations::{CompleteAction, Continuation, Entry, Register};
use crate::task::core::AnyTask;
use crate::task::error::OperationCanceled;
use crate::task::Task;

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;

/// Returns a task that completes when every input task has completed.
///
/// Classification, once the last constituent finishes: any fault makes the
/// join faulted, with every constituent's failures concatenated in input
/// order (cancellations of other constituents are subsumed); otherwise any
/// cancellation makes it canceled, carrying the first canceled
/// constituent's token; otherwise it runs to completion with the values in
/// input order.
///
/// Zero inputs produce an already-completed task holding an empty vector.
pub fn when_all<T>(tasks: Vec<Task<T>>) -> Task<Vec<T>>
where
    T: Clone + Send + 'static,
{
    if tasks.is_empty() {
        return Task::from_result(Vec::new());
    }

    let result = Task::promise_task();
    let join = Arc::new(Join {
        remaining: AtomicUsize::new(tasks.len()),
        tasks,
        result: result.clone(),
    });

    // The counter starts at the full input count, so classification cannot
    // happen until every constituent has completed, however many finish
    // while this loop is still registering.
    for task in &join.tasks {
        let entry = Entry::new(Continuation::Action(join.clone()));
        if let Register::NotQueued(_) = task.cell().header.continuations.add(entry, false) {
            join.invoke(&task.any());
        }
    }

    result
}

struct Join<T> {
    tasks: Vec<Task<T>>,
    remaining: AtomicUsize,
    result: Task<Vec<T>>,
}

impl<T: Clone + Send + 'static> CompleteAction for Join<T> {
    fn invoke(&self, _completed: &AnyTask) {
        if self.remaining.fetch_sub(1, SeqCst) != 1 {
            return;
        }

        // Last one out classifies.
        let mut failures = Vec::new();
        let mut first_canceled: Option<OperationCanceled> = None;

        for task in &self.tasks {
            let header = &task.cell().header;
            let snap = header.state.load();
            if snap.is_faulted() {
                failures.extend(header.collect_failures(true));
            } else if snap.is_canceled() && first_canceled.is_none() {
                first_canceled = Some(header.cancellation_signal());
            }
        }

        if !failures.is_empty() {
            self.result.try_complete_failures(failures);
        } else if let Some(oc) = first_canceled {
            self.result.try_complete_canceled(oc);
        } else {
            let values = self
                .tasks
                .iter()
                .map(|task| {
                    task.cell()
                        .clone_value()
                        .expect("constituent ran to completion without a value")
                })
                .collect();
            self.result.try_complete_value(values);
        }
    }
}
