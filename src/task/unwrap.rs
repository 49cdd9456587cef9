//! Flattening a task-of-task.

use crate::task::continuations::{CompleteAction, Continuation, Entry, Register};
use crate::task::core::AnyTask;
use crate::task::Task;

use std::sync::Arc;

impl<T> Task<Task<T>>
where
    T: Clone + Send + 'static,
{
    /// Returns a task mirroring the completion of the inner task.
    ///
    /// The proxy waits on the outer task first, then on the inner task it
    /// produced. An outer fault or cancellation is adopted directly; once
    /// the inner task exists, its terminal state and failures are mirrored
    /// instead.
    pub fn flatten(&self) -> Task<T> {
        let result = Task::promise_task();

        register_mirror(
            self.any(),
            Arc::new(OuterDone {
                outer: self.clone(),
                result: result.clone(),
            }),
        );

        result
    }
}

fn register_mirror(task: AnyTask, action: Arc<dyn CompleteAction>) {
    let entry = Entry::new(Continuation::Action(action.clone()));
    if let Register::NotQueued(_) = task.header().continuations.add(entry, false) {
        action.invoke(&task);
    }
}

struct OuterDone<T: Send + 'static> {
    outer: Task<Task<T>>,
    result: Task<T>,
}

impl<T: Clone + Send + 'static> CompleteAction for OuterDone<T> {
    fn invoke(&self, _completed: &AnyTask) {
        let header = &self.outer.cell().header;
        let snap = header.state.load();

        if snap.is_faulted() {
            self.result
                .try_complete_failures(header.collect_failures(true));
            return;
        }
        if snap.is_canceled() {
            self.result
                .try_complete_canceled(header.cancellation_signal());
            return;
        }

        let inner = self
            .outer
            .cell()
            .clone_value()
            .expect("outer task ran to completion without a value");

        register_mirror(
            inner.any(),
            Arc::new(InnerDone {
                inner: inner.clone(),
                result: self.result.clone(),
            }),
        );
    }
}

struct InnerDone<T: Send + 'static> {
    inner: Task<T>,
    result: Task<T>,
}

impl<T: Clone + Send + 'static> CompleteAction for InnerDone<T> {
    fn invoke(&self, _completed: &AnyTask) {
        let header = &self.inner.cell().header;
        let snap = header.state.load();

        if snap.is_faulted() {
            self.result
                .try_complete_failures(header.collect_failures(true));
        } else if snap.is_canceled() {
            self.result
                .try_complete_canceled(header.cancellation_signal());
        } else {
            let value = self
                .inner
                .cell()
                .clone_value()
                .expect("inner task ran to completion without a value");
            self.result.try_complete_value(value);
        }
    }
}
