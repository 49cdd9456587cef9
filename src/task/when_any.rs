//! The race combinator.

use crate::task::continuations::{CompleteAction, Continuation, Entry, Register};
use crate::task::core::AnyTask;
use crate::task::Task;

use std::sync::Arc;

/// Returns a task that completes with the first input task to complete.
///
/// The combinator itself always runs to completion; its value is the
/// winning task, whatever that task's own terminal state. The eventual
/// states of the other inputs do not affect the outcome.
///
/// # Panics
///
/// With zero inputs; there is nothing to race.
pub fn when_any<T>(tasks: Vec<Task<T>>) -> Task<Task<T>>
where
    T: Send + 'static,
{
    assert!(!tasks.is_empty(), "when_any requires at least one task");

    let result = Task::promise_task();
    let race = Arc::new(Race {
        tasks,
        result: result.clone(),
    });

    for (index, task) in race.tasks.iter().enumerate() {
        let entry = Entry::new(Continuation::Action(Arc::new(RaceEntry {
            race: race.clone(),
            index,
        })));
        if let Register::NotQueued(_) = task.cell().header.continuations.add(entry, false) {
            race.result.try_complete_value(task.clone());
            break;
        }
    }

    result
}

struct Race<T> {
    tasks: Vec<Task<T>>,
    result: Task<Task<T>>,
}

struct RaceEntry<T> {
    race: Arc<Race<T>>,
    index: usize,
}

impl<T: Send + 'static> CompleteAction for RaceEntry<T> {
    fn invoke(&self, _completed: &AnyTask) {
        // First completer wins the reservation; later invocations no-op.
        self.race
            .result
            .try_complete_value(self.race.tasks[self.index].clone());
    }
}
