//! Time-triggered tasks.

mod timer;

use self::timer::TimerHandle;
use crate::cancel::{CancellationToken, Registration};
use crate::task::continuations::{CompleteAction, Continuation, Entry, Register};
use crate::task::core::AnyTask;
use crate::task::error::OperationCanceled;
use crate::task::Task;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Returns a task that runs to completion after `duration`.
///
/// A zero duration yields an already-completed task.
pub fn delay(duration: Duration) -> Task<()> {
    delay_cancelable(duration, CancellationToken::none())
}

/// A [`delay`] racing a cancellation token: whichever fires first decides
/// the terminal state. The timer entry and the token registration are both
/// released once the task completes.
///
/// ```
/// use ravel::time;
/// use std::time::Duration;
///
/// let task = time::delay(Duration::from_millis(10));
/// task.wait().unwrap();
/// ```
pub fn delay_cancelable(duration: Duration, token: CancellationToken) -> Task<()> {
    if token.is_requested() {
        return Task::from_canceled(token);
    }
    if duration.is_zero() {
        return Task::from_result(());
    }

    let task: Task<()> = Task::promise_task();

    let fire_target = task.clone();
    let handle = timer::arm(Instant::now() + duration, move || {
        fire_target.try_complete_value(());
    });

    let registration = if token.can_be_canceled() {
        let cancel_target = task.clone();
        let cancel_token = token.clone();
        Some(token.register(move || {
            cancel_target.try_complete_canceled(OperationCanceled::new(cancel_token.clone()));
        }))
    } else {
        None
    };

    // Whichever side completes the task, the loser's resources are
    // released at completion.
    let disposer = Arc::new(DisposeOnDone {
        handle,
        registration: Mutex::new(registration),
    });
    let entry = Entry::new(Continuation::Action(disposer.clone()));
    if let Register::NotQueued(_) = task.cell().header.continuations.add(entry, false) {
        disposer.invoke(&task.any());
    }

    task
}

struct DisposeOnDone {
    handle: TimerHandle,
    registration: Mutex<Option<Registration>>,
}

impl CompleteAction for DisposeOnDone {
    fn invoke(&self, _completed: &AnyTask) {
        self.handle.cancel();
        drop(self.registration.lock().unwrap().take());
    }
}
