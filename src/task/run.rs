//! The spawn shorthand: construct, deny child attachment, start on the
//! default pool.

use crate::cancel::CancellationToken;
use crate::scheduler;
use crate::task::options::CreationOptions;
use crate::task::Task;

/// Constructs a task around `body` and starts it on the default pool.
///
/// Tasks spawned this way deny child attachment: work spawned inside `body`
/// does not keep this task alive.
pub fn run<T>(body: impl FnOnce() -> T + Send + 'static) -> Task<T>
where
    T: Send + 'static,
{
    run_cancelable(body, CancellationToken::none())
}

/// [`run`], bound to a cancellation token. A token requested before the
/// body runs cancels the task without running it.
pub fn run_cancelable<T>(
    body: impl FnOnce() -> T + Send + 'static,
    token: CancellationToken,
) -> Task<T>
where
    T: Send + 'static,
{
    let task = Task::new_with_all(
        body,
        None,
        token,
        CreationOptions::DENY_CHILD_ATTACH,
    );
    // Start is a no-op on a task the token already completed.
    let _ = task.start_on(&scheduler::default());
    task
}

/// Spawns a body that itself produces a task, returning the flattened
/// result: the returned task mirrors the inner task's completion.
pub fn run_flatten<T>(body: impl FnOnce() -> Task<T> + Send + 'static) -> Task<T>
where
    T: Clone + Send + 'static,
{
    run(body).flatten()
}
