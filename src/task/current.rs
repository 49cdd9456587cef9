//! Thread-local execution context: the currently running task and the
//! inline-execution depth budget.

use crate::task::core::AnyTask;

use std::cell::{Cell, RefCell};

/// Continuations executing synchronously nest on the completer's stack; past
/// this depth they are forced to the scheduler instead.
const MAX_INLINE_DEPTH: usize = 32;

thread_local! {
    static CURRENT: RefCell<Option<AnyTask>> = const { RefCell::new(None) };
    static INLINE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Publishes `task` as this thread's current task for the duration of the
/// returned guard. The previous value is restored on drop, on every exit
/// path.
pub(crate) fn enter(task: AnyTask) -> CurrentGuard {
    let prev = CURRENT.with(|current| current.borrow_mut().replace(task));
    CurrentGuard { prev }
}

pub(crate) fn with_current<R>(f: impl FnOnce(Option<&AnyTask>) -> R) -> R {
    CURRENT.with(|current| f(current.borrow().as_ref()))
}

pub(crate) struct CurrentGuard {
    prev: Option<AnyTask>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| *current.borrow_mut() = prev);
    }
}

/// Claims a unit of inline-execution depth, or `None` if the budget is
/// spent and the work should go to a scheduler.
pub(crate) fn reserve_inline_depth() -> Option<DepthGuard> {
    INLINE_DEPTH.with(|depth| {
        let d = depth.get();
        if d >= MAX_INLINE_DEPTH {
            None
        } else {
            depth.set(d + 1);
            Some(DepthGuard(()))
        }
    })
}

pub(crate) struct DepthGuard(());

impl Drop for DepthGuard {
    fn drop(&mut self) {
        INLINE_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_budget_is_bounded_and_restored() {
        let mut guards = Vec::new();
        while let Some(guard) = reserve_inline_depth() {
            guards.push(guard);
        }
        assert_eq!(guards.len(), MAX_INLINE_DEPTH);
        drop(guards);
        assert!(reserve_inline_depth().is_some());
    }
}
