#![warn(rust_2018_idioms)]

// Exercises the scheduler-facing contract with a hand-driven scheduler:
// queued tasks run exactly once, targeted dequeue lets a canceler complete
// a task that never runs, and inline execution happens on the caller.

use ravel::cancel::CancellationSource;
use ravel::scheduler::{QueueError, QueuedTask, Schedule, SchedulerHandle, SpawnHint};
use ravel::{Status, Task};

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;

/// A scheduler that runs nothing until the test pumps it.
struct ManualScheduler {
    queue: Mutex<Vec<QueuedTask>>,
}

impl ManualScheduler {
    fn new() -> Arc<ManualScheduler> {
        Arc::new(ManualScheduler {
            queue: Mutex::new(Vec::new()),
        })
    }

    fn pump(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.queue.lock().unwrap().pop();
            match task {
                Some(task) => {
                    task.run();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl Schedule for ManualScheduler {
    fn queue(&self, task: QueuedTask, _hint: SpawnHint) -> Result<(), QueueError> {
        self.queue.lock().unwrap().push(task);
        Ok(())
    }

    fn try_inline(&self, task: &QueuedTask, was_queued: bool) -> bool {
        if was_queued {
            return false;
        }
        task.run();
        true
    }

    fn try_dequeue(&self, task: &QueuedTask) -> bool {
        let mut queue = self.queue.lock().unwrap();
        match queue.iter().position(|queued| queued.same_task(task)) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }
}

#[test]
fn queued_tasks_wait_for_the_scheduler() {
    let scheduler = ManualScheduler::new();
    let handle: SchedulerHandle = scheduler.clone();

    let task = Task::new(|| 9);
    task.start_on(&handle).unwrap();

    assert_eq!(task.status(), Status::WaitingToRun);
    assert_eq!(scheduler.queued(), 1);

    assert_eq!(scheduler.pump(), 1);
    assert_eq!(task.try_result(), Some(9));
}

#[test]
fn cancellation_dequeues_before_the_task_ever_runs() {
    let scheduler = ManualScheduler::new();
    let handle: SchedulerHandle = scheduler.clone();
    let source = CancellationSource::new();

    let task = Task::new_cancelable(|| panic!("must not run"), source.token());
    task.start_on(&handle).unwrap();
    assert_eq!(scheduler.queued(), 1);

    source.cancel();

    // The callback pulled the task out of the queue and completed it.
    assert_eq!(scheduler.queued(), 0);
    assert_eq!(task.status(), Status::Canceled);
    assert_eq!(scheduler.pump(), 0);
}

#[test]
fn running_a_task_twice_is_a_contract_violation() {
    let scheduler = ManualScheduler::new();
    let handle: SchedulerHandle = scheduler.clone();

    let task = Task::new(|| ());
    task.start_on(&handle).unwrap();

    let queued = scheduler.queue.lock().unwrap().pop().unwrap();
    queued.run();
    assert!(task.is_completed());

    let second = panic::catch_unwind(AssertUnwindSafe(|| queued.run()));
    assert!(second.is_err(), "a second run must be rejected loudly");
}

#[test]
fn inline_execution_happens_on_the_caller() {
    let scheduler = ManualScheduler::new();
    let handle: SchedulerHandle = scheduler.clone();

    let caller = thread::current().id();
    let task = Task::new(move || thread::current().id() == caller);
    task.run_synchronously_on(&handle).unwrap();

    assert_eq!(task.try_result(), Some(true));
    assert_eq!(scheduler.queued(), 0);
}

#[test]
fn declined_inline_falls_back_to_queue_and_wait() {
    // A scheduler that never inlines forces run_synchronously onto the
    // queue-plus-block path; a helper thread pumps the queue.
    struct NoInline(Arc<ManualScheduler>);

    impl Schedule for NoInline {
        fn queue(&self, task: QueuedTask, hint: SpawnHint) -> Result<(), QueueError> {
            self.0.queue(task, hint)
        }
        fn try_inline(&self, _task: &QueuedTask, _was_queued: bool) -> bool {
            false
        }
        fn try_dequeue(&self, task: &QueuedTask) -> bool {
            self.0.try_dequeue(task)
        }
    }

    let manual = ManualScheduler::new();
    let handle: SchedulerHandle = Arc::new(NoInline(manual.clone()));

    let pumper = {
        let manual = manual.clone();
        thread::spawn(move || {
            // Wait until the task shows up, then run it.
            while manual.pump() == 0 {
                thread::yield_now();
            }
        })
    };

    let task = Task::new(|| 3);
    task.run_synchronously_on(&handle).unwrap();
    assert_eq!(task.try_result(), Some(3));

    pumper.join().unwrap();
}
