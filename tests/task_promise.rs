#![warn(rust_2018_idioms)]

use ravel::cancel::CancellationSource;
use ravel::{Promise, Status, Task, WaitError};

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn cross_thread_completion_wakes_a_blocked_waiter() {
    let promise = Promise::new();
    let task = promise.task();

    let setter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        assert!(promise.try_set_result(7));
    });

    assert_eq!(task.result().unwrap(), 7);
    setter.join().unwrap();
}

#[test]
fn exactly_one_completer_wins() {
    let promise = Arc::new(Promise::new());
    let wins = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..8)
        .map(|i| {
            let promise = promise.clone();
            let wins = wins.clone();
            thread::spawn(move || {
                if promise.try_set_result(i) {
                    wins.fetch_add(1, SeqCst);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(wins.load(SeqCst), 1);
    let value = promise.task().result().unwrap();
    assert!(value < 8);
}

#[test]
fn late_setters_observe_the_winner() {
    let promise = Promise::new();
    assert!(promise.try_set_result(1));
    assert!(!promise.try_set_result(2));
    assert!(!promise.try_set_error("nope"));
    assert!(!promise.try_set_canceled(CancellationSource::new().token()));
    assert_eq!(promise.task().result().unwrap(), 1);
}

#[test]
fn error_completion_faults_the_task() {
    let promise = Promise::<u32>::new();
    assert!(promise.try_set_error("exploded"));

    let task = promise.task();
    assert_eq!(task.status(), Status::Faulted);
    match task.wait().unwrap_err() {
        WaitError::Faulted(agg) => {
            let payload = agg.failures()[0].panic_payload().unwrap();
            assert!(payload.with_payload(|p| p.downcast_ref::<&str>() == Some(&"exploded")));
        }
        other => panic!("expected fault, got {:?}", other),
    }
}

#[test]
fn canceled_completion_carries_the_token() {
    let source = CancellationSource::new();
    let promise = Promise::<u32>::new();
    assert!(promise.try_set_canceled(source.token()));

    let task = promise.task();
    assert_eq!(task.status(), Status::Canceled);

    // A plain wait surfaces the cancellation inside the aggregate.
    match task.wait().unwrap_err() {
        WaitError::Faulted(agg) => {
            assert!(agg.is_cancellation_only());
        }
        other => panic!("expected aggregate, got {:?}", other),
    }

    // Waiting with the canceling token surfaces it directly.
    match task.wait_cancelable(&source.token()).unwrap_err() {
        WaitError::Canceled(oc) => assert!(oc.token().same_source(&source.token())),
        other => panic!("expected cancellation, got {:?}", other),
    }
}

#[test]
fn from_result_from_error_from_canceled() {
    let done: Task<u32> = Task::from_result(9);
    assert_eq!(done.status(), Status::RanToCompletion);
    assert_eq!(done.try_result(), Some(9));

    let failed: Task<u32> = Task::from_error("bad");
    assert_eq!(failed.status(), Status::Faulted);
    assert!(failed.exception().is_some());

    let source = CancellationSource::new();
    let canceled: Task<u32> = Task::from_canceled(source.token());
    assert_eq!(canceled.status(), Status::Canceled);
    assert!(canceled.is_canceled());
}

#[test]
fn continuations_fire_on_promise_completion() {
    let promise = Promise::new();
    let task = promise.task();
    let doubled = task.continue_with(|t| t.try_result().unwrap() * 2);

    assert!(!doubled.is_completed());
    promise.try_set_result(21);
    assert_eq!(doubled.result().unwrap(), 42);
}
