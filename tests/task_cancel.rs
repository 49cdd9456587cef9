#![warn(rust_2018_idioms)]

use ravel::cancel::CancellationSource;
use ravel::{OperationCanceled, Status, Task, WaitError};

use std::panic;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn token_canceled_before_run_skips_the_body() {
    let source = CancellationSource::new();
    source.cancel();

    let task = ravel::run_cancelable(|| panic!("must not run"), source.token());

    assert!(task.is_canceled());
    match task.wait_cancelable(&source.token()).unwrap_err() {
        WaitError::Canceled(oc) => assert!(oc.token().same_source(&source.token())),
        other => panic!("expected cancellation, got {:?}", other),
    }
}

#[test]
fn token_canceled_before_start_skips_scheduling() {
    let source = CancellationSource::new();
    let task = Task::new_cancelable(|| 1, source.token());

    source.cancel();
    assert!(task.is_canceled());

    // Start notices the cancellation and exits quietly.
    task.start().unwrap_err();
    assert_eq!(task.status(), Status::Canceled);
}

#[test]
fn cancellation_between_queue_and_run_is_observed() {
    let source = CancellationSource::new();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();

    // Occupy the queue with a task that blocks until we release it, so the
    // cancelable task sits queued behind it on a single-worker pool.
    let pool = ravel::scheduler::pool::Builder::new()
        .workers(1)
        .name_prefix("cancel-test")
        .build();
    let handle: ravel::scheduler::SchedulerHandle = pool;

    let blocker = Task::new(move || gate_rx.recv().unwrap());
    blocker.start_on(&handle).unwrap();

    let task = Task::new_cancelable(|| panic!("must not run"), source.token());
    task.start_on(&handle).unwrap();

    source.cancel();
    gate_tx.send(()).unwrap();

    let err = task.wait().unwrap_err();
    assert!(task.is_canceled(), "got {:?}", err);
    blocker.wait().unwrap();
}

#[test]
fn acknowledged_cancellation_resolves_to_canceled() {
    let source = CancellationSource::new();
    let token = source.token();
    let body_token = token.clone();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();

    let task = ravel::run_cancelable(
        move || {
            started_tx.send(()).unwrap();
            cancel_rx.recv().unwrap();
            if body_token.is_requested() {
                panic::panic_any(OperationCanceled::new(body_token.clone()));
            }
        },
        token.clone(),
    );

    started_rx.recv().unwrap();
    source.cancel();
    cancel_tx.send(()).unwrap();

    let err = task.wait().unwrap_err();
    assert!(task.is_canceled(), "expected canceled, got {:?}", err);
    assert!(!task.is_faulted());
}

#[test]
fn foreign_cancellation_panic_is_a_fault() {
    let other = CancellationSource::new();
    let task = ravel::run(move || {
        panic::panic_any(OperationCanceled::new(other.token()));
    });

    let err = task.wait().unwrap_err();
    assert!(task.is_faulted(), "expected fault, got {:?}", err);
    assert!(!task.is_canceled());
}

#[test]
fn unacknowledged_cancellation_runs_to_completion() {
    let source = CancellationSource::new();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();

    let task = ravel::run_cancelable(
        move || {
            started_tx.send(()).unwrap();
            cancel_rx.recv().unwrap();
            // The body ignores the request entirely.
            11
        },
        source.token(),
    );

    started_rx.recv().unwrap();
    source.cancel();
    cancel_tx.send(()).unwrap();

    assert_eq!(task.result().unwrap(), 11);
    assert_eq!(task.status(), Status::RanToCompletion);
}

#[test]
fn wait_token_interrupts_a_running_task() {
    let wait_source = CancellationSource::new();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let task = ravel::run(move || release_rx.recv().unwrap());

    let canceler = {
        let source = wait_source.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            source.cancel();
        })
    };

    match task.wait_cancelable(&wait_source.token()).unwrap_err() {
        WaitError::Canceled(oc) => {
            assert!(oc.token().same_source(&wait_source.token()));
        }
        other => panic!("expected cancellation, got {:?}", other),
    }

    // The task itself was never canceled; release it and observe the value.
    release_tx.send(()).unwrap();
    task.wait().unwrap();
    canceler.join().unwrap();
}
