#![warn(rust_2018_idioms)]

use ravel::cancel::CancellationSource;
use ravel::{ContinueOptions, Status, Task};

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

#[test]
fn continuation_transforms_the_result() {
    let task = ravel::run(|| 20);
    let doubled = task.continue_with(|t| t.try_result().unwrap() * 2 + 2);
    assert_eq!(doubled.result().unwrap(), 42);
}

#[test]
fn continuation_after_completion_runs_on_the_registering_thread() {
    let task = ravel::run(|| 5);
    task.wait().unwrap();

    let registering = thread::current().id();
    let cont = task.continue_with_opts(
        move |_| thread::current().id() == registering,
        ravel::cancel::CancellationToken::none(),
        ContinueOptions::EXECUTE_SYNCHRONOUSLY,
        None,
    );

    assert!(cont.result().unwrap());
}

#[test]
fn continuation_runs_exactly_once() {
    let fired = Arc::new(AtomicUsize::new(0));
    let (gate_tx, gate_rx) = mpsc::channel::<()>();

    let task = ravel::run(move || gate_rx.recv().unwrap());
    let f = fired.clone();
    let cont = task.continue_with(move |_| {
        f.fetch_add(1, SeqCst);
    });

    gate_tx.send(()).unwrap();
    cont.wait().unwrap();
    assert_eq!(fired.load(SeqCst), 1);
}

#[test]
fn synchronous_continuation_runs_on_the_completer_thread() {
    let (registered_tx, registered_rx) = mpsc::channel::<()>();

    let task = ravel::run(move || {
        registered_rx.recv().unwrap();
        thread::current().id()
    });

    let cont = task.continue_with_opts(
        |t| {
            let completer = t.try_result().unwrap();
            thread::current().id() == completer
        },
        ravel::cancel::CancellationToken::none(),
        ContinueOptions::EXECUTE_SYNCHRONOUSLY,
        None,
    );

    registered_tx.send(()).unwrap();
    assert!(cont.result().unwrap());
}

#[test]
fn gating_cancels_the_excluded_path() {
    let ok = ravel::run(|| 1);
    ok.wait().unwrap();

    let on_fault = ok.continue_with_opts(
        |_| "ran on fault",
        ravel::cancel::CancellationToken::none(),
        ContinueOptions::ONLY_ON_FAULTED,
        None,
    );
    assert!(on_fault.is_canceled());

    let failed: Task<u32> = Task::from_error("down");
    let on_success = failed.continue_with_opts(
        |_| "ran on success",
        ravel::cancel::CancellationToken::none(),
        ContinueOptions::ONLY_ON_RAN_TO_COMPLETION,
        None,
    );
    assert!(on_success.is_canceled());

    let on_fault = failed.continue_with_opts(
        |t| t.exception().is_some(),
        ravel::cancel::CancellationToken::none(),
        ContinueOptions::ONLY_ON_FAULTED,
        None,
    );
    assert!(on_fault.result().unwrap());
}

#[test]
fn canceled_token_cancels_a_pending_continuation() {
    let source = CancellationSource::new();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();

    let task = ravel::run(move || gate_rx.recv().unwrap());
    let cont = task.continue_with_opts(
        |_| "never",
        source.token(),
        ContinueOptions::NONE,
        None,
    );

    source.cancel();
    assert!(cont.is_canceled());

    gate_tx.send(()).unwrap();
    task.wait().unwrap();
    // The antecedent's completion does not resurrect the continuation.
    assert_eq!(cont.status(), Status::Canceled);
}

#[test]
fn lazy_cancellation_waits_for_the_antecedent() {
    let source = CancellationSource::new();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();

    let task = ravel::run(move || gate_rx.recv().unwrap());
    let cont = task.continue_with_opts(
        |_| "never",
        source.token(),
        ContinueOptions::LAZY_CANCELLATION,
        None,
    );

    source.cancel();
    // Not canceled yet: the antecedent is still running.
    assert!(!cont.is_completed());

    gate_tx.send(()).unwrap();
    let err = cont.wait().unwrap_err();
    assert!(cont.is_canceled(), "expected canceled, got {:?}", err);
}

#[test]
fn continuations_chain() {
    let task = ravel::run(|| 1u32);
    let c1 = task.continue_with(|t| t.try_result().unwrap() + 1);
    let c2 = c1.continue_with(|t| t.try_result().unwrap() * 10);
    assert_eq!(c2.result().unwrap(), 20);
}

#[test]
fn continuation_tasks_cannot_be_started() {
    let task = ravel::run(|| ());
    let cont = task.continue_with(|_| ());
    assert_eq!(cont.start(), Err(ravel::StartError::Continuation));
    cont.wait().unwrap();
}
