#![warn(rust_2018_idioms)]

use ravel::cancel::CancellationSource;
use ravel::Task;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn zero_timeout_never_blocks() {
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let task = ravel::run(move || gate_rx.recv().unwrap());

    let started = Instant::now();
    assert!(!task.wait_timeout(Duration::ZERO).unwrap());
    assert!(started.elapsed() < Duration::from_millis(50));

    gate_tx.send(()).unwrap();
    task.wait().unwrap();
}

#[test]
fn timeout_elapses_then_completion_succeeds() {
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let task = ravel::run(move || gate_rx.recv().unwrap());

    assert!(!task.wait_timeout(Duration::from_millis(30)).unwrap());
    assert!(!task.is_completed());

    gate_tx.send(()).unwrap();
    assert!(task.wait_timeout(Duration::from_secs(5)).unwrap());
}

#[test]
fn unbounded_wait_blocks_until_completion() {
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let task = ravel::run(move || gate_rx.recv().unwrap());

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(40));
        gate_tx.send(()).unwrap();
    });

    task.wait().unwrap();
    assert!(task.is_completed());
    releaser.join().unwrap();
}

#[test]
fn signaled_wait_token_does_not_mask_a_clean_completion() {
    let source = CancellationSource::new();
    let task = ravel::run(|| 3);
    task.wait().unwrap();

    source.cancel();
    // Task completed and token signaled: the token only wins if it canceled
    // the task itself, which it did not.
    assert!(task
        .wait_timeout_cancelable(Duration::from_millis(10), &source.token())
        .unwrap());
}

#[test]
fn wait_all_collects_every_failure() {
    let ok = ravel::run(|| ());

    let boom = ravel::run(|| panic!("boom"));

    let source = CancellationSource::new();
    source.cancel();
    let canceled = ravel::run_cancelable(|| (), source.token());

    let tasks = vec![ok, boom, canceled];
    let err = ravel::wait_all(&tasks).unwrap_err();

    assert_eq!(err.failures().len(), 2);
    assert_eq!(
        err.failures()
            .iter()
            .filter(|f| f.is_cancellation())
            .count(),
        1
    );
}

#[test]
fn wait_all_on_successes_returns_cleanly() {
    let tasks: Vec<Task<usize>> = (0..8).map(|i| ravel::run(move || i * i)).collect();
    ravel::wait_all(&tasks).unwrap();
    for (i, task) in tasks.iter().enumerate() {
        assert_eq!(task.try_result(), Some(i * i));
    }
}

#[test]
fn wait_all_times_out_without_throwing() {
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let slow = ravel::run(move || gate_rx.recv().unwrap());
    let failed: Task<()> = Task::from_error("already bad");

    let tasks = vec![slow, failed];
    // Timed out: incomplete constituents suppress the failure scan.
    assert!(
        !ravel::wait_all_timeout(&tasks, Some(Duration::from_millis(30))).unwrap()
    );

    gate_tx.send(()).unwrap();
    assert!(ravel::wait_all_timeout(&tasks, None).is_err());
}

#[test]
fn wait_any_returns_the_first_finisher() {
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let slow = ravel::run(move || gate_rx.recv().unwrap());
    let quick = ravel::run(|| ());

    let tasks = vec![slow, quick];
    assert_eq!(ravel::wait_any(&tasks), 1);

    gate_tx.send(()).unwrap();
    ravel::wait_all(&tasks).unwrap();
}

#[test]
fn wait_any_sees_an_already_completed_task() {
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let pending = ravel::run(move || gate_rx.recv().unwrap());
    let done = Task::from_result(());

    let tasks = vec![done, pending];
    assert_eq!(ravel::wait_any(&tasks), 0);

    gate_tx.send(()).unwrap();
    ravel::wait_all(&tasks).unwrap();
}

#[test]
fn wait_any_timeout_expires() {
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let pending = ravel::run(move || gate_rx.recv().unwrap());

    let tasks = vec![pending];
    assert_eq!(
        ravel::wait_any_timeout(&tasks, Some(Duration::from_millis(30))),
        None
    );

    gate_tx.send(()).unwrap();
    ravel::wait_all(&tasks).unwrap();
}
