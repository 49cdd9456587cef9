#![warn(rust_2018_idioms)]

use ravel::cancel::CancellationSource;
use ravel::{CreationOptions, Status, Task, WaitError};

use std::sync::mpsc;
use std::time::Duration;

fn attached() -> CreationOptions {
    CreationOptions::ATTACHED_TO_PARENT
}

// `ravel::run` denies child attachment by design, so parents that expect
// attached children are spawned the long way.
fn spawn_parent<T: Send + 'static>(body: impl FnOnce() -> T + Send + 'static) -> Task<T> {
    let parent = Task::new(body);
    parent.start().unwrap();
    parent
}

#[test]
fn parent_adopts_child_fault_and_cancellation() {
    let parent = spawn_parent(|| {
        let faulting = Task::new_with(|| panic!("E1"), attached());
        faulting.start().unwrap();

        let fine = Task::new_with(|| (), attached());
        fine.start().unwrap();

        // Attached, bound to an already-canceled token: completes as
        // canceled without running.
        let source = CancellationSource::new();
        source.cancel();
        let canceled = Task::new_with_all(|| (), None, source.token(), attached());
        assert!(canceled.is_canceled());
    });

    match parent.wait().unwrap_err() {
        WaitError::Faulted(agg) => {
            assert_eq!(agg.failures().len(), 2);
            let panics = agg
                .failures()
                .iter()
                .filter_map(|f| f.panic_payload())
                .count();
            let cancels = agg
                .failures()
                .iter()
                .filter(|f| f.is_cancellation())
                .count();
            assert_eq!(panics, 1);
            assert_eq!(cancels, 1);
        }
        other => panic!("expected fault, got {:?}", other),
    }
    assert_eq!(parent.status(), Status::Faulted);
}

#[test]
fn parent_does_not_complete_before_attached_children() {
    let (child_gate_tx, child_gate_rx) = mpsc::channel::<()>();
    let (spawned_tx, spawned_rx) = mpsc::channel::<()>();

    let parent = spawn_parent(move || {
        let child = Task::new_with(move || child_gate_rx.recv().unwrap(), attached());
        child.start().unwrap();
        spawned_tx.send(()).unwrap();
    });

    spawned_rx.recv().unwrap();

    // The body has returned (or is about to); the child is still blocked, so
    // the parent cannot be terminal.
    assert!(!parent.wait_timeout(Duration::from_millis(50)).unwrap());
    assert!(!parent.is_completed());

    child_gate_tx.send(()).unwrap();
    parent.wait().unwrap();
    assert_eq!(parent.status(), Status::RanToCompletion);
}

#[test]
fn deny_child_attach_blocks_attachment() {
    let (observed_tx, observed_rx) = mpsc::channel();

    let parent = Task::new_with(
        move || {
            let child = Task::new_with(|| panic!("child fault"), attached());
            child.start().unwrap();
            observed_tx.send(child).unwrap();
        },
        CreationOptions::DENY_CHILD_ATTACH,
    );
    parent.start().unwrap();

    // The parent completes cleanly; the child was never attached.
    parent.wait().unwrap();
    assert_eq!(parent.status(), Status::RanToCompletion);

    // Observe the orphan's failure so it has a consumer.
    let child = observed_rx.recv().unwrap();
    assert!(child.wait().is_err());
}

#[test]
fn child_failure_observed_by_parent_is_not_resurfaced() {
    let parent = spawn_parent(|| {
        let child = Task::new_with(|| panic!("seen"), attached());
        child.start().unwrap();
        // The body waits on the child and handles the failure itself.
        assert!(child.wait().is_err());
    });

    parent.wait().unwrap();
    assert_eq!(parent.status(), Status::RanToCompletion);
}

#[test]
fn grandchildren_propagate_through_the_chain() {
    let parent = spawn_parent(|| {
        let child = Task::new_with(
            || {
                let grandchild = Task::new_with(|| panic!("deep"), attached());
                grandchild.start().unwrap();
            },
            attached(),
        );
        child.start().unwrap();
    });

    match parent.wait().unwrap_err() {
        WaitError::Faulted(agg) => {
            assert_eq!(agg.failures().len(), 1);
            assert_eq!(
                agg.failures()[0].panic_payload().unwrap().message(),
                Some("deep")
            );
        }
        other => panic!("expected fault, got {:?}", other),
    }
}
