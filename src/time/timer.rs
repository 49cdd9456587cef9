//! The global timer: one thread driving a deadline-ordered heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

type FireFn = Box<dyn FnOnce() + Send>;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) struct TimerEntry {
    deadline: Instant,
    /// Tie-breaker keeping the heap order total and insertion-stable.
    seq: u64,
    fire: Mutex<Option<FireFn>>,
}

impl TimerEntry {
    fn take_fire(&self) -> Option<FireFn> {
        self.fire.lock().unwrap().take()
    }
}

/// Cancels the entry when asked; a fired entry ignores it.
#[derive(Clone)]
pub(crate) struct TimerHandle {
    entry: Arc<TimerEntry>,
}

impl TimerHandle {
    pub(crate) fn cancel(&self) {
        // The entry stays in the heap and pops as a no-op.
        drop(self.entry.take_fire());
    }
}

struct HeapSlot(Arc<TimerEntry>);

impl PartialEq for HeapSlot {
    fn eq(&self, other: &HeapSlot) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for HeapSlot {}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &HeapSlot) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapSlot {
    fn cmp(&self, other: &HeapSlot) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops
        // first.
        other
            .0
            .deadline
            .cmp(&self.0.deadline)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

struct TimerState {
    heap: BinaryHeap<HeapSlot>,
    thread_started: bool,
}

struct Timer {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

impl Timer {
    fn new() -> Timer {
        Timer {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                thread_started: false,
            }),
            condvar: Condvar::new(),
        }
    }

    fn arm(&'static self, deadline: Instant, fire: FireFn) -> TimerHandle {
        let entry = Arc::new(TimerEntry {
            deadline,
            seq: NEXT_SEQ.fetch_add(1, Relaxed),
            fire: Mutex::new(Some(fire)),
        });

        let mut state = self.state.lock().unwrap();
        state.heap.push(HeapSlot(entry.clone()));
        if !state.thread_started {
            state.thread_started = true;
            std::thread::Builder::new()
                .name("ravel-timer".to_string())
                .spawn(move || self.run())
                .expect("failed to spawn timer thread");
        }
        drop(state);

        self.condvar.notify_one();
        TimerHandle { entry }
    }

    fn run(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            // Fire everything due, outside the lock.
            loop {
                let now = Instant::now();
                let due = state
                    .heap
                    .peek()
                    .map(|slot| slot.0.deadline <= now)
                    .unwrap_or(false);
                if !due {
                    break;
                }
                let entry = state.heap.pop().unwrap().0;
                if let Some(fire) = entry.take_fire() {
                    drop(state);
                    fire();
                    state = self.state.lock().unwrap();
                }
            }

            let next_deadline = state.heap.peek().map(|slot| slot.0.deadline);
            state = match next_deadline {
                None => self.condvar.wait(state).unwrap(),
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    if wait.is_zero() {
                        continue;
                    }
                    self.condvar.wait_timeout(state, wait).unwrap().0
                }
            };
        }
    }
}

lazy_static! {
    static ref TIMER: Timer = Timer::new();
}

/// Arms a one-shot timer; `fire` runs on the timer thread at `deadline`.
pub(crate) fn arm(deadline: Instant, fire: impl FnOnce() + Send + 'static) -> TimerHandle {
    TIMER.arm(deadline, Box::new(fire))
}
