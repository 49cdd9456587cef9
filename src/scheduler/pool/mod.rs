//! The default scheduler: a work-stealing thread pool.
//!
//! Each worker owns a local deque; tasks submitted from outside the pool
//! (and tasks asking for FIFO fairness) land in a shared injector queue.
//! A worker drains its own deque first, then the injector, then scans the
//! other workers' deques for something to steal. Workers with nothing to do
//! park on a condvar and are notified on submission.
//!
//! Long-running tasks bypass the workers entirely and get a dedicated
//! thread, so a task that blocks for its whole life never starves the pool.

use crate::scheduler::{QueueError, QueuedTask, Schedule, SchedulerHandle, SpawnHint};
use crate::task::current;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::CachePadded;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// How long a worker with nothing to do sleeps before rescanning. Bounds
/// the window in which work sitting in another worker's deque can go
/// unnoticed by a parked thread.
const PARK_TIMEOUT: Duration = Duration::from_millis(100);

thread_local! {
    static LOCAL: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

struct LocalQueue {
    pool_id: usize,
    worker: Rc<Worker<QueuedTask>>,
}

/// Configures and builds a [`Pool`].
#[derive(Debug)]
pub struct Builder {
    workers: usize,
    name_prefix: String,
    stack_size: Option<usize>,
}

impl Builder {
    /// A builder with one worker per logical CPU.
    pub fn new() -> Builder {
        Builder {
            workers: num_cpus::get().max(1),
            name_prefix: "ravel-worker".to_string(),
            stack_size: None,
        }
    }

    /// Sets the number of worker threads.
    pub fn workers(mut self, workers: usize) -> Builder {
        assert!(workers > 0, "pool requires at least one worker");
        self.workers = workers;
        self
    }

    /// Sets the prefix used for worker thread names.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Builder {
        self.name_prefix = prefix.into();
        self
    }

    /// Sets the stack size for worker threads.
    pub fn stack_size(mut self, stack_size: usize) -> Builder {
        self.stack_size = Some(stack_size);
        self
    }

    /// Spawns the workers and returns the pool.
    pub fn build(self) -> Arc<Pool> {
        let pool_id = NEXT_POOL_ID.fetch_add(1, SeqCst);

        let workers: Vec<Worker<QueuedTask>> =
            (0..self.workers).map(|_| Worker::new_fifo()).collect();
        let stealers: Box<[Stealer<QueuedTask>]> =
            workers.iter().map(Worker::stealer).collect();

        let inner = Arc::new(Inner {
            pool_id,
            injector: Injector::new(),
            stealers,
            sleep: CachePadded::new(Sleep {
                sleepers: Mutex::new(0),
                condvar: Condvar::new(),
            }),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::with_capacity(self.workers)),
            name_prefix: self.name_prefix.clone(),
            next_dedicated: AtomicUsize::new(0),
        });

        for (index, worker) in workers.into_iter().enumerate() {
            let worker_inner = inner.clone();
            let mut thread = std::thread::Builder::new()
                .name(format!("{}-{}", self.name_prefix, index));
            if let Some(stack_size) = self.stack_size {
                thread = thread.stack_size(stack_size);
            }
            let handle = thread
                .spawn(move || run_worker(worker_inner, index, worker))
                .expect("failed to spawn pool worker");
            inner.threads.lock().unwrap().push(handle);
        }

        Arc::new(Pool { inner })
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

/// A work-stealing thread pool implementing [`Schedule`].
#[derive(Debug)]
pub struct Pool {
    inner: Arc<Inner>,
}

struct Sleep {
    sleepers: Mutex<usize>,
    condvar: Condvar,
}

struct Inner {
    pool_id: usize,
    injector: Injector<QueuedTask>,
    stealers: Box<[Stealer<QueuedTask>]>,
    sleep: CachePadded<Sleep>,
    shutdown: AtomicBool,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    name_prefix: String,
    next_dedicated: AtomicUsize,
}

impl Inner {
    fn notify_one(&self) {
        let sleepers = self.sleep.sleepers.lock().unwrap();
        if *sleepers > 0 {
            self.sleep.condvar.notify_one();
        }
    }

    fn notify_all(&self) {
        let _sleepers = self.sleep.sleepers.lock().unwrap();
        self.sleep.condvar.notify_all();
    }
}

impl Pool {
    /// Stops accepting tasks and joins the workers. Queued tasks that never
    /// ran are dropped. Idempotent; called from `Drop` as well.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, SeqCst);
        self.inner.notify_all();

        let on_own_worker = LOCAL.with(|local| {
            local
                .borrow()
                .as_ref()
                .map(|l| l.pool_id == self.inner.pool_id)
                .unwrap_or(false)
        });
        if on_own_worker {
            // A worker cannot join itself; threads exit on the flag alone.
            return;
        }

        let threads = std::mem::take(&mut *self.inner.threads.lock().unwrap());
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Schedule for Pool {
    fn queue(&self, task: QueuedTask, hint: SpawnHint) -> Result<(), QueueError> {
        if self.inner.shutdown.load(SeqCst) {
            return Err(QueueError::Shutdown);
        }

        if hint.long_running() {
            let n = self.inner.next_dedicated.fetch_add(1, SeqCst);
            let name = format!("{}-dedicated-{}", self.inner.name_prefix, n);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || {
                    task.raw().run_tolerant();
                })
                .map_err(|_| QueueError::Shutdown)?;
            self.inner.threads.lock().unwrap().push(handle);
            return Ok(());
        }

        let mut task = Some(task);
        let pushed_local = !hint.prefer_fairness()
            && LOCAL.with(|local| match &*local.borrow() {
                Some(l) if l.pool_id == self.inner.pool_id => {
                    l.worker.push(task.take().unwrap());
                    true
                }
                _ => false,
            });

        if pushed_local {
            tracing::trace!(pool = self.inner.pool_id, "task pushed to local queue");
        } else {
            // From outside the pool, or fairness was requested: the shared
            // FIFO injector.
            self.inner.injector.push(task.take().unwrap());
            tracing::trace!(pool = self.inner.pool_id, "task pushed to injector");
        }

        self.inner.notify_one();
        Ok(())
    }

    fn try_inline(&self, task: &QueuedTask, _was_queued: bool) -> bool {
        // Stealing deques have no targeted removal, so a still-queued task
        // cannot be claimed here. Inlining is safe anyway: execution entry
        // is claimed atomically, and the worker that eventually pops the
        // task finds the claim taken and drops it.
        match current::reserve_inline_depth() {
            Some(_depth) => {
                task.raw().run_tolerant();
                true
            }
            None => false,
        }
    }

    fn try_dequeue(&self, _task: &QueuedTask) -> bool {
        false
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Inner")
            .field("pool_id", &self.pool_id)
            .field("workers", &self.stealers.len())
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

fn run_worker(inner: Arc<Inner>, index: usize, worker: Worker<QueuedTask>) {
    let worker = Rc::new(worker);
    LOCAL.with(|local| {
        *local.borrow_mut() = Some(LocalQueue {
            pool_id: inner.pool_id,
            worker: worker.clone(),
        });
    });

    tracing::trace!(pool = inner.pool_id, worker = index, "worker started");

    let mut rng = XorShift::new(index);

    loop {
        if let Some(task) = next_task(&inner, index, &worker, &mut rng) {
            task.raw().run_tolerant();
            continue;
        }

        if inner.shutdown.load(SeqCst) {
            break;
        }

        park(&inner);
    }

    LOCAL.with(|local| local.borrow_mut().take());
    tracing::trace!(pool = inner.pool_id, worker = index, "worker stopped");
}

fn next_task(
    inner: &Inner,
    index: usize,
    worker: &Worker<QueuedTask>,
    rng: &mut XorShift,
) -> Option<QueuedTask> {
    if let Some(task) = worker.pop() {
        return Some(task);
    }

    loop {
        match inner.injector.steal_batch_and_pop(worker) {
            Steal::Success(task) => return Some(task),
            Steal::Empty => break,
            Steal::Retry => {}
        }
    }

    // Scan the other workers from a random starting point, so contending
    // thieves spread out instead of all hammering worker zero.
    let n = inner.stealers.len();
    let start = rng.next() as usize % n;
    for offset in 0..n {
        let victim = (start + offset) % n;
        if victim == index {
            continue;
        }
        loop {
            match inner.stealers[victim].steal_batch_and_pop(worker) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
    }

    None
}

fn park(inner: &Inner) {
    let mut sleepers = inner.sleep.sleepers.lock().unwrap();
    // Re-check under the lock: a submitter that pushed before taking this
    // lock is about to notify, so going to sleep now is safe; one that
    // pushed earlier is visible in the injector here.
    if inner.shutdown.load(SeqCst) || !inner.injector.is_empty() {
        return;
    }
    *sleepers += 1;
    let (mut sleepers, _timed_out) = inner
        .sleep
        .condvar
        .wait_timeout(sleepers, PARK_TIMEOUT)
        .unwrap();
    *sleepers -= 1;
}

/// The victim-selection generator: a xorshift, one per worker, seeded off
/// the worker index.
struct XorShift(u32);

impl XorShift {
    fn new(index: usize) -> XorShift {
        XorShift((index as u32).wrapping_mul(0x9E37_79B9) | 1)
    }

    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

lazy_static! {
    static ref DEFAULT_POOL: Arc<Pool> = Builder::new().build();
}

/// The process-wide default pool, built on first use with one worker per
/// logical CPU.
pub fn default_pool() -> SchedulerHandle {
    let pool: Arc<Pool> = Arc::clone(&DEFAULT_POOL);
    pool
}
