//! Delayed-work scheduling for pool purge workers.
//!
//! Each pool arms a single delayed purge task when it becomes non-empty.
//! The allocator only needs two operations from the executor: schedule a
//! job after a delay, and cancel one synchronously, where "synchronously"
//! means that if the job is mid-run, cancellation waits for it to finish.
//!
//! `ThreadTimer` is the production executor: one named timer thread
//! draining a deadline heap. `ManualScheduler` holds jobs until told to run
//! them, which is how tests drive purge deterministically under a
//! [`ManualClock`](crate::clock::ManualClock).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// A deferred unit of work.
pub type PurgeJob = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a scheduled job for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// Executor interface for delayed purge work.
pub trait PurgeScheduler: Send + Sync {
    /// Schedules `job` to run once, `after` from now.
    fn schedule(&self, after: Duration, job: PurgeJob) -> TaskHandle;

    /// Cancels a scheduled job. If the job is already running, waits for
    /// the run to complete; if it already ran, this is a no-op.
    fn cancel_sync(&self, handle: TaskHandle);
}

struct Pending {
    deadline: Instant,
    id: u64,
    job: PurgeJob,
}

// BinaryHeap is a max-heap; order by reversed deadline so the earliest
// deadline surfaces first.
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Pending {}

struct TimerState {
    queue: BinaryHeap<Pending>,
    next_id: u64,
    running: Option<u64>,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// A dedicated timer thread executing jobs at their deadlines.
pub struct ThreadTimer {
    shared: Arc<TimerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTimer {
    /// Spawns the timer thread.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                next_id: 1,
                running: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("sgv-purge-timer".to_string())
            .spawn(move || Self::run(&worker_shared))
            .expect("failed to spawn sgv-purge-timer thread");

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn run(shared: &TimerShared) {
        loop {
            let due = {
                let mut state = shared.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    match state.queue.peek() {
                        None => {
                            shared.cond.wait(&mut state);
                        }
                        Some(next) => {
                            let now = Instant::now();
                            if next.deadline <= now {
                                break;
                            }
                            let wait = next.deadline - now;
                            shared.cond.wait_for(&mut state, wait);
                        }
                    }
                }
                let due = state.queue.pop().expect("peeked entry vanished");
                state.running = Some(due.id);
                due
            };

            (due.job)();

            let mut state = shared.state.lock();
            state.running = None;
            shared.cond.notify_all();
        }
    }
}

impl Default for ThreadTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PurgeScheduler for ThreadTimer {
    fn schedule(&self, after: Duration, job: PurgeJob) -> TaskHandle {
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.queue.push(Pending {
            deadline: Instant::now() + after,
            id,
            job,
        });
        self.shared.cond.notify_all();
        TaskHandle(id)
    }

    fn cancel_sync(&self, handle: TaskHandle) {
        let mut state = self.shared.state.lock();
        state.queue.retain(|p| p.id != handle.0);
        while state.running == Some(handle.0) {
            self.shared.cond.wait(&mut state);
        }
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

struct ManualTask {
    id: u64,
    job: PurgeJob,
}

struct ManualState {
    pending: Vec<ManualTask>,
    next_id: u64,
}

/// An executor that runs jobs only when explicitly asked to.
///
/// Delays are recorded but not waited for; combine with a manual clock to
/// control what the jobs observe.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl Default for ManualState {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            next_id: 1,
        }
    }
}

impl ManualScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Runs every currently pending job on the calling thread.
    ///
    /// Jobs scheduled *by* those jobs are left pending, so a self-rearming
    /// worker runs exactly once per call. Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let batch = std::mem::take(&mut self.state.lock().pending);
        let count = batch.len();
        for task in batch {
            (task.job)();
        }
        count
    }
}

impl PurgeScheduler for ManualScheduler {
    fn schedule(&self, _after: Duration, job: PurgeJob) -> TaskHandle {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.pending.push(ManualTask { id, job });
        TaskHandle(id)
    }

    fn cancel_sync(&self, handle: TaskHandle) {
        self.state.lock().pending.retain(|t| t.id != handle.0);
    }
}
