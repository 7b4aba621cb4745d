//! Bounded worker pool for job execution.
//!
//! Submission follows the classic core/queue/max policy: start a thread while
//! fewer than `core` run, otherwise queue while the queue has room, otherwise
//! start a thread while fewer than `max` run, otherwise reject and hand the
//! task back. Threads above the core size exit after `keep_alive` idle.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

/// Unit of work run by the pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Task>,
    threads: usize,
    idle: usize,
    active: usize,
    spawned: usize,
    shutdown: bool,
}

struct PoolShared {
    name: String,
    core: usize,
    max: usize,
    capacity: usize,
    keep_alive: Duration,
    state: Mutex<PoolState>,
    work_available: Condvar,
    terminated: Condvar,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // tasks never run under the lock, so a poisoned guard still holds consistent state
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub threads: usize,
    pub active: usize,
    pub queued: usize,
}

/// Thread pool with a bounded queue that rejects instead of blocking.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("status", &self.status())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(
        name: impl Into<String>,
        core: usize,
        max: usize,
        capacity: usize,
        keep_alive: Duration,
    ) -> Self {
        let max = max.max(1);
        Self {
            shared: Arc::new(PoolShared {
                name: name.into(),
                core: core.min(max),
                max,
                capacity,
                keep_alive,
                state: Mutex::new(PoolState::default()),
                work_available: Condvar::new(),
                terminated: Condvar::new(),
            }),
        }
    }

    /// Submit a task, or get it back if the pool is saturated or shut down.
    pub fn try_submit(&self, task: Task) -> Result<(), Task> {
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(task);
        }
        if state.threads < self.shared.core {
            return self.spawn_worker(state, task);
        }
        if state.queue.len() < self.shared.capacity {
            state.queue.push_back(task);
            drop(state);
            self.shared.work_available.notify_one();
            return Ok(());
        }
        if state.threads < self.shared.max {
            return self.spawn_worker(state, task);
        }
        Err(task)
    }

    /// How many tasks can be submitted right now without rejection.
    pub fn remaining_capacity(&self) -> usize {
        let state = self.shared.lock();
        if state.shutdown {
            return 0;
        }
        self.shared.capacity.saturating_sub(state.queue.len())
            + self.shared.max.saturating_sub(state.threads)
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock();
        PoolStatus {
            threads: state.threads,
            active: state.active,
            queued: state.queue.len(),
        }
    }

    /// Stop accepting tasks, let queued tasks drain and wait for the workers.
    ///
    /// Returns `false` if workers were still running when `timeout` elapsed.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        state.shutdown = true;
        self.shared.work_available.notify_all();
        while state.threads > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    pool = %self.shared.name,
                    threads = state.threads,
                    queued = state.queue.len(),
                    "worker pool did not drain before the shutdown timeout"
                );
                return false;
            }
            state = self
                .shared
                .terminated
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        debug!(pool = %self.shared.name, "worker pool stopped");
        true
    }

    fn spawn_worker(&self, mut state: MutexGuard<'_, PoolState>, task: Task) -> Result<(), Task> {
        state.threads += 1;
        state.spawned += 1;
        let thread_name = format!("{}-worker-{}", self.shared.name, state.spawned);
        drop(state);

        // lets a failed spawn hand the task back
        let slot = Arc::new(Mutex::new(Some(task)));
        let first = Arc::clone(&slot);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new().name(thread_name).spawn(move || {
            let task = first.lock().unwrap_or_else(PoisonError::into_inner).take();
            worker_loop(&shared, task);
        });

        match spawned {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(pool = %self.shared.name, error = %err, "failed to spawn worker thread");
                self.shared.lock().threads -= 1;
                let task = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                match task {
                    Some(task) => Err(task),
                    None => Ok(()),
                }
            }
        }
    }
}

fn run_task(shared: &PoolShared, task: Task) {
    shared.lock().active += 1;
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!(pool = %shared.name, "worker task panicked");
    }
    shared.lock().active -= 1;
}

fn worker_loop(shared: &PoolShared, first: Option<Task>) {
    if let Some(task) = first {
        run_task(shared, task);
    }
    loop {
        let mut state = shared.lock();
        let task = loop {
            if let Some(task) = state.queue.pop_front() {
                break Some(task);
            }
            if state.shutdown {
                break None;
            }
            state.idle += 1;
            let (next, timeout) = shared
                .work_available
                .wait_timeout(state, shared.keep_alive)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
            state.idle -= 1;
            if timeout.timed_out() && state.queue.is_empty() && state.threads > shared.core {
                break None;
            }
        };
        match task {
            Some(task) => {
                drop(state);
                run_task(shared, task);
            }
            None => {
                state.threads -= 1;
                drop(state);
                shared.terminated.notify_all();
                return;
            }
        }
    }
}
