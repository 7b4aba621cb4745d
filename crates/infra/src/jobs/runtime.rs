//! Async executor runtime: the acquisition loop and the lock-recovery loop.
//!
//! Both loops run on their own threads and only talk to the store through
//! commands. Claimed jobs go to a bounded [`WorkerPool`]; when the pool is
//! saturated the next batch shrinks, and a job the pool still rejects is
//! unclaimed again rather than dropped.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use conveyor_core::{EngineError, EngineResult, ExecutorId};

use crate::command::{CommandConfig, CommandExecutor};
use crate::config::AsyncExecutorConfig;

use super::acquire::{
    AcquireJobsCmd, AcquireTimerJobsCmd, MoveTimerToExecutableCmd, ResetExpiredJobsCmd,
    UnacquireJobCmd,
};
use super::execute::{JobOutcome, execute_job};
use super::pool::WorkerPool;

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub acquisition_cycles: u64,
    pub jobs_acquired: u64,
    pub timers_moved: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    /// Released after an optimistic-lock conflict.
    pub jobs_released: u64,
    pub jobs_skipped: u64,
    /// Rejected by the saturated pool and unclaimed again.
    pub jobs_rejected: u64,
    pub locks_reset: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.jobs_completed += 1,
            JobOutcome::Retried { .. } => self.jobs_retried += 1,
            JobOutcome::DeadLettered => self.jobs_dead_lettered += 1,
            JobOutcome::Released | JobOutcome::Unrecorded => self.jobs_released += 1,
            JobOutcome::Skipped => self.jobs_skipped += 1,
        }
    }
}

/// Result of one acquisition cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub timers_moved: usize,
    pub acquired: usize,
    pub submitted: usize,
    pub rejected: usize,
    /// Batch size requested from the store.
    pub requested: usize,
}

type SharedStats = Arc<Mutex<ExecutorStats>>;

fn update_stats(stats: &SharedStats, f: impl FnOnce(&mut ExecutorStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

/// One executor instance: claims jobs for itself and runs them on its pool.
pub struct AsyncExecutor {
    commands: CommandExecutor,
    config: AsyncExecutorConfig,
    executor_id: ExecutorId,
    pool: Arc<WorkerPool>,
    stats: SharedStats,
}

impl std::fmt::Debug for AsyncExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncExecutor")
            .field("executor_id", &self.executor_id)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl AsyncExecutor {
    pub fn new(commands: CommandExecutor, config: AsyncExecutorConfig) -> Self {
        let executor_id = ExecutorId::generate(&config.executor_name);
        let pool = WorkerPool::new(
            config.executor_name.clone(),
            config.core_pool_size,
            config.max_pool_size,
            config.queue_capacity,
            config.keep_alive,
        );
        Self {
            commands,
            config,
            executor_id,
            pool: Arc::new(pool),
            stats: SharedStats::default(),
        }
    }

    /// Use a fixed lock owner id instead of a generated one.
    pub fn with_executor_id(mut self, executor_id: ExecutorId) -> Self {
        self.executor_id = executor_id;
        self
    }

    pub fn executor_id(&self) -> &ExecutorId {
        &self.executor_id
    }

    pub fn config(&self) -> &AsyncExecutorConfig {
        &self.config
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run one acquisition cycle: move due timers, then claim and submit jobs.
    pub fn run_acquisition_cycle(&self) -> EngineResult<CycleReport> {
        let mut report = CycleReport::default();
        update_stats(&self.stats, |s| s.acquisition_cycles += 1);

        let timers = self.commands.execute(
            CommandConfig::default(),
            AcquireTimerJobsCmd {
                executor_id: self.executor_id.clone(),
                max_results: self.config.max_timer_jobs_per_acquisition,
                lock_duration: self.config.timer_lock_duration,
                tenant_id: self.config.tenant_id.clone(),
            },
        )?;
        for timer in timers {
            let moved = self.commands.execute(
                CommandConfig::default(),
                MoveTimerToExecutableCmd {
                    timer_id: timer.id,
                    executor_id: self.executor_id.clone(),
                },
            );
            match moved {
                Ok(Some(_)) => report.timers_moved += 1,
                Ok(None) => {}
                // the timer lease expires and another cycle picks it up
                Err(err) => warn!(job_id = %timer.id, error = %err, "failed to move timer"),
            }
        }

        report.requested = self
            .config
            .max_async_jobs_per_acquisition
            .min(self.pool.remaining_capacity());
        if report.requested == 0 {
            debug!(executor_id = %self.executor_id, "worker pool saturated, skipping acquisition");
        } else {
            let jobs = self.commands.execute(
                CommandConfig::default(),
                AcquireJobsCmd {
                    executor_id: self.executor_id.clone(),
                    max_results: report.requested,
                    lock_duration: self.config.lock_duration,
                    tenant_id: self.config.tenant_id.clone(),
                },
            )?;
            report.acquired = jobs.len();
            for job in jobs {
                if self.submit(job.id) {
                    report.submitted += 1;
                } else {
                    report.rejected += 1;
                    self.unacquire(job.id);
                }
            }
        }

        update_stats(&self.stats, |s| {
            s.timers_moved += report.timers_moved as u64;
            s.jobs_acquired += report.acquired as u64;
            s.jobs_rejected += report.rejected as u64;
        });
        if report.acquired > 0 || report.timers_moved > 0 {
            debug!(
                executor_id = %self.executor_id,
                timers_moved = report.timers_moved,
                acquired = report.acquired,
                rejected = report.rejected,
                "acquisition cycle"
            );
        }
        Ok(report)
    }

    /// Clear expired leases. Returns the number of jobs made acquirable again.
    pub fn run_lock_recovery(&self) -> EngineResult<usize> {
        let reset = self.commands.execute(
            CommandConfig::default(),
            ResetExpiredJobsCmd {
                page_size: self.config.reset_expired_page_size,
            },
        )?;
        if reset > 0 {
            info!(executor_id = %self.executor_id, reset, "expired job locks reset");
            update_stats(&self.stats, |s| s.locks_reset += reset as u64);
        }
        Ok(reset)
    }

    fn submit(&self, job_id: conveyor_core::JobId) -> bool {
        let commands = self.commands.clone();
        let executor_id = self.executor_id.clone();
        let stats = Arc::clone(&self.stats);
        let task = Box::new(move || {
            update_stats(&stats, |s| s.current_running += 1);
            let outcome = execute_job(&commands, job_id, &executor_id);
            update_stats(&stats, |s| {
                s.current_running = s.current_running.saturating_sub(1);
                s.record(&outcome);
            });
        });
        self.pool.try_submit(task).is_ok()
    }

    fn unacquire(&self, job_id: conveyor_core::JobId) {
        let result = self.commands.execute(
            CommandConfig::default(),
            UnacquireJobCmd {
                job_id,
                executor_id: self.executor_id.clone(),
            },
        );
        if let Err(err) = result {
            // the lease expires on its own
            warn!(%job_id, error = %err, "failed to unacquire rejected job");
        }
    }

    /// Start both loops on background threads.
    ///
    /// An executor whose config is not activated starts nothing; the handle
    /// then only owns the idle pool.
    pub fn start(self) -> EngineResult<AsyncExecutorHandle> {
        let executor = Arc::new(self);
        let started = Instant::now();
        let mut handle = AsyncExecutorHandle {
            executor: Arc::clone(&executor),
            loops: Vec::new(),
            started,
        };
        if !executor.config.activate {
            info!(executor_id = %executor.executor_id, "async executor not activated");
            return Ok(handle);
        }

        let acquisition = Arc::clone(&executor);
        handle.spawn_loop("acquire", move || {
            let report = acquisition.run_acquisition_cycle();
            update_stats(&acquisition.stats, |s| {
                s.uptime_secs = started.elapsed().as_secs();
            });
            match report {
                // a full batch suggests more work is waiting
                Ok(r) if r.requested > 0 && r.acquired == r.requested => Duration::ZERO,
                Ok(_) => acquisition.config.acquire_interval,
                Err(err) => {
                    error!(executor_id = %acquisition.executor_id, error = %err, "acquisition cycle failed");
                    acquisition.config.acquire_interval
                }
            }
        })?;

        let recovery = Arc::clone(&executor);
        handle.spawn_loop("reset-expired", move || {
            if let Err(err) = recovery.run_lock_recovery() {
                error!(executor_id = %recovery.executor_id, error = %err, "lock recovery failed");
            }
            recovery.config.reset_expired_interval
        })?;

        info!(
            executor_id = %executor.executor_id,
            core_pool_size = executor.config.core_pool_size,
            max_pool_size = executor.config.max_pool_size,
            "async executor started"
        );
        Ok(handle)
    }
}

struct LoopThread {
    shutdown: mpsc::Sender<()>,
    join: thread::JoinHandle<()>,
}

/// Handle to a running executor.
#[derive(Debug)]
pub struct AsyncExecutorHandle {
    executor: Arc<AsyncExecutor>,
    loops: Vec<LoopThread>,
    started: Instant,
}

impl std::fmt::Debug for LoopThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopThread")
            .field("thread", &self.join.thread().name())
            .finish()
    }
}

impl AsyncExecutorHandle {
    /// Run `tick` repeatedly, waiting the returned interval between runs.
    fn spawn_loop(
        &mut self,
        kind: &str,
        mut tick: impl FnMut() -> Duration + Send + 'static,
    ) -> EngineResult<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = format!("{}-{kind}", self.executor.config.executor_name);
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                loop {
                    let wait = tick();
                    match shutdown_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(thread = %name, "executor loop stopped");
            })
            .map_err(|e| EngineError::illegal_state(format!("failed to spawn executor thread: {e}")))?;
        self.loops.push(LoopThread {
            shutdown: shutdown_tx,
            join,
        });
        Ok(())
    }

    pub fn executor_id(&self) -> &ExecutorId {
        self.executor.executor_id()
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.executor.stats();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Stop both loops, then let the pool finish running jobs.
    ///
    /// Jobs still running after the shutdown timeout keep their leases,
    /// which expire and make them recoverable by other executors.
    pub fn shutdown(self) -> ExecutorStats {
        for lp in &self.loops {
            let _ = lp.shutdown.send(());
        }
        for lp in self.loops {
            if lp.join.join().is_err() {
                error!("executor loop thread panicked");
            }
        }
        let drained = self.executor.pool.shutdown(self.executor.config.shutdown_timeout);
        let mut stats = self.executor.stats();
        stats.uptime_secs = self.started.elapsed().as_secs();
        info!(
            executor_id = %self.executor.executor_id,
            drained,
            completed = stats.jobs_completed,
            dead_lettered = stats.jobs_dead_lettered,
            "async executor stopped"
        );
        stats
    }
}
