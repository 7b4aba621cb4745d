//! Persistent async jobs: acquisition under leases, execution with retry and
//! backoff, dead-lettering, and the executor runtime driving it all.
//!
//! ## Lifecycle
//!
//! ```text
//!  timer_job ──due──▶ job ──claimed──▶ job (locked) ──ok──▶ (deleted)
//!      ▲                                   │
//!      └────────── retries left ◀──failed──┤
//!                                          └──no retries / fatal──▶ deadletter_job
//!  suspended_job: parked by an operator, never acquired
//! ```
//!
//! Moving a job between states is always an insert into the target table plus
//! a delete from the source table inside one unit of work.

pub mod acquire;
pub mod execute;
pub mod handler;
pub mod pool;
pub mod retry;
pub mod runtime;
pub mod service;
pub mod types;

use crate::command::EntityOrder;
use crate::store::ForeignKey;

pub use acquire::{
    AcquireJobsCmd, AcquireTimerJobsCmd, MoveTimerToExecutableCmd, ResetExpiredJobsCmd,
    UnacquireJobCmd, acquirable_query,
};
pub use execute::{ExecuteJobCmd, HandleJobFailureCmd, JobOutcome, execute_job};
pub use handler::{FnHandler, JobError, JobHandler, JobHandlerRegistry};
pub use pool::{PoolStatus, Task, WorkerPool};
pub use retry::{BackoffPolicy, BackoffStrategy, RetryBackoff};
pub use runtime::{AsyncExecutor, AsyncExecutorHandle, CycleReport, ExecutorStats};
pub use service::{JobFilter, JobService, JobStats, create_job};
pub use types::{
    DEADLETTER_JOB_TABLE, DeadLetterJobEntity, ERROR_DETAILS_TABLE, ErrorDetailsEntity,
    JOB_HISTORY_TABLE, JOB_TABLE, JobEntity, JobHistoryEntity, JobOutcomeKind, JobRecord,
    JobState, NewJob, SCOPE_LOCK_TABLE, SUSPENDED_JOB_TABLE, ScopeLockEntity, TIMER_JOB_TABLE,
    TimerJobEntity,
};

/// Every table the job engine uses.
pub fn tables() -> [&'static str; 7] {
    [
        ERROR_DETAILS_TABLE,
        JOB_TABLE,
        TIMER_JOB_TABLE,
        SUSPENDED_JOB_TABLE,
        DEADLETTER_JOB_TABLE,
        JOB_HISTORY_TABLE,
        SCOPE_LOCK_TABLE,
    ]
}

/// Flush order of the job tables: error details are parents of job rows.
pub fn entity_order() -> EntityOrder {
    EntityOrder::new(tables())
}

/// Job rows reference their error details.
pub fn foreign_keys() -> Vec<ForeignKey> {
    JobState::ALL
        .iter()
        .map(|state| ForeignKey::new(state.table(), "exception_stacktrace_ref", ERROR_DETAILS_TABLE))
        .collect()
}
