//! Running one claimed job and recording its outcome.
//!
//! Each job runs in its own command context. If the handler or the flush
//! fails, that context rolls back and a second, independent context records
//! the failure: retry via the timer table, or dead-letter.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use conveyor_core::{EngineError, EngineResult, ExecutorId, FailureClass, JobId, RecordId};

use crate::command::{Command, CommandConfig, CommandContext, CommandExecutor, EntityManager};

use super::acquire::release_scope_lease;
use super::retry::{BackoffPolicy, RetryBackoff};
use super::types::{
    DeadLetterJobEntity, ErrorDetailsEntity, JobEntity, JobHistoryEntity, JobOutcomeKind,
    JobRecord, TimerJobEntity,
};

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded; the job is gone.
    Completed,
    /// Failed with retries left; waiting in the timer table.
    Retried {
        due_date: DateTime<Utc>,
        retries_left: u32,
    },
    /// Failed for good.
    DeadLettered,
    /// Lost an optimistic-lock race; the lease was released without consuming a retry.
    Released,
    /// The job vanished or is no longer ours.
    Skipped,
    /// The failure could not be recorded; the lease will expire and the job is retried.
    Unrecorded,
}

/// Run the handler of a job this executor holds the lease for.
#[derive(Debug, Clone)]
pub struct ExecuteJobCmd {
    pub job_id: JobId,
    pub executor_id: ExecutorId,
}

impl Command for ExecuteJobCmd {
    type Output = JobOutcome;

    fn execute(self, ctx: &mut CommandContext) -> EngineResult<JobOutcome> {
        let id = self.job_id.to_string();
        let record = {
            let mut em = ctx.entities()?;
            let Some(job) = em.find_by_id::<JobEntity>(&id)? else {
                return Ok(JobOutcome::Skipped);
            };
            job.borrow().0.clone()
        };
        if record.lock_owner.as_deref() != Some(self.executor_id.as_str()) {
            debug!(job_id = %self.job_id, "job no longer owned by this executor");
            return Ok(JobOutcome::Skipped);
        }

        let engine = Arc::clone(ctx.engine());
        let handler = engine
            .handlers()
            .get(&record.job_handler_type)
            .ok_or_else(|| {
                EngineError::illegal_state(format!(
                    "no handler registered for job type '{}'",
                    record.job_handler_type
                ))
            })?;
        handler.execute(&record, ctx)?;

        let now = ctx.now();
        let mut em = ctx.entities()?;
        // the handler may have changed the cached instance
        let job = em.get::<JobEntity>(&id)?;
        let record = job.borrow().0.clone();
        if engine.job_config().record_history {
            em.insert(JobHistoryEntity::of(&record, JobOutcomeKind::Completed, now))?;
        }
        delete_error_details(&mut em, &record)?;
        em.delete(&job)?;
        release_scope_lease(&mut em, &record)?;
        Ok(JobOutcome::Completed)
    }
}

/// Record a failed execution. Runs in a fresh context after the failing one rolled back.
#[derive(Debug, Clone)]
pub struct HandleJobFailureCmd {
    pub job_id: JobId,
    pub executor_id: ExecutorId,
    pub error: EngineError,
}

impl Command for HandleJobFailureCmd {
    type Output = JobOutcome;

    fn execute(self, ctx: &mut CommandContext) -> EngineResult<JobOutcome> {
        let engine = Arc::clone(ctx.engine());
        let config = engine.job_config();
        let now = ctx.now();

        let mut em = ctx.entities()?;
        let Some(job) = em.find_by_id::<JobEntity>(&self.job_id.to_string())? else {
            return Ok(JobOutcome::Skipped);
        };
        let mut record = job.borrow().0.clone();
        if record.lock_owner.as_deref() != Some(self.executor_id.as_str()) {
            return Ok(JobOutcome::Skipped);
        }

        let class = self.error.failure_class();
        if class == FailureClass::Conflict {
            if em.try_update_now(&job, &[], |j| j.clear_lock())? {
                release_scope_lease(&mut em, &record)?;
            }
            debug!(job_id = %record.id, error = %self.error, "job conflicted, lease released");
            return Ok(JobOutcome::Released);
        }

        let full = self.error.to_string();
        let details = ErrorDetailsEntity {
            id: RecordId::new(),
            revision: 0,
            job_id: record.id,
            message: full.clone(),
            details: format!("{class:?}: {:?}", self.error),
            create_time: now,
        };
        delete_error_details(&mut em, &record)?;
        record.exception_stacktrace_ref = Some(details.id);
        record.exception_message = Some(truncate(&full, config.max_exception_message_len));
        em.insert(details)?;

        record.clear_lock();
        record.revision = 0;
        record.attempt += 1;

        if !self.error.is_retryable() || record.retries == 0 {
            if config.record_history {
                em.insert(JobHistoryEntity::of(&record, JobOutcomeKind::DeadLettered, now))?;
            }
            warn!(
                job_id = %record.id,
                handler_type = %record.job_handler_type,
                attempt = record.attempt,
                error = %self.error,
                "job moved to dead-letter"
            );
            em.insert(DeadLetterJobEntity(record.clone()))?;
            em.delete(&job)?;
            release_scope_lease(&mut em, &record)?;
            return Ok(JobOutcome::DeadLettered);
        }

        record.retries -= 1;
        let delay = match engine
            .handlers()
            .get(&record.job_handler_type)
            .as_deref()
            .and_then(|h| h.backoff())
        {
            Some(policy) => policy.delay_for_attempt(record.attempt),
            None => RetryBackoff::from(&config.backoff).delay_for_attempt(record.attempt),
        };
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| EngineError::invalid_argument(format!("retry delay: {e}")))?;
        let due_date = now + delay;
        record.due_date = Some(due_date);
        info!(
            job_id = %record.id,
            handler_type = %record.job_handler_type,
            retries_left = record.retries,
            %due_date,
            error = %self.error,
            "job failed, retry scheduled"
        );

        let retries_left = record.retries;
        em.insert(TimerJobEntity(record.clone()))?;
        em.delete(&job)?;
        release_scope_lease(&mut em, &record)?;
        Ok(JobOutcome::Retried {
            due_date,
            retries_left,
        })
    }
}

fn delete_error_details(em: &mut EntityManager<'_>, job: &JobRecord) -> EngineResult<()> {
    if let Some(details_id) = job.exception_stacktrace_ref {
        if let Some(details) = em.find_by_id::<ErrorDetailsEntity>(&details_id.to_string())? {
            em.delete(&details)?;
        }
    }
    Ok(())
}

fn truncate(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Execute a claimed job and record whatever happened.
///
/// Never fails: every error is turned into a recorded outcome so that one
/// job cannot take down the worker or the rest of its batch.
pub fn execute_job(executor: &CommandExecutor, job_id: JobId, executor_id: &ExecutorId) -> JobOutcome {
    let command = ExecuteJobCmd {
        job_id,
        executor_id: executor_id.clone(),
    };
    let result = catch_unwind(AssertUnwindSafe(|| {
        executor.execute(CommandConfig::requiring_new(), command)
    }))
    .unwrap_or_else(|payload| {
        Err(EngineError::handler(
            format!("job handler panicked: {}", panic_message(payload.as_ref())),
            true,
        ))
    });

    let failure = match result {
        Ok(outcome) => {
            debug!(%job_id, ?outcome, "job executed");
            return outcome;
        }
        Err(failure) => failure,
    };

    let record = HandleJobFailureCmd {
        job_id,
        executor_id: executor_id.clone(),
        error: failure.clone(),
    };
    match executor.execute(CommandConfig::requiring_new(), record) {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(%job_id, error = %err, original = %failure, "could not record job failure");
            JobOutcome::Unrecorded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("abc", 0), "");
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
