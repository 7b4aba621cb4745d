//! Administrative job operations: creation, queries, dead-letter handling.

use std::ops::DerefMut;

use serde::{Deserialize, Serialize};
use tracing::info;

use conveyor_core::{EngineError, EngineResult, Entity, JobId};

use crate::command::{CommandConfig, CommandContext, CommandExecutor, EntityManager, Shared};
use crate::store::{Filter, ID_FIELD, Query};

use super::types::{
    DeadLetterJobEntity, ErrorDetailsEntity, JobEntity, JobRecord, JobState, NewJob,
    SuspendedJobEntity, TimerJobEntity,
};

/// Criteria for listing jobs of one state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub handler_type: Option<String>,
    pub scope_id: Option<String>,
    pub tenant_id: Option<String>,
    /// Only jobs that carry a failure message.
    pub with_exception: bool,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler_type(mut self, handler_type: impl Into<String>) -> Self {
        self.handler_type = Some(handler_type.into());
        self
    }

    pub fn scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_exception(mut self) -> Self {
        self.with_exception = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn to_query(&self) -> Query {
        let mut query = Query::new();
        if let Some(handler_type) = &self.handler_type {
            query = query.filter(Filter::eq("job_handler_type", handler_type.as_str()));
        }
        if let Some(scope_id) = &self.scope_id {
            query = query.filter(Filter::eq("scope_id", scope_id.as_str()));
        }
        if let Some(tenant_id) = &self.tenant_id {
            query = query.filter(Filter::eq("tenant_id", tenant_id.as_str()));
        }
        if self.with_exception {
            query = query.filter(Filter::not_null("exception_message"));
        }
        query = query.order_asc("create_time").order_asc(ID_FIELD);
        match self.limit {
            Some(limit) => query.limit(limit),
            None => query,
        }
    }
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub executable: u64,
    /// Executable jobs currently under a live lease (subset of `executable`).
    pub locked: u64,
    pub timers: u64,
    pub suspended: u64,
    pub dead_letter: u64,
}

/// Read-mostly facade used by operators and surrounding applications.
#[derive(Debug, Clone)]
pub struct JobService {
    executor: CommandExecutor,
}

impl JobService {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Create a job. Jobs due in the future start in the timer table.
    pub fn create_job(&self, job: NewJob) -> EngineResult<JobRecord> {
        self.run("CreateJob", |ctx| create_job(ctx, job))
    }

    /// Find a job in whichever state table it currently lives.
    pub fn get_job(&self, id: JobId) -> EngineResult<Option<(JobState, JobRecord)>> {
        self.run("GetJob", |ctx| {
            let mut em = ctx.entities()?;
            find_any(&mut em, id)
        })
    }

    pub fn list(&self, state: JobState, filter: &JobFilter) -> EngineResult<Vec<JobRecord>> {
        let query = filter.to_query();
        self.run("ListJobs", |ctx| {
            let mut em = ctx.entities()?;
            match state {
                JobState::Executable => select::<JobEntity>(&mut em, &query),
                JobState::Timer => select::<TimerJobEntity>(&mut em, &query),
                JobState::Suspended => select::<SuspendedJobEntity>(&mut em, &query),
                JobState::DeadLetter => select::<DeadLetterJobEntity>(&mut em, &query),
            }
        })
    }

    pub fn dead_letters(&self, filter: &JobFilter) -> EngineResult<Vec<JobRecord>> {
        self.list(JobState::DeadLetter, filter)
    }

    /// Move a dead-lettered job back to the executable table with a fresh retry budget.
    ///
    /// The attempt counter restarts, so the next failure backs off from the base delay.
    pub fn requeue_dead_letter(&self, id: JobId, retries: u32) -> EngineResult<JobRecord> {
        self.run("RequeueDeadLetter", |ctx| {
            let mut em = ctx.entities()?;
            let dead = em.get::<DeadLetterJobEntity>(&id.to_string())?;
            let record = move_job::<_, JobEntity>(&mut em, &dead, |job| {
                job.retries = retries;
                job.attempt = 0;
                job.due_date = None;
            })?;
            info!(job_id = %id, retries, "dead-letter job re-queued");
            Ok(record)
        })
    }

    /// Give up on an executable or timer job immediately.
    pub fn move_to_dead_letter(&self, id: JobId) -> EngineResult<JobRecord> {
        self.run("MoveToDeadLetter", |ctx| {
            let now = ctx.now();
            let mut em = ctx.entities()?;
            if let Some(job) = em.find_by_id::<JobEntity>(&id.to_string())? {
                ensure_unlocked(&job.borrow(), now)?;
                return move_job::<_, DeadLetterJobEntity>(&mut em, &job, |_| {});
            }
            let timer = em.get::<TimerJobEntity>(&id.to_string())?;
            ensure_unlocked(&timer.borrow(), now)?;
            move_job::<_, DeadLetterJobEntity>(&mut em, &timer, |_| {})
        })
    }

    /// Park an executable or timer job; it is never acquired while suspended.
    pub fn suspend(&self, id: JobId) -> EngineResult<JobRecord> {
        self.run("SuspendJob", |ctx| {
            let now = ctx.now();
            let mut em = ctx.entities()?;
            if let Some(job) = em.find_by_id::<JobEntity>(&id.to_string())? {
                ensure_unlocked(&job.borrow(), now)?;
                return move_job::<_, SuspendedJobEntity>(&mut em, &job, |_| {});
            }
            let timer = em.get::<TimerJobEntity>(&id.to_string())?;
            ensure_unlocked(&timer.borrow(), now)?;
            move_job::<_, SuspendedJobEntity>(&mut em, &timer, |_| {})
        })
    }

    /// Resume a suspended job, as a timer if it is not yet due.
    pub fn activate(&self, id: JobId) -> EngineResult<(JobState, JobRecord)> {
        self.run("ActivateJob", |ctx| {
            let now = ctx.now();
            let mut em = ctx.entities()?;
            let suspended = em.get::<SuspendedJobEntity>(&id.to_string())?;
            let due = suspended.borrow().is_due_at(now);
            if due {
                let record = move_job::<_, JobEntity>(&mut em, &suspended, |_| {})?;
                Ok((JobState::Executable, record))
            } else {
                let record = move_job::<_, TimerJobEntity>(&mut em, &suspended, |_| {})?;
                Ok((JobState::Timer, record))
            }
        })
    }

    /// Delete a job in any state together with its error details.
    ///
    /// Returns `false` if no such job exists. A job under a live lease cannot
    /// be deleted.
    pub fn delete_job(&self, id: JobId) -> EngineResult<bool> {
        self.run("DeleteJob", |ctx| {
            let now = ctx.now();
            let mut em = ctx.entities()?;
            let key = id.to_string();
            let record = if let Some(job) = em.find_by_id::<JobEntity>(&key)? {
                ensure_unlocked(&job.borrow(), now)?;
                delete_job(&mut em, &job)?
            } else if let Some(job) = em.find_by_id::<TimerJobEntity>(&key)? {
                ensure_unlocked(&job.borrow(), now)?;
                delete_job(&mut em, &job)?
            } else if let Some(job) = em.find_by_id::<SuspendedJobEntity>(&key)? {
                delete_job(&mut em, &job)?
            } else if let Some(job) = em.find_by_id::<DeadLetterJobEntity>(&key)? {
                delete_job(&mut em, &job)?
            } else {
                return Ok(false);
            };
            info!(job_id = %record.id, "job deleted");
            Ok(true)
        })
    }

    /// Full failure recorded for a job's last failed execution.
    pub fn error_details(&self, id: JobId) -> EngineResult<Option<ErrorDetailsEntity>> {
        self.run("GetJobErrorDetails", |ctx| {
            let mut em = ctx.entities()?;
            let Some((_, record)) = find_any(&mut em, id)? else {
                return Ok(None);
            };
            let Some(details_id) = record.exception_stacktrace_ref else {
                return Ok(None);
            };
            Ok(em
                .find_by_id::<ErrorDetailsEntity>(&details_id.to_string())?
                .map(|d| d.borrow().clone()))
        })
    }

    pub fn stats(&self) -> EngineResult<JobStats> {
        self.run("JobStats", |ctx| {
            let now_ms = ctx.now().timestamp_millis();
            let mut em = ctx.entities()?;
            Ok(JobStats {
                executable: em.count::<JobEntity>(&[])?,
                locked: em.count::<JobEntity>(&[Filter::greater_than(
                    "lock_expiration_time",
                    now_ms,
                )])?,
                timers: em.count::<TimerJobEntity>(&[])?,
                suspended: em.count::<SuspendedJobEntity>(&[])?,
                dead_letter: em.count::<DeadLetterJobEntity>(&[])?,
            })
        })
    }

    fn run<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut CommandContext) -> EngineResult<T>,
    ) -> EngineResult<T> {
        self.executor.execute_fn(CommandConfig::default(), name, f)
    }
}

/// Insert a new job into the table matching its due date.
pub fn create_job(ctx: &mut CommandContext, job: NewJob) -> EngineResult<JobRecord> {
    if job.handler_type.trim().is_empty() {
        return Err(EngineError::invalid_argument("job handler type must not be empty"));
    }
    let now = ctx.now();
    let record = job.into_record(now, ctx.engine().job_config().default_retries);
    let mut em = ctx.entities()?;
    if record.is_due_at(now) {
        em.insert(JobEntity(record.clone()))?;
    } else {
        em.insert(TimerJobEntity(record.clone()))?;
    }
    info!(
        job_id = %record.id,
        handler_type = %record.job_handler_type,
        due_date = ?record.due_date,
        "job created"
    );
    Ok(record)
}

fn find_any(em: &mut EntityManager<'_>, id: JobId) -> EngineResult<Option<(JobState, JobRecord)>> {
    let key = id.to_string();
    if let Some(job) = em.find_by_id::<JobEntity>(&key)? {
        return Ok(Some((JobEntity::STATE, job.borrow().0.clone())));
    }
    if let Some(job) = em.find_by_id::<TimerJobEntity>(&key)? {
        return Ok(Some((TimerJobEntity::STATE, job.borrow().0.clone())));
    }
    if let Some(job) = em.find_by_id::<SuspendedJobEntity>(&key)? {
        return Ok(Some((SuspendedJobEntity::STATE, job.borrow().0.clone())));
    }
    if let Some(job) = em.find_by_id::<DeadLetterJobEntity>(&key)? {
        return Ok(Some((DeadLetterJobEntity::STATE, job.borrow().0.clone())));
    }
    Ok(None)
}

fn select<E>(em: &mut EntityManager<'_>, query: &Query) -> EngineResult<Vec<JobRecord>>
where
    E: Entity + DerefMut<Target = JobRecord>,
{
    let matcher = crate::command::QueryMatcher::new(query);
    Ok(em
        .find_by_query::<E>(query, &matcher)?
        .iter()
        .map(|job| (**job.borrow()).clone())
        .collect())
}

fn ensure_unlocked(job: &JobRecord, now: chrono::DateTime<chrono::Utc>) -> EngineResult<()> {
    if job.is_locked_at(now) {
        return Err(EngineError::illegal_state(format!(
            "job '{}' is locked by '{}'",
            job.id,
            job.lock_owner.as_deref().unwrap_or("unknown")
        )));
    }
    Ok(())
}

/// Insert-into-target plus delete-from-source, staged in one unit of work.
fn move_job<S, T>(
    em: &mut EntityManager<'_>,
    source: &Shared<S>,
    mutate: impl FnOnce(&mut JobRecord),
) -> EngineResult<JobRecord>
where
    S: Entity + DerefMut<Target = JobRecord>,
    T: Entity + From<JobRecord>,
{
    let mut record: JobRecord = (**source.borrow()).clone();
    record.clear_lock();
    record.revision = 0;
    mutate(&mut record);
    em.insert(T::from(record.clone()))?;
    em.delete(source)?;
    Ok(record)
}

fn delete_job<E>(em: &mut EntityManager<'_>, job: &Shared<E>) -> EngineResult<JobRecord>
where
    E: Entity + DerefMut<Target = JobRecord>,
{
    let record: JobRecord = (**job.borrow()).clone();
    em.delete(job)?;
    if let Some(details_id) = record.exception_stacktrace_ref {
        if let Some(details) = em.find_by_id::<ErrorDetailsEntity>(&details_id.to_string())? {
            em.delete(&details)?;
        }
    }
    Ok(record)
}
