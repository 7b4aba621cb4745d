//! Claiming due jobs under a lease.
//!
//! The only coordination primitive is the conditional write: a candidate is
//! claimed by updating its lock fields guarded by the revision that was read
//! and by "still unlocked at `now`". Whoever sees one affected row owns the
//! job until the lease expires; everybody else drops it from their batch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use conveyor_core::{EngineError, EngineResult, Entity, ExecutorId, JobId};

use crate::command::{Command, CommandContext, EntityManager, QueryMatcher};
use crate::store::{Filter, ID_FIELD, Query};

use super::types::{JobEntity, JobRecord, ScopeLockEntity, TimerJobEntity};

/// Due, unlocked candidates ordered by due date then id.
///
/// "Unlocked" includes rows whose lease has expired.
pub fn acquirable_query(now: DateTime<Utc>, tenant_id: Option<&str>, limit: usize) -> Query {
    let mut query = Query::new()
        .filter(Filter::null_or_not_after("due_date", now))
        .filter(Filter::null_or_not_after("lock_expiration_time", now));
    if let Some(tenant_id) = tenant_id {
        query = query.filter(Filter::eq("tenant_id", tenant_id));
    }
    query.order_asc("due_date").order_asc(ID_FIELD).limit(limit)
}

fn lease_until(now: DateTime<Utc>, duration: Duration) -> EngineResult<DateTime<Utc>> {
    let duration = chrono::Duration::from_std(duration)
        .map_err(|e| EngineError::invalid_argument(format!("lock duration: {e}")))?;
    Ok(now + duration)
}

/// Claim a loaded job-like entity: set the lease if it is still unlocked at `now`.
fn claim<E>(
    em: &mut EntityManager<'_>,
    entity: &crate::command::Shared<E>,
    executor_id: &ExecutorId,
    now: DateTime<Utc>,
    until: DateTime<Utc>,
) -> EngineResult<bool>
where
    E: Entity + std::ops::DerefMut<Target = JobRecord>,
{
    let guard = [Filter::null_or_not_after("lock_expiration_time", now)];
    em.try_update_now(entity, &guard, |job| {
        job.lock_owner = Some(executor_id.as_str().to_string());
        job.lock_expiration_time = Some(until);
    })
}

/// Take the scope lease for an exclusive job. Jobs without a scope need none.
fn take_scope_lease(
    em: &mut EntityManager<'_>,
    job: &JobRecord,
    executor_id: &ExecutorId,
    now: DateTime<Utc>,
    until: DateTime<Utc>,
) -> EngineResult<bool> {
    let Some(key) = job.scope_key() else {
        return Ok(true);
    };

    // another job of the scope still holds a lease
    let mut busy = vec![
        Filter::eq("exclusive", true),
        Filter::greater_than("lock_expiration_time", now.timestamp_millis()),
    ];
    if let Some(scope_id) = &job.scope_id {
        busy.push(Filter::eq("scope_id", scope_id.as_str()));
    }
    busy.push(match &job.scope_type {
        Some(scope_type) => Filter::eq("scope_type", scope_type.as_str()),
        None => Filter::is_null("scope_type"),
    });
    if em.count::<JobEntity>(&busy)? > 0 {
        return Ok(false);
    }

    let lease = ScopeLockEntity {
        key: key.clone(),
        revision: 0,
        lock_owner: executor_id.as_str().to_string(),
        job_id: job.id,
        lock_expiration_time: until,
    };
    if em.try_insert_now(lease)?.is_some() {
        return Ok(true);
    }

    let Some(existing) = em.find_by_id::<ScopeLockEntity>(&key)? else {
        return Ok(false);
    };
    if existing.borrow().lock_expiration_time > now {
        return Ok(false);
    }
    let guard = [Filter::at_most("lock_expiration_time", now.timestamp_millis())];
    em.try_update_now(&existing, &guard, |lease| {
        lease.lock_owner = executor_id.as_str().to_string();
        lease.job_id = job.id;
        lease.lock_expiration_time = until;
    })
}

/// Release the scope lease if `job` holds it. Best effort: a lost race is not an error.
pub(crate) fn release_scope_lease(em: &mut EntityManager<'_>, job: &JobRecord) -> EngineResult<bool> {
    if !job.exclusive {
        return Ok(false);
    }
    let Some(key) = job.scope_key() else {
        return Ok(false);
    };
    let Some(lease) = em.find_by_id::<ScopeLockEntity>(&key)? else {
        return Ok(false);
    };
    if lease.borrow().job_id != job.id {
        return Ok(false);
    }
    em.try_delete_now(&lease)
}

/// Claim up to `max_results` due executable jobs for one executor.
#[derive(Debug, Clone)]
pub struct AcquireJobsCmd {
    pub executor_id: ExecutorId,
    pub max_results: usize,
    pub lock_duration: Duration,
    pub tenant_id: Option<String>,
}

impl Command for AcquireJobsCmd {
    type Output = Vec<JobRecord>;

    fn execute(self, ctx: &mut CommandContext) -> EngineResult<Vec<JobRecord>> {
        if self.max_results == 0 {
            return Ok(Vec::new());
        }
        let now = ctx.now();
        let until = lease_until(now, self.lock_duration)?;
        let query = acquirable_query(now, self.tenant_id.as_deref(), self.max_results);

        let mut em = ctx.entities()?;
        let candidates = em.find_by_query::<JobEntity>(&query, &QueryMatcher::new(&query))?;
        let found = candidates.len();
        let mut claimed = Vec::with_capacity(found);
        for job in candidates {
            let record = job.borrow().0.clone();
            if record.exclusive
                && !take_scope_lease(&mut em, &record, &self.executor_id, now, until)?
            {
                trace!(job_id = %record.id, "exclusive scope busy, skipping");
                continue;
            }
            if claim(&mut em, &job, &self.executor_id, now, until)? {
                claimed.push(job.borrow().0.clone());
            } else {
                trace!(job_id = %record.id, "lost claim race");
                if record.exclusive {
                    release_scope_lease(&mut em, &record)?;
                }
            }
        }

        debug!(
            executor_id = %self.executor_id,
            found,
            claimed = claimed.len(),
            "acquired jobs"
        );
        Ok(claimed)
    }
}

/// Claim up to `max_results` due timers so they can be moved to the executable table.
#[derive(Debug, Clone)]
pub struct AcquireTimerJobsCmd {
    pub executor_id: ExecutorId,
    pub max_results: usize,
    pub lock_duration: Duration,
    pub tenant_id: Option<String>,
}

impl Command for AcquireTimerJobsCmd {
    type Output = Vec<JobRecord>;

    fn execute(self, ctx: &mut CommandContext) -> EngineResult<Vec<JobRecord>> {
        if self.max_results == 0 {
            return Ok(Vec::new());
        }
        let now = ctx.now();
        let until = lease_until(now, self.lock_duration)?;
        let query = acquirable_query(now, self.tenant_id.as_deref(), self.max_results);

        let mut em = ctx.entities()?;
        let candidates =
            em.find_by_query::<TimerJobEntity>(&query, &QueryMatcher::new(&query))?;
        let mut claimed = Vec::with_capacity(candidates.len());
        for timer in candidates {
            if claim(&mut em, &timer, &self.executor_id, now, until)? {
                claimed.push(timer.borrow().0.clone());
            }
        }

        if !claimed.is_empty() {
            debug!(executor_id = %self.executor_id, claimed = claimed.len(), "acquired timers");
        }
        Ok(claimed)
    }
}

/// Move a claimed timer into the executable table, unlocked and due.
///
/// Returns `None` if the timer is gone or claimed by someone else.
#[derive(Debug, Clone)]
pub struct MoveTimerToExecutableCmd {
    pub timer_id: JobId,
    pub executor_id: ExecutorId,
}

impl Command for MoveTimerToExecutableCmd {
    type Output = Option<JobId>;

    fn execute(self, ctx: &mut CommandContext) -> EngineResult<Option<JobId>> {
        let mut em = ctx.entities()?;
        let Some(timer) = em.find_by_id::<TimerJobEntity>(&self.timer_id.to_string())? else {
            return Ok(None);
        };
        if timer.borrow().lock_owner.as_deref() != Some(self.executor_id.as_str()) {
            return Ok(None);
        }

        let mut record = timer.borrow().0.clone();
        record.clear_lock();
        record.revision = 0;
        em.insert(JobEntity(record))?;
        em.delete(&timer)?;
        trace!(job_id = %self.timer_id, "timer moved to executable");
        Ok(Some(self.timer_id))
    }
}

/// Release a claim this executor holds, e.g. when its worker queue rejected the job.
#[derive(Debug, Clone)]
pub struct UnacquireJobCmd {
    pub job_id: JobId,
    pub executor_id: ExecutorId,
}

impl Command for UnacquireJobCmd {
    type Output = bool;

    fn execute(self, ctx: &mut CommandContext) -> EngineResult<bool> {
        let mut em = ctx.entities()?;
        let Some(job) = em.find_by_id::<JobEntity>(&self.job_id.to_string())? else {
            return Ok(false);
        };
        let record = job.borrow().0.clone();
        if record.lock_owner.as_deref() != Some(self.executor_id.as_str()) {
            return Ok(false);
        }
        let released = em.try_update_now(&job, &[], unlock)?;
        if released {
            release_scope_lease(&mut em, &record)?;
        }
        Ok(released)
    }
}

fn unlock<E: std::ops::DerefMut<Target = JobRecord>>(job: &mut E) {
    job.clear_lock();
}

/// Clear leases that expired without the job finishing (crashed or stuck executors).
///
/// Processes at most `page_size` rows per table per invocation.
#[derive(Debug, Clone)]
pub struct ResetExpiredJobsCmd {
    pub page_size: usize,
}

impl Command for ResetExpiredJobsCmd {
    type Output = usize;

    fn execute(self, ctx: &mut CommandContext) -> EngineResult<usize> {
        let now = ctx.now();
        let now_ms = now.timestamp_millis();
        let expired = Query::new()
            .filter(Filter::at_most("lock_expiration_time", now_ms))
            .order_asc("lock_expiration_time")
            .order_asc(ID_FIELD)
            .limit(self.page_size);
        let guard = [Filter::at_most("lock_expiration_time", now_ms)];
        let matcher = QueryMatcher::new(&expired);

        let mut em = ctx.entities()?;
        let mut reset = 0;
        for job in em.find_by_query::<JobEntity>(&expired, &matcher)? {
            if em.try_update_now(&job, &guard, unlock)? {
                debug!(job_id = %job.borrow().id, "expired job lock reset");
                reset += 1;
            }
        }
        for timer in em.find_by_query::<TimerJobEntity>(&expired, &matcher)? {
            if em.try_update_now(&timer, &guard, unlock)? {
                debug!(job_id = %timer.borrow().id, "expired timer lock reset");
                reset += 1;
            }
        }
        for lease in em.find_by_query::<ScopeLockEntity>(&expired, &matcher)? {
            if em.try_delete_now(&lease)? {
                debug!(scope = %lease.borrow().key, "expired scope lease removed");
            }
        }
        Ok(reset)
    }
}
