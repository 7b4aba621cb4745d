//! Persisted job records and the tables they live in.

use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conveyor_core::{Entity, JobId, RecordId};

pub const JOB_TABLE: &str = "job";
pub const TIMER_JOB_TABLE: &str = "timer_job";
pub const SUSPENDED_JOB_TABLE: &str = "suspended_job";
pub const DEADLETTER_JOB_TABLE: &str = "deadletter_job";
pub const JOB_HISTORY_TABLE: &str = "job_history";
pub const ERROR_DETAILS_TABLE: &str = "job_error_details";
pub const SCOPE_LOCK_TABLE: &str = "scope_lock";

/// Logical state of a job, one table per state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Due or waiting to be claimed (locked rows are claimed).
    Executable,
    /// Waiting for a future due date.
    Timer,
    /// Parked by an operator; never acquired.
    Suspended,
    /// Failed for good; needs an explicit re-queue.
    DeadLetter,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Executable,
        JobState::Timer,
        JobState::Suspended,
        JobState::DeadLetter,
    ];

    pub fn table(self) -> &'static str {
        match self {
            JobState::Executable => JOB_TABLE,
            JobState::Timer => TIMER_JOB_TABLE,
            JobState::Suspended => SUSPENDED_JOB_TABLE,
            JobState::DeadLetter => DEADLETTER_JOB_TABLE,
        }
    }
}

/// A unit of deferred work.
///
/// Timestamps are persisted as epoch milliseconds so that stores can compare
/// them as integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    #[serde(skip)]
    pub revision: u64,
    /// `None` means eligible immediately.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lock_owner: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub lock_expiration_time: Option<DateTime<Utc>>,
    /// Retries remaining.
    pub retries: u32,
    /// Failed executions so far.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub exception_message: Option<String>,
    /// Row in `job_error_details` holding the full failure.
    #[serde(default)]
    pub exception_stacktrace_ref: Option<RecordId>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub scope_type: Option<String>,
    #[serde(default)]
    pub scope_definition_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub job_handler_type: String,
    /// Opaque to the engine; interpreted by the handler only.
    #[serde(default)]
    pub job_handler_config: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub create_time: DateTime<Utc>,
}

impl JobRecord {
    /// Whether a lease is held at `now` (expired leases do not count).
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_expiration_time.is_some_and(|exp| exp > now)
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_none_or(|due| due <= now)
    }

    pub fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }

    /// Key of the scope lease taken by exclusive jobs.
    pub fn scope_key(&self) -> Option<String> {
        let scope_id = self.scope_id.as_deref()?;
        let scope_type = self.scope_type.as_deref().unwrap_or("scope");
        Some(format!("{scope_type}:{scope_id}"))
    }
}

macro_rules! job_table {
    ($(#[$meta:meta])* $name:ident, $table:expr, $state:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub JobRecord);

        impl $name {
            pub const STATE: JobState = $state;
        }

        impl Entity for $name {
            const TABLE: &'static str = $table;

            fn id(&self) -> String {
                self.0.id.to_string()
            }

            fn revision(&self) -> u64 {
                self.0.revision
            }

            fn set_revision(&mut self, revision: u64) {
                self.0.revision = revision;
            }
        }

        impl Deref for $name {
            type Target = JobRecord;

            fn deref(&self) -> &JobRecord {
                &self.0
            }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut JobRecord {
                &mut self.0
            }
        }

        impl From<JobRecord> for $name {
            fn from(record: JobRecord) -> Self {
                Self(record)
            }
        }
    };
}

job_table!(
    /// Executable job (the acquisition table).
    JobEntity,
    JOB_TABLE,
    JobState::Executable
);
job_table!(
    /// Job waiting for its due date.
    TimerJobEntity,
    TIMER_JOB_TABLE,
    JobState::Timer
);
job_table!(SuspendedJobEntity, SUSPENDED_JOB_TABLE, JobState::Suspended);
job_table!(
    /// Job that exhausted its retries or failed permanently.
    DeadLetterJobEntity,
    DEADLETTER_JOB_TABLE,
    JobState::DeadLetter
);

/// Full failure of one job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetailsEntity {
    pub id: RecordId,
    #[serde(skip)]
    pub revision: u64,
    pub job_id: JobId,
    pub message: String,
    /// Error chain and classification.
    pub details: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub create_time: DateTime<Utc>,
}

impl Entity for ErrorDetailsEntity {
    const TABLE: &'static str = ERROR_DETAILS_TABLE;

    fn id(&self) -> String {
        self.id.to_string()
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcomeKind {
    Completed,
    DeadLettered,
}

/// Historical copy of a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistoryEntity {
    pub id: RecordId,
    #[serde(skip)]
    pub revision: u64,
    pub job_id: JobId,
    pub job_handler_type: String,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub outcome: JobOutcomeKind,
    pub attempts: u32,
    #[serde(default)]
    pub exception_message: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub recorded_at: DateTime<Utc>,
}

impl JobHistoryEntity {
    pub fn of(job: &JobRecord, outcome: JobOutcomeKind, now: DateTime<Utc>) -> Self {
        Self {
            id: RecordId::new(),
            revision: 0,
            job_id: job.id,
            job_handler_type: job.job_handler_type.clone(),
            scope_id: job.scope_id.clone(),
            tenant_id: job.tenant_id.clone(),
            outcome,
            attempts: job.attempt,
            exception_message: job.exception_message.clone(),
            recorded_at: now,
        }
    }
}

impl Entity for JobHistoryEntity {
    const TABLE: &'static str = JOB_HISTORY_TABLE;

    fn id(&self) -> String {
        self.id.to_string()
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

/// Lease on a scope instance, held while one of its exclusive jobs runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeLockEntity {
    /// `scope_type:scope_id`
    pub key: String,
    #[serde(skip)]
    pub revision: u64,
    pub lock_owner: String,
    pub job_id: JobId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub lock_expiration_time: DateTime<Utc>,
}

impl Entity for ScopeLockEntity {
    const TABLE: &'static str = SCOPE_LOCK_TABLE;

    fn id(&self) -> String {
        self.key.clone()
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

/// Builder for new jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub handler_type: String,
    pub handler_config: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub retries: Option<u32>,
    pub exclusive: bool,
    pub scope_id: Option<String>,
    pub scope_type: Option<String>,
    pub scope_definition_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl NewJob {
    pub fn new(handler_type: impl Into<String>) -> Self {
        Self {
            handler_type: handler_type.into(),
            handler_config: None,
            due_date: None,
            retries: None,
            exclusive: false,
            scope_id: None,
            scope_type: None,
            scope_definition_id: None,
            tenant_id: None,
        }
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.handler_config = Some(config.into());
        self
    }

    pub fn due_at(mut self, due: DateTime<Utc>) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn in_scope(mut self, scope_type: impl Into<String>, scope_id: impl Into<String>) -> Self {
        self.scope_type = Some(scope_type.into());
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn with_definition(mut self, definition_id: impl Into<String>) -> Self {
        self.scope_definition_id = Some(definition_id.into());
        self
    }

    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn into_record(self, now: DateTime<Utc>, default_retries: u32) -> JobRecord {
        JobRecord {
            id: JobId::new(),
            revision: 0,
            due_date: self.due_date,
            lock_owner: None,
            lock_expiration_time: None,
            retries: self.retries.unwrap_or(default_retries),
            attempt: 0,
            exception_message: None,
            exception_stacktrace_ref: None,
            exclusive: self.exclusive,
            scope_id: self.scope_id,
            scope_type: self.scope_type,
            scope_definition_id: self.scope_definition_id,
            tenant_id: self.tenant_id,
            job_handler_type: self.handler_type,
            job_handler_config: self.handler_config,
            create_time: now,
        }
    }
}
