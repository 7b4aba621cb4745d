//! Job handlers and the registry that routes jobs to them.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use conveyor_core::EngineError;

use crate::command::CommandContext;

use super::retry::BackoffPolicy;
use super::types::JobRecord;

/// Failure reported by a job handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Business failure that may succeed on a later attempt.
    #[error("{0}")]
    Retryable(String),

    /// Business failure that will never succeed; dead-letter immediately.
    #[error("{0}")]
    NonRetryable(String),

    /// The job's handler configuration cannot be interpreted.
    #[error("invalid job configuration: {0}")]
    InvalidConfiguration(String),

    /// Failure from the engine itself (store, conflicts, ...).
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl JobError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn non_retryable(msg: impl Into<String>) -> Self {
        Self::NonRetryable(msg.into())
    }
}

impl From<JobError> for EngineError {
    fn from(value: JobError) -> Self {
        match value {
            JobError::Retryable(msg) => EngineError::handler(msg, true),
            JobError::NonRetryable(msg) => EngineError::handler(msg, false),
            JobError::InvalidConfiguration(msg) => {
                EngineError::illegal_state(format!("invalid job configuration: {msg}"))
            }
            JobError::Engine(err) => err,
        }
    }
}

/// Executes jobs of one handler type.
///
/// Handlers run inside the job's own command context, so any entity writes
/// they make commit or roll back together with the job's outcome. Execution
/// may be repeated after a falsely reclaimed lease, so handlers should be
/// idempotent.
pub trait JobHandler: Send + Sync {
    fn handler_type(&self) -> &str;

    fn execute(&self, job: &JobRecord, ctx: &mut CommandContext) -> Result<(), JobError>;

    /// Overrides the engine's default retry backoff for this handler's jobs.
    fn backoff(&self) -> Option<&dyn BackoffPolicy> {
        None
    }
}

impl<H> JobHandler for Arc<H>
where
    H: JobHandler + ?Sized,
{
    fn handler_type(&self) -> &str {
        (**self).handler_type()
    }

    fn execute(&self, job: &JobRecord, ctx: &mut CommandContext) -> Result<(), JobError> {
        (**self).execute(job, ctx)
    }

    fn backoff(&self) -> Option<&dyn BackoffPolicy> {
        (**self).backoff()
    }
}

/// Handler backed by a closure.
pub struct FnHandler<F> {
    handler_type: String,
    f: F,
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&JobRecord, &mut CommandContext) -> Result<(), JobError> + Send + Sync,
{
    fn handler_type(&self) -> &str {
        &self.handler_type
    }

    fn execute(&self, job: &JobRecord, ctx: &mut CommandContext) -> Result<(), JobError> {
        (self.f)(job, ctx)
    }
}

/// Routes handler types to handlers.
///
/// Lookup order: exact type, then the longest registered `prefix.*` pattern
/// matching the type, then the `*` fallback.
#[derive(Default, Clone)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the handler's own type (which may be a pattern).
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let key = handler.handler_type().to_string();
        self.handlers.insert(key, handler);
    }

    pub fn register_fn<F>(&mut self, handler_type: impl Into<String>, f: F)
    where
        F: Fn(&JobRecord, &mut CommandContext) -> Result<(), JobError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnHandler {
            handler_type: handler_type.into(),
            f,
        }));
    }

    pub fn with(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(handler) = self.handlers.get(handler_type) {
            return Some(Arc::clone(handler));
        }
        self.handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = handler_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| Arc::clone(handler))
            .or_else(|| self.handlers.get("*").map(Arc::clone))
    }

    pub fn handler_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}
