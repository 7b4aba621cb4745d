//! Engine error model.

use thiserror::Error;

/// Result type used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-level error.
///
/// This is the only error type that crosses the command boundary. It is `Clone`
/// so that a failure can be recorded on a job after the failing unit of work has
/// been rolled back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A revision-checked write affected zero rows: somebody else updated or
    /// deleted the record first.
    #[error("optimistic lock conflict on {table} '{id}' (revision {revision})")]
    OptimisticLock {
        table: String,
        id: String,
        revision: u64,
    },

    /// A record that was required to exist does not.
    #[error("{table} '{id}' not found")]
    NotFound { table: String, id: String },

    /// Connectivity, timeouts and other failures that may go away on their own.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The backing store rejected an operation.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A write broke a uniqueness or foreign-key constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A job handler reported a business failure.
    #[error("handler failure: {message}")]
    HandlerFailure { message: String, retryable: bool },

    /// Programming or consistency error (missing handler, corrupt state, misuse).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A caller-provided value was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The authorization interceptor rejected the command.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Record (de)serialization failed.
    #[error("serialization failure: {0}")]
    Serialization(String),
}

/// How a failure should be treated by retrying callers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// Concurrent modification; retry by re-reading.
    Conflict,
    /// Infrastructure hiccup; retry with the job's own retry budget.
    Transient,
    /// Failure reported by business logic.
    Business { retryable: bool },
    /// Never retried.
    Consistency,
}

impl EngineError {
    pub fn optimistic_lock(table: impl Into<String>, id: impl Into<String>, revision: u64) -> Self {
        Self::OptimisticLock {
            table: table.into(),
            id: id.into(),
            revision,
        }
    }

    pub fn not_found(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            table: table.into(),
            id: id.into(),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    pub fn handler(msg: impl Into<String>, retryable: bool) -> Self {
        Self::HandlerFailure {
            message: msg.into(),
            retryable,
        }
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn failure_class(&self) -> FailureClass {
        match self {
            EngineError::OptimisticLock { .. } => FailureClass::Conflict,
            EngineError::Transient(_) | EngineError::Persistence(_) => FailureClass::Transient,
            EngineError::HandlerFailure { retryable, .. } => FailureClass::Business {
                retryable: *retryable,
            },
            EngineError::IllegalState(_)
            | EngineError::Constraint(_)
            | EngineError::InvalidArgument(_)
            | EngineError::Unauthorized(_)
            | EngineError::Serialization(_)
            | EngineError::NotFound { .. } => FailureClass::Consistency,
        }
    }

    /// Whether running the same work again can succeed.
    pub fn is_retryable(&self) -> bool {
        match self.failure_class() {
            FailureClass::Conflict | FailureClass::Transient => true,
            FailureClass::Business { retryable } => retryable,
            FailureClass::Consistency => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::OptimisticLock { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        EngineError::Serialization(value.to_string())
    }
}
