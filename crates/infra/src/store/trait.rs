use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use conveyor_core::{EngineError, ExpectedRevision};

use super::query::{Filter, Query};

/// A persisted row: identifier, revision and JSON payload.
///
/// The revision is owned by the row, not by the payload. Every successful
/// write stores the revision supplied by the caller, which is how revision
/// checks on later writes detect concurrent modification.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: String,
    pub revision: u64,
    pub data: JsonValue,
}

impl Row {
    pub fn new(id: impl Into<String>, revision: u64, data: JsonValue) -> Self {
        Self {
            id: id.into(),
            revision,
            data,
        }
    }
}

/// Backing store operation error.
///
/// These are infrastructure errors. Revision mismatches are *not* errors at
/// this level: conditional writes report the number of affected rows and the
/// caller decides what zero means.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("duplicate key in {table}: {id}")]
    Duplicate { table: String, id: String },

    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    #[error("store connection failure: {0}")]
    Connection(String),

    #[error("store backend failure: {0}")]
    Backend(String),

    #[error("row serialization failure: {0}")]
    Serialization(String),
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Connection(msg) => EngineError::Transient(msg),
            StoreError::Serialization(msg) => EngineError::Serialization(msg),
            StoreError::Duplicate { .. } | StoreError::ForeignKey(_) => {
                EngineError::Constraint(value.to_string())
            }
            StoreError::Backend(msg) => EngineError::Persistence(msg),
        }
    }
}

/// One transaction against a [`BackingStore`].
///
/// Writes are conditional and report how many rows they affected, which is the
/// only mutual-exclusion primitive the engine relies on. Dropping a transaction
/// without calling [`commit`](StoreTransaction::commit) rolls it back.
pub trait StoreTransaction: Send {
    fn find_by_id(&mut self, table: &str, id: &str) -> Result<Option<Row>, StoreError>;

    fn select(&mut self, table: &str, query: &Query) -> Result<Vec<Row>, StoreError>;

    fn count(&mut self, table: &str, filters: &[Filter]) -> Result<u64, StoreError>;

    /// Insert a new row, failing with [`StoreError::Duplicate`] if the id exists.
    fn insert(&mut self, table: &str, row: &Row) -> Result<(), StoreError>;

    /// Insert a new row unless the id exists. Returns affected rows (0 or 1).
    fn insert_if_absent(&mut self, table: &str, row: &Row) -> Result<u64, StoreError>;

    /// Replace a row's revision and payload if it is at `expected` and matches every
    /// `guard` filter. Returns affected rows (0 or 1).
    fn update(
        &mut self,
        table: &str,
        row: &Row,
        expected: ExpectedRevision,
        guard: &[Filter],
    ) -> Result<u64, StoreError>;

    /// Delete a row if it is at `expected`. Returns affected rows (0 or 1).
    fn delete(&mut self, table: &str, id: &str, expected: ExpectedRevision)
    -> Result<u64, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Shared persisted state that many engine instances read and mutate.
///
/// Implementations must:
/// - make a transaction's writes visible to others only after commit
/// - apply conditional writes atomically (check and write as one step)
/// - never let two transactions both observe "1 row affected" for conflicting
///   writes to the same row
pub trait BackingStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

impl<S> BackingStore for Arc<S>
where
    S: BackingStore + ?Sized,
{
    fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        (**self).begin()
    }
}

/// A child-to-parent reference enforced by stores that support it.
///
/// `column` in rows of `table` must name an existing row id in `references`
/// (or be null). Deleting a referenced parent is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub references: String,
}

impl ForeignKey {
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        references: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            references: references.into(),
        }
    }
}
