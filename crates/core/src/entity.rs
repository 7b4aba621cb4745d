//! Entity trait: identity + revision for optimistic concurrency.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A persisted record with a stable identifier and a numeric revision.
///
/// The serialized form (via serde) is the record's *persistent state*: it is
/// what gets written to the backing store and what the session snapshots at
/// load time for dirty checking. The revision is tracked by the store row, so
/// implementations keep it out of their serialized form (`#[serde(skip)]`).
pub trait Entity: Clone + core::fmt::Debug + Serialize + DeserializeOwned + 'static {
    /// Logical table the entity family lives in.
    const TABLE: &'static str;

    /// Returns the record identifier.
    fn id(&self) -> String;

    /// Revision the record had when it was last read or written (0 = never persisted).
    fn revision(&self) -> u64;

    fn set_revision(&mut self, revision: u64);
}

/// Optimistic concurrency expectation for a revision-checked write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// Skip revision checking.
    Any,
    /// Require the record to be at an exact revision.
    Exact(u64),
}

impl ExpectedRevision {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedRevision::Any => true,
            ExpectedRevision::Exact(r) => r == actual,
        }
    }
}
