//! Transactional backing store boundary.
//!
//! The engine persists every entity family as rows of `(id, revision, JSON data)`
//! and coordinates exclusively through conditional writes: a write that affects
//! zero rows means somebody else got there first.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use query::{Direction, Filter, ID_FIELD, OrderBy, Query};
pub use r#trait::{BackingStore, ForeignKey, Row, StoreError, StoreTransaction};
