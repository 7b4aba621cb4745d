//! `conveyor-core`: engine foundation building blocks.
//!
//! This crate contains **pure** primitives shared by every layer (no IO).

pub mod clock;
pub mod entity;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{Entity, ExpectedRevision};
pub use error::{EngineError, EngineResult, FailureClass};
pub use id::{ExecutorId, JobId, RecordId};
