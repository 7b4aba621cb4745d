//! Infrastructure layer: backing stores, the command pipeline, sessions and
//! the async job engine.

pub mod command;
pub mod config;
pub mod jobs;
pub mod store;

#[cfg(test)]
mod integration_tests;
