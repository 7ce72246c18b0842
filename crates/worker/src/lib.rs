//! `crowdsky-worker` library crate.
//!
//! The stacking agent: claims jobs from the coordinator, runs each one
//! through the stacking step in a private workspace, uploads the result
//! to bulk storage and reports the outcome. The binary entrypoint lives
//! in `main.rs`; everything here is public so the integration tests can
//! drive it with in-memory collaborators.

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod pool;
pub mod preview;
pub mod process;
pub mod stacker;
pub mod workspace;
