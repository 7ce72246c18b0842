//! `crowdsky-core` -- shared data model for the stacking worker.
//!
//! Pure types and functions only: no I/O, no async. Both the worker
//! binary and its integration tests build on these.

pub mod metadata;
pub mod naming;
pub mod types;
