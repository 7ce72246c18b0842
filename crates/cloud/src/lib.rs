//! `crowdsky-cloud` -- bulk storage for stacked outputs.
//!
//! [`BulkStorage`] is the contract the worker consumes; [`WebDavStorage`]
//! implements it against a WebDAV share.

pub mod storage;
pub mod webdav;

pub use storage::{BulkStorage, StorageError};
pub use webdav::WebDavStorage;
