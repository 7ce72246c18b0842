//! Job-level error type.
//!
//! Each collaborator has its own error enum; [`JobError`] gathers them so
//! the executor can treat every per-job failure the same way: capture
//! the message, report it, move on.

use crowdsky_cloud::StorageError;

use crate::coordinator::CoordinatorError;
use crate::process::ProcessError;
use crate::workspace::WorkspaceError;

/// Anything that ends a job run in a `failed` disposition.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The coordinator listed no input files for the job.
    #[error("No raw files found for this job.")]
    NoInputs,

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Local I/O error: {0}")]
    Io(#[from] std::io::Error),
}
