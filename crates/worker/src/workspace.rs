//! Per-job scratch workspaces.
//!
//! A [`Workspace`] is a private directory under the scratch root, named
//! `job_{id}_XXXXXX`, holding an `inputs/` subdirectory for downloaded
//! frames plus whatever the processing steps write. It is removed when
//! the value is dropped, so every exit path of a job run (success,
//! failure, early return, panic) releases it.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crowdsky_core::types::JobId;

/// Subdirectory receiving the downloaded input frames.
pub const INPUTS_DIR: &str = "inputs";

/// Errors from the scratch filesystem.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// The scratch root cannot be created or written to.
    #[error("Scratch root {} is unusable: {source}", path.display())]
    ScratchRootUnusable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A job workspace could not be created.
    #[error("Failed to create workspace for job {job_id}: {source}")]
    Create {
        job_id: JobId,
        #[source]
        source: std::io::Error,
    },
}

/// Verify the scratch root exists (creating it if needed) and is writable.
///
/// Called once at startup; failure is fatal.
pub fn check_scratch_root(root: &Path) -> Result<(), WorkspaceError> {
    let unusable = |source| WorkspaceError::ScratchRootUnusable {
        path: root.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(root).map_err(unusable)?;
    // The write-test file is deleted when dropped.
    tempfile::Builder::new()
        .prefix(".write-test")
        .tempfile_in(root)
        .map_err(unusable)?;
    Ok(())
}

/// Exclusively owned scratch directory for one job.
#[derive(Debug)]
pub struct Workspace {
    job_id: JobId,
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    /// Create a fresh workspace for `job_id` under `root`.
    pub fn create(root: &Path, job_id: JobId) -> Result<Self, WorkspaceError> {
        let create_err = |source| WorkspaceError::Create { job_id, source };

        let dir = tempfile::Builder::new()
            .prefix(&format!("job_{job_id}_"))
            .tempdir_in(root)
            .map_err(create_err)?;
        std::fs::create_dir(dir.path().join(INPUTS_DIR)).map_err(create_err)?;

        let path = dir.path().to_path_buf();
        tracing::debug!(job_id, path = %path.display(), "Workspace created");

        Ok(Self {
            job_id,
            dir: Some(dir),
            path,
        })
    }

    /// Root of the workspace.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory receiving downloaded inputs.
    pub fn inputs_dir(&self) -> PathBuf {
        self.path.join(INPUTS_DIR)
    }

    /// Path of a generated file directly inside the workspace.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Remove the tree on the blocking pool.
    ///
    /// The normal end of a run. `Drop` still covers unwinding and
    /// abandoned runs, on whatever thread drops the value.
    pub async fn remove(mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let result = match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        };
        log_removal(self.job_id, &self.path, result);
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            log_removal(self.job_id, &self.path, dir.close());
        }
    }
}

fn log_removal(job_id: JobId, path: &Path, result: std::io::Result<()>) {
    match result {
        Ok(()) => {
            tracing::debug!(job_id, path = %path.display(), "Workspace removed");
        }
        Err(e) => {
            tracing::warn!(
                job_id,
                path = %path.display(),
                error = %e,
                "Failed to remove workspace",
            );
        }
    }
}
