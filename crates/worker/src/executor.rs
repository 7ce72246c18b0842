//! Runs one claimed job end to end.
//!
//! ```text
//! FETCHING -> PROCESSING -> DERIVING -> UPLOADING -> REPORTING -> done
//!     \____________\____________\____________\___________\-> FAILED
//! ```
//!
//! Every run ends in exactly one [`Disposition`]. Failures at any stage,
//! panics included, are reported to the coordinator (best-effort) and
//! never escape as errors. The job's [`Workspace`] lives for the whole
//! run and is removed when the run returns, whatever the outcome.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crowdsky_cloud::BulkStorage;
use crowdsky_core::metadata::{CompletionReport, StackMetadata};
use crowdsky_core::naming;
use crowdsky_core::types::{InputFile, Job, JobId};

use crate::coordinator::Coordinator;
use crate::error::JobError;
use crate::preview::{derive_preview, PreviewRenderer};
use crate::stacker::Stacker;
use crate::workspace::Workspace;

/// Failure message reported for a job whose slot was cancelled before
/// it started.
pub const CANCELLED_BEFORE_START: &str = "Worker shutting down before job started";

/// Non-terminal stages of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Fetching,
    Processing,
    Deriving,
    Uploading,
    Reporting,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fetching => "fetching",
            Self::Processing => "processing",
            Self::Deriving => "deriving",
            Self::Uploading => "uploading",
            Self::Reporting => "reporting",
        })
    }
}

/// Terminal outcome of one job run, from the worker's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Outputs are in bulk storage and the coordinator acknowledged it.
    Completed {
        job_id: JobId,
        ucloud_path: String,
        thumbnail_path: Option<String>,
        file_size_bytes: u64,
    },
    /// The run failed at `stage`. `reported` is false when even the
    /// failure report could not be delivered.
    Failed {
        job_id: JobId,
        stage: JobStage,
        message: String,
        reported: bool,
    },
    /// The slot was cancelled before any work started.
    Cancelled { job_id: JobId, reported: bool },
}

impl Disposition {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id, .. } => *job_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// A failure tagged with the stage it happened in.
#[derive(Debug)]
struct StageFailure {
    stage: JobStage,
    error: JobError,
}

/// Tag errors from `stage`, for use with `map_err`.
fn at<E: Into<JobError>>(stage: JobStage) -> impl FnOnce(E) -> StageFailure {
    move |e| StageFailure {
        stage,
        error: e.into(),
    }
}

/// Executes jobs. Shared by every slot of the worker pool.
pub struct JobRunner {
    coordinator: Arc<dyn Coordinator>,
    storage: Arc<dyn BulkStorage>,
    stacker: Arc<dyn Stacker>,
    preview: Option<Arc<dyn PreviewRenderer>>,
    work_dir: PathBuf,
    base_path: String,
}

impl JobRunner {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        storage: Arc<dyn BulkStorage>,
        stacker: Arc<dyn Stacker>,
        work_dir: impl Into<PathBuf>,
        base_path: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            storage,
            stacker,
            preview: None,
            work_dir: work_dir.into(),
            base_path: base_path.into(),
        }
    }

    /// Enable the preview step.
    pub fn with_preview(mut self, preview: Arc<dyn PreviewRenderer>) -> Self {
        self.preview = Some(preview);
        self
    }

    /// Run `job` to a disposition.
    ///
    /// `cancel` is consulted once, before any work: a cancelled slot
    /// reports the job back as failed so the coordinator can re-offer it.
    /// A run that has started is never interrupted.
    pub async fn run(&self, job: &Job, cancel: &CancellationToken) -> Disposition {
        let job_id = job.job_id;

        if cancel.is_cancelled() {
            tracing::info!(job_id, chunk_key = %job.chunk_key, "Slot cancelled before start");
            let reported = self.report_failure(job_id, CANCELLED_BEFORE_START).await;
            return Disposition::Cancelled { job_id, reported };
        }

        tracing::info!(
            job_id,
            chunk_key = %job.chunk_key,
            object = %job.subject(),
            "Job started",
        );

        let workspace = match Workspace::create(&self.work_dir, job_id) {
            Ok(ws) => ws,
            Err(e) => return self.fail(job, JobStage::Fetching, e.into()).await,
        };

        let mut stage = JobStage::Fetching;
        let outcome = AssertUnwindSafe(self.execute(job, &workspace, &mut stage))
            .catch_unwind()
            .await;

        let disposition = match outcome {
            Ok(Ok(report)) => {
                tracing::info!(
                    job_id,
                    chunk_key = %job.chunk_key,
                    n_frames_aligned = report.metadata.n_frames_aligned,
                    n_frames_input = report.metadata.n_frames_input,
                    file_size_bytes = report.file_size_bytes,
                    "Job completed",
                );
                Disposition::Completed {
                    job_id,
                    ucloud_path: report.ucloud_path,
                    thumbnail_path: report.thumbnail_path,
                    file_size_bytes: report.file_size_bytes,
                }
            }
            Ok(Err(StageFailure { stage, error })) => self.fail(job, stage, error).await,
            Err(payload) => {
                self.fail_after_panic(job, stage, &panic_message(payload.as_ref()))
                    .await
            }
        };

        workspace.remove().await;
        disposition
    }

    /// Scratch root this runner creates workspaces under.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Dispose of a job whose run panicked during `stage`.
    pub async fn fail_after_panic(
        &self,
        job: &Job,
        stage: JobStage,
        panic_message: &str,
    ) -> Disposition {
        let message = format!("Worker panicked: {panic_message}");
        tracing::error!(job_id = job.job_id, stage = %stage, error = %message, "Job run panicked");
        let message = naming::truncate_message(&message);
        let reported = self.report_failure(job.job_id, &message).await;
        Disposition::Failed {
            job_id: job.job_id,
            stage,
            message,
            reported,
        }
    }

    /// The stage pipeline. `stage` always holds the stage in progress,
    /// so a panic can be attributed after unwinding.
    async fn execute(
        &self,
        job: &Job,
        workspace: &Workspace,
        stage: &mut JobStage,
    ) -> Result<CompletionReport, StageFailure> {
        let job_id = job.job_id;
        let mut enter = |next: JobStage, msg: &str| {
            *stage = next;
            tracing::info!(job_id, chunk_key = %job.chunk_key, stage = %next, "{msg}");
        };

        // -- FETCHING --
        enter(JobStage::Fetching, "Fetching input list");
        let files = self
            .coordinator
            .fetch_inputs(job_id)
            .await
            .map_err(at(JobStage::Fetching))?;
        if files.is_empty() {
            return Err(at(JobStage::Fetching)(JobError::NoInputs));
        }

        enter(
            JobStage::Fetching,
            &format!("Downloading {} raw files", files.len()),
        );
        let inputs_dir = workspace.inputs_dir();
        let mut local_inputs = Vec::with_capacity(files.len());
        for (file, name) in files.iter().zip(local_names(&files)) {
            let dest = inputs_dir.join(name);
            self.coordinator
                .download_input(file, &dest)
                .await
                .map_err(at(JobStage::Fetching))?;
            local_inputs.push(dest);
        }

        // -- PROCESSING --
        enter(
            JobStage::Processing,
            &format!("Stacking {} frames", local_inputs.len()),
        );
        let stack_name = naming::stack_filename(job);
        let stack_local = workspace.file(&stack_name);
        let summary = self
            .stacker
            .stack(&local_inputs, &stack_local)
            .await
            .map_err(at(JobStage::Processing))?;
        let metadata = StackMetadata::from(&summary);

        // -- DERIVING (best-effort) --
        let thumb_name = naming::thumbnail_filename(job);
        let thumb_local = if self.preview.is_some() {
            enter(JobStage::Deriving, "Rendering preview");
            derive_preview(
                self.preview.as_deref(),
                &stack_local,
                &workspace.file(&thumb_name),
            )
            .await
        } else {
            None
        };

        // -- UPLOADING --
        let remote_dir = naming::remote_stack_dir(&self.base_path, job);
        let stack_remote = format!("{remote_dir}/{stack_name}");
        enter(
            JobStage::Uploading,
            &format!("Uploading stack to {stack_remote}"),
        );
        self.storage
            .create_dir(&remote_dir)
            .await
            .map_err(at(JobStage::Uploading))?;
        self.storage
            .put_object(&stack_local, &stack_remote)
            .await
            .map_err(at(JobStage::Uploading))?;

        let thumbnail_remote = match thumb_local {
            Some(thumb) => {
                let remote = format!("{remote_dir}/{thumb_name}");
                self.storage
                    .put_object(&thumb, &remote)
                    .await
                    .map_err(at(JobStage::Uploading))?;
                Some(remote)
            }
            None => None,
        };

        let file_size_bytes = tokio::fs::metadata(&stack_local)
            .await
            .map_err(at(JobStage::Uploading))?
            .len();

        // -- REPORTING --
        enter(JobStage::Reporting, "Reporting completion");
        let report = CompletionReport {
            job_id,
            ucloud_path: stack_remote,
            thumbnail_path: thumbnail_remote,
            file_size_bytes,
            metadata,
        };
        self.coordinator
            .report_success(&report)
            .await
            .map_err(at(JobStage::Reporting))?;

        Ok(report)
    }

    async fn fail(&self, job: &Job, stage: JobStage, error: JobError) -> Disposition {
        tracing::error!(
            job_id = job.job_id,
            chunk_key = %job.chunk_key,
            stage = %stage,
            error = %error,
            "Job failed",
        );
        let message = naming::truncate_message(&error.to_string());
        let reported = self.report_failure(job.job_id, &message).await;
        Disposition::Failed {
            job_id: job.job_id,
            stage,
            message,
            reported,
        }
    }

    /// Report a failure; returns whether the coordinator accepted it.
    async fn report_failure(&self, job_id: JobId, message: &str) -> bool {
        match self.coordinator.report_failure(job_id, message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    job_id,
                    error = %e,
                    "Could not report failure to coordinator, job left unresolved",
                );
                false
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Local file names for `files`, unique within one job.
///
/// Two inputs sharing a name would overwrite each other on disk, so
/// later duplicates are prefixed with their input id.
fn local_names(files: &[InputFile]) -> Vec<String> {
    let mut seen = HashSet::new();
    files
        .iter()
        .map(|file| {
            let name = file.local_name();
            if seen.insert(name.clone()) {
                name
            } else {
                let unique = format!("{}_{name}", file.id);
                seen.insert(unique.clone());
                unique
            }
        })
        .collect()
}
