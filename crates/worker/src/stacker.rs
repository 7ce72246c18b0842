//! The processing step: stack a job's input frames into one output.
//!
//! The stacking algorithm itself is external. [`CommandStacker`] runs
//! the configured command with a JSON request on stdin:
//!
//! ```json
//! {"inputs": ["/scratch/job_1_x/inputs/a.fit", "..."],
//!  "output": "/scratch/job_1_x/stack_c_1.fits",
//!  "method": "mean", "sigma_clip": 3.0}
//! ```
//!
//! and expects a [`StackSummary`] as JSON on stdout once the output file
//! has been written.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crowdsky_core::metadata::StackSummary;

use crate::config::CommandLine;
use crate::process::{self, CommandInput, ProcessError};

/// Combination method passed to the stacking command.
pub const STACK_METHOD: &str = "mean";

/// Sigma for outlier rejection passed to the stacking command.
pub const SIGMA_CLIP: f64 = 3.0;

/// Turns local input frames into one stacked output file.
#[async_trait]
pub trait Stacker: Send + Sync {
    /// Stack `inputs` into `output` and report per-frame metadata.
    async fn stack(&self, inputs: &[PathBuf], output: &Path) -> Result<StackSummary, ProcessError>;
}

#[derive(Debug, Serialize)]
struct StackRequest<'a> {
    inputs: &'a [PathBuf],
    output: &'a Path,
    method: &'static str,
    sigma_clip: f64,
}

/// [`Stacker`] backed by an external command.
pub struct CommandStacker {
    command: CommandLine,
    timeout: Duration,
}

impl CommandStacker {
    pub fn new(command: CommandLine, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl Stacker for CommandStacker {
    async fn stack(&self, inputs: &[PathBuf], output: &Path) -> Result<StackSummary, ProcessError> {
        let request = StackRequest {
            inputs,
            output,
            method: STACK_METHOD,
            sigma_clip: SIGMA_CLIP,
        };
        let stdin = serde_json::to_value(&request)
            .map_err(|e| ProcessError::InvalidOutput(format!("unserialisable request: {e}")))?;

        let result = process::run_command(
            &self.command,
            CommandInput {
                args: Vec::new(),
                stdin: Some(stdin),
                working_directory: output.parent().map(Path::to_path_buf),
                timeout: self.timeout,
            },
        )
        .await?;

        let summary = parse_summary(&result.stdout)?;
        if !tokio::fs::try_exists(output).await? {
            return Err(ProcessError::MissingOutput(output.to_path_buf()));
        }

        tracing::debug!(
            n_frames_input = summary.n_frames_input,
            n_aligned = summary.n_aligned,
            duration_ms = result.duration_ms,
            "Stacking command finished",
        );
        Ok(summary)
    }
}

/// Parse the summary from stdout.
///
/// Accepts either a pure JSON document or log lines followed by the JSON
/// summary on the last non-empty line.
fn parse_summary(stdout: &str) -> Result<StackSummary, ProcessError> {
    let trimmed = stdout.trim();
    if let Ok(summary) = serde_json::from_str(trimmed) {
        return Ok(summary);
    }
    let last_line = trimmed.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    serde_json::from_str(last_line).map_err(|e| {
        ProcessError::InvalidOutput(format!("stacking summary is not valid JSON: {e}"))
    })
}
