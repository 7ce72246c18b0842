//! Best-effort preview image generation.
//!
//! A preview is nice to have: when rendering fails the job still
//! completes, just without a thumbnail. [`derive_preview`] is the only
//! entry point the executor uses and never returns an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::CommandLine;
use crate::process::{self, CommandInput, ProcessError};

/// Longest edge of the rendered preview, in pixels.
pub const PREVIEW_MAX_SIZE: u32 = 512;

/// Wall-clock limit for one preview render.
pub const PREVIEW_TIMEOUT: Duration = Duration::from_secs(120);

/// Renders a preview image from a stacked output.
#[async_trait]
pub trait PreviewRenderer: Send + Sync {
    async fn render(&self, stack: &Path, output: &Path) -> Result<(), ProcessError>;
}

/// [`PreviewRenderer`] backed by an external command, invoked as
/// `<command> <stack> <output> --max-size 512`.
pub struct CommandPreview {
    command: CommandLine,
    timeout: Duration,
}

impl CommandPreview {
    pub fn new(command: CommandLine, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl PreviewRenderer for CommandPreview {
    async fn render(&self, stack: &Path, output: &Path) -> Result<(), ProcessError> {
        process::run_command(
            &self.command,
            CommandInput {
                args: vec![
                    stack.display().to_string(),
                    output.display().to_string(),
                    "--max-size".to_string(),
                    PREVIEW_MAX_SIZE.to_string(),
                ],
                stdin: None,
                working_directory: None,
                timeout: self.timeout,
            },
        )
        .await?;
        Ok(())
    }
}

/// Try to render a preview next to `stack`.
///
/// Returns the preview path when it was rendered and exists on disk,
/// `None` (with a logged warning) otherwise.
pub async fn derive_preview(
    renderer: Option<&dyn PreviewRenderer>,
    stack: &Path,
    output: &Path,
) -> Option<PathBuf> {
    let renderer = renderer?;

    if let Err(e) = renderer.render(stack, output).await {
        tracing::warn!(error = %e, "Preview generation failed, continuing without it");
        return None;
    }

    match tokio::fs::try_exists(output).await {
        Ok(true) => Some(output.to_path_buf()),
        Ok(false) => {
            tracing::warn!(path = %output.display(), "Preview command produced no file");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not check preview file");
            None
        }
    }
}
