//! Subprocess execution for the external processing steps.
//!
//! [`run_command`] spawns a configured command, pipes an optional JSON
//! payload to its stdin, captures stdout/stderr and enforces a timeout
//! over the whole exchange.
//! Both the stacking step and the preview step delegate here.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::config::CommandLine;

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Longest stderr excerpt carried in an [`ProcessError::ExecutionFailed`].
const MAX_STDERR_EXCERPT_CHARS: usize = 2000;

/// Errors from running an external step.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The program could not be started at all.
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The command ran past its timeout and was killed.
    #[error("Command timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The command exited with a non-zero code.
    #[error("Command failed with exit code {exit_code}: {stderr}")]
    ExecutionFailed { exit_code: i32, stderr: String },

    /// The command succeeded but its stdout was not what we expected.
    #[error("Unexpected command output: {0}")]
    InvalidOutput(String),

    /// The command succeeded but did not write its output file.
    #[error("Command did not produce {}", .0.display())]
    MissingOutput(PathBuf),

    /// I/O error while talking to the child process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How to invoke a command for one run.
#[derive(Debug, Clone)]
pub struct CommandInput {
    /// Arguments appended after the configured ones.
    pub args: Vec<String>,
    /// JSON payload written to stdin, if any.
    pub stdin: Option<serde_json::Value>,
    /// Working directory for the child (current dir if `None`).
    pub working_directory: Option<PathBuf>,
    /// Maximum wall-clock time before the process is killed.
    pub timeout: Duration,
}

/// Captured output of a successful run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Run `command` to completion.
///
/// Non-zero exit is an error carrying the tail of stderr. On timeout the
/// child is dropped, which kills it (`kill_on_drop`).
pub async fn run_command(
    command: &CommandLine,
    input: CommandInput,
) -> Result<CommandOutput, ProcessError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .args(&input.args)
        .stdin(if input.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &input.working_directory {
        cmd.current_dir(dir);
    }

    let payload = input
        .stdin
        .as_ref()
        .map(serde_json::to_vec)
        .transpose()
        .map_err(|e| ProcessError::InvalidOutput(format!("unserialisable stdin: {e}")))?;

    let start = Instant::now();

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: command.program.clone(),
        source,
    })?;

    // Every pipe is serviced by its own task so `child.wait()` can borrow
    // `child` and a child that never drains stdin still hits the timeout.
    let stdin_task = child.stdin.take().zip(payload).map(|(mut stdin, bytes)| {
        tokio::spawn(async move {
            // The child may close stdin early; that is its business.
            let _ = stdin.write_all(&bytes).await;
        })
    });
    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    let status = match tokio::time::timeout(input.timeout, child.wait()).await {
        Ok(result) => result?,
        Err(_elapsed) => {
            if let Some(task) = stdin_task {
                task.abort();
            }
            return Err(ProcessError::Timeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
            });
        }
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

    if !status.success() {
        return Err(ProcessError::ExecutionFailed {
            exit_code: status.code().unwrap_or(-1),
            stderr: stderr_excerpt(&stderr),
        });
    }

    tracing::debug!(program = %command.program, duration_ms, "Command finished");

    Ok(CommandOutput {
        stdout,
        stderr,
        duration_ms,
    })
}

/// Last [`MAX_STDERR_EXCERPT_CHARS`] characters of stderr, trimmed.
///
/// Tracebacks put the useful line at the end.
fn stderr_excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= MAX_STDERR_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - MAX_STDERR_EXCERPT_CHARS).collect()
}

/// Read an entire output stream, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}
