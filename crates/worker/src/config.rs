//! Worker configuration.
//!
//! Built once at startup from environment variables (a `.env` file is
//! loaded by `main` first) and passed down by reference. Nothing in the
//! worker reads the environment after this point.
//!
//! | Env Var                 | Required | Default          |
//! |-------------------------|----------|------------------|
//! | `API_BASE_URL`          | yes      | --               |
//! | `WORKER_API_KEY`        | yes      | --               |
//! | `UCLOUD_WEBDAV_URL`     | yes      | --               |
//! | `UCLOUD_SHARE_TOKEN`    | yes      | --               |
//! | `UCLOUD_BASE_PATH`      | no       | `/crowdsky`      |
//! | `WORKER_ID`             | no       | `worker-01`      |
//! | `POLL_INTERVAL`         | no       | `30` (seconds)   |
//! | `MAX_WORKERS`           | no       | `2`              |
//! | `WORK_DIR`              | no       | `./tmp`          |
//! | `SHUTDOWN_TIMEOUT_SECS` | no       | `3600`           |
//! | `STACK_COMMAND`         | no       | `crowdsky-stack` |
//! | `STACK_TIMEOUT_SECS`    | no       | `3600`           |
//! | `PREVIEW_COMMAND`       | no       | unset (disabled) |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How soon to recheck slot occupancy when work is in flight but the
/// coordinator had nothing to hand out.
pub const BUSY_RECHECK_INTERVAL: Duration = Duration::from_secs(2);

const DEFAULT_BASE_PATH: &str = "/crowdsky";
const DEFAULT_WORKER_ID: &str = "worker-01";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_MAX_WORKERS: usize = 2;
const DEFAULT_WORK_DIR: &str = "./tmp";
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_STACK_COMMAND: &str = "crowdsky-stack";
const DEFAULT_STACK_TIMEOUT_SECS: u64 = 3600;

/// Configuration errors. Always fatal at startup.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable(s): {}", .0.join(", "))]
    MissingEnvVar(Vec<String>),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// An external command split into program and leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl FromStr for CommandLine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or("command must not be empty")?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

/// Everything the worker needs to run.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator API root, e.g. `https://crowdsky.example.org/api`.
    pub api_base_url: String,
    /// Bearer credential for the coordinator.
    pub api_key: String,
    /// Identifier sent with every claim.
    pub worker_id: String,
    /// Idle wait between claims when the coordinator has no work.
    pub poll_interval: Duration,
    /// Wait between claims while jobs are in flight.
    pub busy_recheck_interval: Duration,
    /// Hard cap on concurrently running jobs. Always at least 1.
    pub max_workers: usize,
    /// Scratch root holding one workspace per running job.
    pub work_dir: PathBuf,
    /// How long shutdown waits for running jobs before abandoning them.
    pub shutdown_timeout: Duration,
    /// WebDAV share root for stacked outputs.
    pub webdav_url: String,
    /// WebDAV share token.
    pub share_token: String,
    /// Base path on the share under which `stacks/` lives.
    pub base_path: String,
    /// Processing step command.
    pub stack_command: CommandLine,
    /// Wall-clock limit for one processing step run.
    pub stack_timeout: Duration,
    /// Preview step command; `None` disables previews.
    pub preview_command: Option<CommandLine>,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset. Every missing required key is
    /// reported in a single error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut missing = Vec::new();
        let mut required = |key: &str| {
            get(key).unwrap_or_else(|| {
                missing.push(key.to_string());
                String::new()
            })
        };
        let api_base_url = required("API_BASE_URL");
        let api_key = required("WORKER_API_KEY");
        let webdav_url = required("UCLOUD_WEBDAV_URL");
        let share_token = required("UCLOUD_SHARE_TOKEN");
        if !missing.is_empty() {
            return Err(ConfigError::MissingEnvVar(missing));
        }

        let max_workers: usize = parse_or(&get, "MAX_WORKERS", DEFAULT_MAX_WORKERS)?;
        if max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_WORKERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let stack_command = parse_or(
            &get,
            "STACK_COMMAND",
            CommandLine {
                program: DEFAULT_STACK_COMMAND.to_string(),
                args: Vec::new(),
            },
        )?;
        let preview_command = match get("PREVIEW_COMMAND") {
            Some(raw) => Some(parse_value("PREVIEW_COMMAND", &raw)?),
            None => None,
        };

        Ok(Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            api_key,
            worker_id: get("WORKER_ID").unwrap_or_else(|| DEFAULT_WORKER_ID.to_string()),
            poll_interval: Duration::from_secs(parse_or(
                &get,
                "POLL_INTERVAL",
                DEFAULT_POLL_INTERVAL_SECS,
            )?),
            busy_recheck_interval: BUSY_RECHECK_INTERVAL,
            max_workers,
            work_dir: get("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR)),
            shutdown_timeout: Duration::from_secs(parse_or(
                &get,
                "SHUTDOWN_TIMEOUT_SECS",
                DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            )?),
            webdav_url,
            share_token,
            base_path: get("UCLOUD_BASE_PATH").unwrap_or_else(|| DEFAULT_BASE_PATH.to_string()),
            stack_command,
            stack_timeout: Duration::from_secs(parse_or(
                &get,
                "STACK_TIMEOUT_SECS",
                DEFAULT_STACK_TIMEOUT_SECS,
            )?),
            preview_command,
        })
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}
