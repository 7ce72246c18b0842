//! The claim loop.
//!
//! Each iteration reaps finished slots, then claims one job if a slot is
//! free. A successful claim starts the job and loops again immediately,
//! so available work is drained as fast as capacity allows. Otherwise
//! the loop sleeps: a full poll interval when idle, a short recheck
//! interval while jobs are in flight.
//!
//! The scratch root is checked before every claim. While it is unusable
//! nothing is claimed and the loop backs off a full poll interval, so a
//! broken disk never turns the queue into a stream of failed jobs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::executor::{Disposition, JobRunner};
use crate::pool::{PoolStats, WorkerPool};
use crate::workspace::{self, WorkspaceError};

/// Why a single-shot dispatch could not run a job.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Claim(#[from] CoordinatorError),

    #[error(transparent)]
    Scratch(#[from] WorkspaceError),
}

/// Timing and capacity knobs of the claim loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub busy_recheck_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl From<&WorkerConfig> for DispatchSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            poll_interval: config.poll_interval,
            busy_recheck_interval: config.busy_recheck_interval,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// What one claim attempt produced.
enum ClaimOutcome {
    Started,
    Empty,
    Error,
    AtCapacity,
    ScratchUnavailable,
}

pub struct Dispatcher {
    coordinator: Arc<dyn Coordinator>,
    pool: WorkerPool,
    settings: DispatchSettings,
    scratch_root: PathBuf,
    consecutive_claim_errors: u32,
    scratch_down: bool,
}

impl Dispatcher {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        runner: Arc<JobRunner>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            coordinator,
            scratch_root: runner.work_dir().to_path_buf(),
            pool: WorkerPool::new(runner, settings.max_workers),
            settings,
            consecutive_claim_errors: 0,
            scratch_down: false,
        }
    }

    /// Run until `shutdown` is cancelled, then drain the pool.
    ///
    /// Returns the pool's final statistics.
    pub async fn run(mut self, shutdown: CancellationToken) -> PoolStats {
        tracing::info!(
            max_workers = self.settings.max_workers,
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            "Dispatcher started",
        );

        while !shutdown.is_cancelled() {
            self.pool.reap();

            let delay = match self.claim_one(&shutdown).await {
                ClaimOutcome::Started => continue,
                ClaimOutcome::Error | ClaimOutcome::ScratchUnavailable => {
                    self.settings.poll_interval
                }
                ClaimOutcome::Empty | ClaimOutcome::AtCapacity => {
                    if self.pool.occupied() > 0 {
                        self.settings.busy_recheck_interval
                    } else {
                        self.settings.poll_interval
                    }
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(
            running = self.pool.occupied(),
            "Shutdown requested, no longer claiming jobs",
        );
        self.pool.shutdown(self.settings.shutdown_timeout).await
    }

    /// Claim at most one job and run it to completion.
    ///
    /// Returns `Ok(None)` when the coordinator has nothing to offer.
    pub async fn run_once(mut self) -> Result<Option<Disposition>, DispatchError> {
        workspace::check_scratch_root(&self.scratch_root)?;
        let Some(slot) = self.pool.try_acquire_slot() else {
            return Ok(None);
        };
        let Some(job) = self.coordinator.claim_next().await? else {
            tracing::info!("No job available");
            return Ok(None);
        };
        tracing::info!(job_id = job.job_id, chunk_key = %job.chunk_key, "Job claimed");

        self.pool.spawn(job, slot);
        Ok(self.pool.join_next().await)
    }

    async fn claim_one(&mut self, shutdown: &CancellationToken) -> ClaimOutcome {
        let Some(slot) = self.pool.try_acquire_slot() else {
            return ClaimOutcome::AtCapacity;
        };
        if !self.scratch_usable() {
            return ClaimOutcome::ScratchUnavailable;
        }

        match self.coordinator.claim_next().await {
            Ok(Some(job)) => {
                self.consecutive_claim_errors = 0;
                tracing::info!(
                    job_id = job.job_id,
                    chunk_key = %job.chunk_key,
                    occupied = self.pool.occupied(),
                    max_workers = self.settings.max_workers,
                    "Job claimed",
                );
                // A job claimed while shutting down is handed back, not run.
                if shutdown.is_cancelled() {
                    self.pool.cancel_pending();
                }
                self.pool.spawn(job, slot);
                ClaimOutcome::Started
            }
            Ok(None) => {
                self.consecutive_claim_errors = 0;
                tracing::debug!("No job available");
                ClaimOutcome::Empty
            }
            Err(e) => {
                self.consecutive_claim_errors += 1;
                tracing::warn!(
                    error = %e,
                    consecutive_errors = self.consecutive_claim_errors,
                    retry_in_secs = self.settings.poll_interval.as_secs(),
                    "Failed to claim job",
                );
                ClaimOutcome::Error
            }
        }
    }

    /// Check the scratch root, logging transitions between usable and not.
    fn scratch_usable(&mut self) -> bool {
        match workspace::check_scratch_root(&self.scratch_root) {
            Ok(()) => {
                if self.scratch_down {
                    tracing::info!(
                        scratch_root = %self.scratch_root.display(),
                        "Scratch root usable again, resuming claims",
                    );
                    self.scratch_down = false;
                }
                true
            }
            Err(e) => {
                if !self.scratch_down {
                    tracing::error!(
                        error = %e,
                        retry_in_secs = self.settings.poll_interval.as_secs(),
                        "Scratch root unusable, not claiming jobs",
                    );
                    self.scratch_down = true;
                }
                false
            }
        }
    }
}
