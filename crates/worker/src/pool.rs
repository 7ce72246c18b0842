//! Bounded pool of concurrently running jobs.
//!
//! Execution slots are the permits of a [`Semaphore`] sized to
//! `max_workers`. A slot is acquired *before* a job is claimed and is
//! moved into the job's task, so it is released exactly once, when that
//! task ends. Finished tasks are collected from a [`JoinSet`], which
//! doubles as the result channel.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crowdsky_core::types::Job;

use crate::executor::{panic_message, Disposition, JobRunner, JobStage};

/// One occupied execution slot.
pub type Slot = OwnedSemaphorePermit;

/// Running totals of reaped job tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Tasks that ended without a disposition (aborted by the runtime).
    pub lost: u64,
    /// Tasks still running when the shutdown timeout expired.
    pub abandoned: u64,
}

/// Runs claimed jobs on at most `max_workers` concurrent tasks.
pub struct WorkerPool {
    runner: Arc<JobRunner>,
    slots: Arc<Semaphore>,
    max_workers: usize,
    tasks: JoinSet<Disposition>,
    /// Cancels slots that have not started yet.
    cancel: CancellationToken,
    stats: PoolStats,
}

impl WorkerPool {
    pub fn new(runner: Arc<JobRunner>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            runner,
            slots: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            stats: PoolStats::default(),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Number of occupied slots (jobs whose task has not ended yet).
    pub fn occupied(&self) -> usize {
        self.max_workers - self.slots.available_permits()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Take a free slot, or `None` when the pool is at capacity.
    pub fn try_acquire_slot(&self) -> Option<Slot> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    /// Start running `job` in `slot`.
    pub fn spawn(&mut self, job: Job, slot: Slot) {
        let runner = Arc::clone(&self.runner);
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            // Held until the task ends, whatever the outcome.
            let _slot = slot;
            match AssertUnwindSafe(runner.run(&job, &cancel))
                .catch_unwind()
                .await
            {
                Ok(disposition) => disposition,
                // Stage panics are caught by the runner itself; anything
                // reaching here came from handling the outcome.
                Err(payload) => {
                    runner
                        .fail_after_panic(
                            &job,
                            JobStage::Reporting,
                            &panic_message(payload.as_ref()),
                        )
                        .await
                }
            }
        });
    }

    /// Collect every finished task without waiting. Returns how many
    /// were collected.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Some(result) = self.tasks.try_join_next() {
            Self::record(&mut self.stats, result);
            reaped += 1;
        }
        reaped
    }

    /// Wait for the next task to finish and return its disposition.
    ///
    /// Returns `None` when nothing is running.
    pub async fn join_next(&mut self) -> Option<Disposition> {
        loop {
            let result = self.tasks.join_next().await?;
            if let Some(disposition) = Self::record(&mut self.stats, result) {
                return Some(disposition);
            }
        }
    }

    /// Cancel every slot whose job has not started yet.
    ///
    /// Jobs already past their start are unaffected. Idempotent.
    pub fn cancel_pending(&self) {
        self.cancel.cancel();
    }

    /// Stop the pool.
    ///
    /// Slots that have not started are cancelled. Running jobs are
    /// awaited for up to `timeout`; any still running after that are
    /// detached and left to finish (or die with the process) on their own.
    pub async fn shutdown(mut self, timeout: Duration) -> PoolStats {
        self.cancel_pending();

        let running = self.tasks.len();
        if running > 0 {
            tracing::info!(
                running,
                timeout_secs = timeout.as_secs(),
                "Waiting for running jobs to finish",
            );
        }

        let stats = &mut self.stats;
        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = tasks.join_next().await {
                Self::record(stats, result);
            }
        })
        .await;

        if drained.is_err() {
            let abandoned = self.tasks.len();
            self.stats.abandoned += abandoned as u64;
            tracing::warn!(
                abandoned,
                "Shutdown timeout expired, abandoning running jobs",
            );
            self.tasks.detach_all();
        }

        tracing::info!(
            completed = self.stats.completed,
            failed = self.stats.failed,
            cancelled = self.stats.cancelled,
            abandoned = self.stats.abandoned,
            "Worker pool stopped",
        );
        self.stats
    }

    fn record(stats: &mut PoolStats, result: Result<Disposition, JoinError>) -> Option<Disposition> {
        match result {
            Ok(disposition) => {
                match &disposition {
                    Disposition::Completed { .. } => stats.completed += 1,
                    Disposition::Failed {
                        job_id, reported, ..
                    } => {
                        stats.failed += 1;
                        tracing::warn!(job_id, reported, "Job ended in failure");
                    }
                    Disposition::Cancelled { job_id, reported } => {
                        stats.cancelled += 1;
                        tracing::info!(job_id, reported, "Job cancelled before start");
                    }
                }
                Some(disposition)
            }
            Err(e) => {
                stats.lost += 1;
                tracing::error!(error = %e, "Job task ended without a disposition");
                None
            }
        }
    }
}
