//! In-memory collaborators for driving the executor and dispatcher.
//!
//! Every fake records what it was asked to do so tests can assert on the
//! exact sequence of calls, and exposes switches to make individual
//! operations fail.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use crowdsky_cloud::{BulkStorage, StorageError};
use crowdsky_core::metadata::{CompletionReport, FrameHeader, StackSummary};
use crowdsky_core::types::{InputFile, Job, JobId};
use crowdsky_worker::coordinator::{Coordinator, CoordinatorError};
use crowdsky_worker::dispatcher::DispatchSettings;
use crowdsky_worker::executor::JobRunner;
use crowdsky_worker::preview::PreviewRenderer;
use crowdsky_worker::process::ProcessError;
use crowdsky_worker::stacker::Stacker;

pub const BASE_PATH: &str = "/crowdsky";

/// Bytes the fake stacker writes as its output.
pub const STACK_BYTES: &[u8] = b"SIMPLE  =                    T";

/// A claimable job with sensible defaults.
pub fn job(job_id: JobId) -> Job {
    Job {
        job_id,
        user_id: 7,
        upload_session_id: 100 + job_id,
        chunk_key: format!("chunk{job_id}"),
        object_name: Some("M 31".to_string()),
        frame_count: 2,
        session_ucloud_path: None,
    }
}

/// `count` input references named `frame_{n}.fit`.
pub fn inputs(count: usize) -> Vec<InputFile> {
    (1..=count)
        .map(|n| InputFile {
            id: n as i64,
            filename: format!("frame_{n}.fit"),
            ucloud_path: Some(format!("/raw/frame_{n}.fit")),
        })
        .collect()
}

/// Dispatch settings with a 30 s poll, 2 s recheck, 60 s shutdown.
pub fn settings(max_workers: usize) -> DispatchSettings {
    DispatchSettings {
        max_workers,
        poll_interval: Duration::from_secs(30),
        busy_recheck_interval: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(60),
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeCoordinator {
    queue: Mutex<VecDeque<Job>>,
    inputs: Mutex<HashMap<JobId, Vec<InputFile>>>,
    claims: AtomicUsize,
    pub fail_claims: AtomicBool,
    pub fail_report_success: AtomicBool,
    pub fail_report_failure: AtomicBool,
    downloads: Mutex<Vec<PathBuf>>,
    successes: Mutex<Vec<CompletionReport>>,
    failures: Mutex<Vec<(JobId, String)>>,
    reported: Notify,
}

impl FakeCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue `job` for claiming with `input_count` inputs.
    pub fn push_job(&self, job: Job, input_count: usize) {
        self.inputs
            .lock()
            .unwrap()
            .insert(job.job_id, inputs(input_count));
        self.queue.lock().unwrap().push_back(job);
    }

    pub fn set_inputs(&self, job_id: JobId, files: Vec<InputFile>) {
        self.inputs.lock().unwrap().insert(job_id, files);
    }

    pub fn claims(&self) -> usize {
        self.claims.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> Vec<PathBuf> {
        self.downloads.lock().unwrap().clone()
    }

    pub fn successes(&self) -> Vec<CompletionReport> {
        self.successes.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<(JobId, String)> {
        self.failures.lock().unwrap().clone()
    }

    /// Number of report calls seen, successful or not.
    pub fn report_attempts(&self) -> usize {
        self.successes.lock().unwrap().len() + self.failures.lock().unwrap().len()
    }

    /// Wait until at least `n` report calls have been made.
    pub async fn wait_for_reports(&self, n: usize) {
        loop {
            let notified = self.reported.notified();
            if self.report_attempts() >= n {
                return;
            }
            notified.await;
        }
    }

    fn api_error(status: u16) -> CoordinatorError {
        CoordinatorError::Api {
            status,
            body: "injected".to_string(),
        }
    }
}

#[async_trait]
impl Coordinator for FakeCoordinator {
    async fn claim_next(&self) -> Result<Option<Job>, CoordinatorError> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(Self::api_error(503));
        }
        Ok(self.queue.lock().unwrap().pop_front())
    }

    async fn fetch_inputs(&self, job_id: JobId) -> Result<Vec<InputFile>, CoordinatorError> {
        Ok(self
            .inputs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn download_input(&self, file: &InputFile, dest: &Path) -> Result<(), CoordinatorError> {
        tokio::fs::write(dest, format!("raw frame {}", file.id)).await?;
        self.downloads.lock().unwrap().push(dest.to_path_buf());
        Ok(())
    }

    async fn report_success(&self, report: &CompletionReport) -> Result<(), CoordinatorError> {
        // Recorded even when rejected so tests can see the attempt.
        self.successes.lock().unwrap().push(report.clone());
        self.reported.notify_waiters();
        if self.fail_report_success.load(Ordering::SeqCst) {
            return Err(Self::api_error(500));
        }
        Ok(())
    }

    async fn report_failure(&self, job_id: JobId, message: &str) -> Result<(), CoordinatorError> {
        self.failures
            .lock()
            .unwrap()
            .push((job_id, message.to_string()));
        self.reported.notify_waiters();
        if self.fail_report_failure.load(Ordering::SeqCst) {
            return Err(Self::api_error(500));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bulk storage
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeStorage {
    dirs: Mutex<Vec<String>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_create_dir: AtomicBool,
    pub fail_put: AtomicBool,
    pub panic_put: AtomicBool,
}

impl FakeStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dirs(&self) -> Vec<String> {
        self.dirs.lock().unwrap().clone()
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    fn api_error(path: &str) -> StorageError {
        StorageError::Api {
            status: 507,
            path: path.to_string(),
            body: "Insufficient Storage".to_string(),
        }
    }
}

#[async_trait]
impl BulkStorage for FakeStorage {
    async fn create_dir(&self, remote_dir: &str) -> Result<(), StorageError> {
        if self.fail_create_dir.load(Ordering::SeqCst) {
            return Err(Self::api_error(remote_dir));
        }
        self.dirs.lock().unwrap().push(remote_dir.to_string());
        Ok(())
    }

    async fn put_object(&self, local: &Path, remote_path: &str) -> Result<(), StorageError> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(Self::api_error(remote_path));
        }
        if self.panic_put.load(Ordering::SeqCst) {
            panic!("storage client exploded");
        }
        let bytes = tokio::fs::read(local).await?;
        self.objects
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), bytes);
        Ok(())
    }

    async fn get_object(&self, remote_path: &str, local: &Path) -> Result<(), StorageError> {
        let bytes = self
            .object(remote_path)
            .ok_or_else(|| Self::api_error(remote_path))?;
        tokio::fs::write(local, bytes).await?;
        Ok(())
    }

    async fn delete_object(&self, remote_path: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(remote_path);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stacker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StackMode {
    Succeed,
    Fail(String),
    Panic,
}

pub struct FakeStacker {
    mode: Mutex<StackMode>,
    /// When set, every run waits for one permit before finishing.
    gate: Option<Arc<Semaphore>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<PathBuf>>,
    started_notify: Notify,
}

impl FakeStacker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// A stacker whose runs block until [`FakeStacker::release`] is called.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self::build(Some(Arc::new(Semaphore::new(0)))))
    }

    fn build(gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            mode: Mutex::new(StackMode::Succeed),
            gate,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            started_notify: Notify::new(),
        }
    }

    pub fn set_mode(&self, mode: StackMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Let `n` blocked runs finish.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Output paths of every run started so far, in start order.
    pub fn started(&self) -> Vec<PathBuf> {
        self.started.lock().unwrap().clone()
    }

    /// Wait until at least `n` runs have started.
    pub async fn wait_started(&self, n: usize) {
        loop {
            let notified = self.started_notify.notified();
            if self.started.lock().unwrap().len() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Stacker for FakeStacker {
    async fn stack(&self, inputs: &[PathBuf], output: &Path) -> Result<StackSummary, ProcessError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().push(output.to_path_buf());
        self.started_notify.notify_waiters();

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let mode = self.mode.lock().unwrap().clone();
        let result = match mode {
            StackMode::Succeed => {
                tokio::fs::write(output, STACK_BYTES).await?;
                Ok(StackSummary {
                    n_frames_input: inputs.len() as u32,
                    n_aligned: inputs.len() as u32,
                    n_stars_detected: Some(120),
                    frames: (0..inputs.len())
                        .map(|n| FrameHeader {
                            exptime: Some(30.0),
                            date_obs: Some(format!("2024-03-01T20:0{n}:00")),
                            ra: Some(10.0 + n as f64),
                            dec: Some(41.0),
                        })
                        .collect(),
                })
            }
            StackMode::Fail(message) => Err(ProcessError::ExecutionFailed {
                exit_code: 1,
                stderr: message,
            }),
            StackMode::Panic => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                panic!("stacker exploded");
            }
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ---------------------------------------------------------------------------
// Preview
// ---------------------------------------------------------------------------

pub struct FakePreview {
    pub fail: bool,
}

#[async_trait]
impl PreviewRenderer for FakePreview {
    async fn render(&self, _stack: &Path, output: &Path) -> Result<(), ProcessError> {
        if self.fail {
            return Err(ProcessError::ExecutionFailed {
                exit_code: 2,
                stderr: "cannot read FITS".to_string(),
            });
        }
        tokio::fs::write(output, b"\x89PNG").await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Harness {
    pub coordinator: Arc<FakeCoordinator>,
    pub storage: Arc<FakeStorage>,
    pub stacker: Arc<FakeStacker>,
    pub scratch: tempfile::TempDir,
}

impl Harness {
    pub fn new(stacker: Arc<FakeStacker>) -> Self {
        Self {
            coordinator: FakeCoordinator::new(),
            storage: FakeStorage::new(),
            stacker,
            scratch: tempfile::tempdir().unwrap(),
        }
    }

    pub fn runner(&self) -> JobRunner {
        JobRunner::new(
            self.coordinator.clone(),
            self.storage.clone(),
            self.stacker.clone(),
            self.scratch.path(),
            BASE_PATH,
        )
    }

    pub fn runner_with_preview(&self, fail: bool) -> JobRunner {
        self.runner().with_preview(Arc::new(FakePreview { fail }))
    }

    /// Entries left in the scratch root.
    pub fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.scratch.path()).unwrap().count()
    }

    /// Replace the scratch root with a plain file, which no amount of
    /// `create_dir_all` can turn back into a directory.
    pub fn break_scratch_root(&self) {
        std::fs::remove_dir(self.scratch.path()).unwrap();
        std::fs::write(self.scratch.path(), b"not a directory").unwrap();
    }

    pub fn restore_scratch_root(&self) {
        std::fs::remove_file(self.scratch.path()).unwrap();
        std::fs::create_dir(self.scratch.path()).unwrap();
    }
}
