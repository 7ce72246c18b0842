//! Client for the coordinator's worker API.
//!
//! [`Coordinator`] is the contract the dispatcher and executor consume;
//! [`CoordinatorClient`] implements it over HTTP. Every call carries the
//! worker's bearer credential.
//!
//! | Operation      | HTTP                                          |
//! |----------------|-----------------------------------------------|
//! | claim-next     | `GET  /next_job.php?worker_id=…` (204 = none) |
//! | fetch-inputs   | `GET  /job_files.php?job_id=…`                |
//! | download-input | `GET  /download_raw.php?file_id=…` (streamed) |
//! | report-success | `POST /complete_job.php`                      |
//! | report-failure | `POST /fail_job.php`                          |

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crowdsky_core::metadata::CompletionReport;
use crowdsky_core::types::{InputFile, Job, JobFiles, JobId};

/// Timeout for control-plane calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a single raw-frame download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors from the coordinator API layer.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("Coordinator request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The coordinator returned a non-2xx status code.
    #[error("Coordinator API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// Writing a downloaded input to disk failed.
    #[error("Failed to write input file: {0}")]
    Io(#[from] std::io::Error),
}

/// The remote job contract.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Claim the next pending job, or `None` when there is nothing to do.
    async fn claim_next(&self) -> Result<Option<Job>, CoordinatorError>;

    /// List the input frames of a claimed job, in stacking order.
    async fn fetch_inputs(&self, job_id: JobId) -> Result<Vec<InputFile>, CoordinatorError>;

    /// Stream one input frame to `dest`.
    async fn download_input(&self, file: &InputFile, dest: &Path) -> Result<(), CoordinatorError>;

    /// Report a completed job together with its metadata.
    async fn report_success(&self, report: &CompletionReport) -> Result<(), CoordinatorError>;

    /// Report a failed job. `message` is already truncated by the caller.
    async fn report_failure(&self, job_id: JobId, message: &str) -> Result<(), CoordinatorError>;
}

#[derive(Debug, Serialize)]
struct FailurePayload<'a> {
    job_id: JobId,
    error_message: &'a str,
}

/// HTTP implementation of [`Coordinator`].
pub struct CoordinatorClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    worker_id: String,
}

impl CoordinatorClient {
    /// Create a client for the API rooted at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            worker_id: worker_id.into(),
        }
    }

    fn get(&self, endpoint: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}/{endpoint}", self.base_url))
            .bearer_auth(&self.api_key)
    }

    fn post(&self, endpoint: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/{endpoint}", self.base_url))
            .bearer_auth(&self.api_key)
    }

    // ---- private helpers ----

    /// Return the response unchanged on a 2xx status, otherwise an
    /// [`CoordinatorError::Api`] carrying status and body text.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, CoordinatorError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(CoordinatorError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CoordinatorError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl Coordinator for CoordinatorClient {
    async fn claim_next(&self) -> Result<Option<Job>, CoordinatorError> {
        let response = self
            .get("next_job.php")
            .query(&[("worker_id", self.worker_id.as_str())])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Self::parse_response(response).await.map(Some)
    }

    async fn fetch_inputs(&self, job_id: JobId) -> Result<Vec<InputFile>, CoordinatorError> {
        let response = self
            .get("job_files.php")
            .query(&[("job_id", job_id)])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let files: JobFiles = Self::parse_response(response).await?;
        Ok(files.files)
    }

    async fn download_input(&self, file: &InputFile, dest: &Path) -> Result<(), CoordinatorError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self
            .get("download_raw.php")
            .query(&[("file_id", file.id)])
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?;
        let mut response = Self::ensure_success(response).await?;

        let mut out = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response.chunk().await? {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        Ok(())
    }

    async fn report_success(&self, report: &CompletionReport) -> Result<(), CoordinatorError> {
        let response = self
            .post("complete_job.php")
            .json(report)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn report_failure(&self, job_id: JobId, message: &str) -> Result<(), CoordinatorError> {
        let response = self
            .post("fail_job.php")
            .json(&FailurePayload {
                job_id,
                error_message: message,
            })
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }
}
