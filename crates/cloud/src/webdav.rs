//! WebDAV client for the bulk storage share.
//!
//! Wraps the handful of WebDAV verbs the worker needs (`MKCOL`, `PUT`,
//! `GET`, `DELETE`) using [`reqwest`]. The share is authenticated with
//! HTTP basic auth: the share token as user name and an empty password.
//!
//! Remote paths are split on `/` and each segment is percent-encoded, so
//! labels such as `M#31` stay part of the path.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::storage::{BulkStorage, StorageError};

/// Timeout for metadata calls (`MKCOL`, `DELETE`).
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for object transfers (`PUT`, `GET`).
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// HTTP client for a single WebDAV share.
pub struct WebDavStorage {
    client: reqwest::Client,
    base_url: String,
    share_token: String,
}

impl WebDavStorage {
    /// Create a client for the share rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, share_token: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, share_token)
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        share_token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            share_token: share_token.into(),
        }
    }

    fn url(&self, remote_path: &str) -> Result<Url, StorageError> {
        let invalid = || StorageError::InvalidUrl(self.base_url.clone());
        let mut url = Url::parse(&self.base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|()| invalid())?
            .pop_if_empty()
            .extend(remote_path.split('/').filter(|part| !part.is_empty()));
        Ok(url)
    }

    fn request(
        &self,
        method: Method,
        remote_path: &str,
    ) -> Result<reqwest::RequestBuilder, StorageError> {
        Ok(self
            .client
            .request(method, self.url(remote_path)?)
            .basic_auth(&self.share_token, Some("")))
    }

    /// Turn a response into an error unless its status is 2xx or one of
    /// the extra `accepted` codes.
    async fn check(
        response: reqwest::Response,
        remote_path: &str,
        accepted: &[StatusCode],
    ) -> Result<reqwest::Response, StorageError> {
        let status = response.status();
        if status.is_success() || accepted.contains(&status) {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(StorageError::Api {
            status: status.as_u16(),
            path: remote_path.to_string(),
            body,
        })
    }
}

/// Every ancestor of `remote_dir` including itself, shallowest first.
///
/// `"/a/b/c"` yields `"/a"`, `"/a/b"`, `"/a/b/c"`.
fn path_prefixes(remote_dir: &str) -> Vec<String> {
    let mut current = String::new();
    remote_dir
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| {
            current.push('/');
            current.push_str(part);
            current.clone()
        })
        .collect()
}

#[async_trait]
impl BulkStorage for WebDavStorage {
    async fn create_dir(&self, remote_dir: &str) -> Result<(), StorageError> {
        let mkcol = Method::from_bytes(b"MKCOL").expect("MKCOL is a valid method token");
        for prefix in path_prefixes(remote_dir) {
            let response = self
                .request(mkcol.clone(), &prefix)?
                .timeout(METADATA_TIMEOUT)
                .send()
                .await?;
            // 405 means the collection already exists.
            Self::check(response, &prefix, &[StatusCode::METHOD_NOT_ALLOWED]).await?;
        }
        tracing::debug!(remote_dir, "Remote directory ready");
        Ok(())
    }

    async fn put_object(&self, local: &Path, remote_path: &str) -> Result<(), StorageError> {
        let file = tokio::fs::File::open(local).await?;
        let len = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .request(Method::PUT, remote_path)?
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body)
            .timeout(TRANSFER_TIMEOUT)
            .send()
            .await?;
        Self::check(response, remote_path, &[]).await?;

        tracing::debug!(remote_path, bytes = len, "Uploaded object");
        Ok(())
    }

    async fn get_object(&self, remote_path: &str, local: &Path) -> Result<(), StorageError> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self
            .request(Method::GET, remote_path)?
            .timeout(TRANSFER_TIMEOUT)
            .send()
            .await?;
        let mut response = Self::check(response, remote_path, &[]).await?;

        let mut file = tokio::fs::File::create(local).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        tracing::debug!(remote_path, bytes = written, "Downloaded object");
        Ok(())
    }

    async fn delete_object(&self, remote_path: &str) -> Result<(), StorageError> {
        let response = self
            .request(Method::DELETE, remote_path)?
            .timeout(METADATA_TIMEOUT)
            .send()
            .await?;
        // 404 means it is already gone.
        Self::check(response, remote_path, &[StatusCode::NOT_FOUND]).await?;
        Ok(())
    }
}
