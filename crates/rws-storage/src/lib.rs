//! Scoped scratch artifacts + HTTP fetch utilities for RWS.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rws-storage";

/// Directory under which per-run scratch artifacts are created.
#[derive(Debug, Clone, Default)]
pub struct ScratchSpace {
    root: Option<PathBuf>,
}

impl ScratchSpace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Scratch space inside the platform temp directory.
    pub fn system() -> Self {
        Self { root: None }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Acquire a fresh, uniquely named artifact owned by one run.
    ///
    /// The backing file is removed when the artifact is released or dropped, so it never
    /// outlives its owner even when the run unwinds early.
    pub fn acquire(&self, run_id: Uuid, label: &str) -> anyhow::Result<ScratchArtifact> {
        let run = run_id.simple().to_string();
        let prefix = format!("rws-{}-{}-", file_label(label), &run[..8]);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(".csv");

        let file = match &self.root {
            Some(root) => {
                std::fs::create_dir_all(root)
                    .with_context(|| format!("creating scratch directory {}", root.display()))?;
                builder
                    .tempfile_in(root)
                    .with_context(|| format!("creating scratch artifact in {}", root.display()))?
            }
            None => builder.tempfile().context("creating scratch artifact")?,
        };

        Ok(ScratchArtifact {
            file,
            content_hash: None,
            byte_size: 0,
        })
    }
}

/// Keep only `[A-Za-z0-9_-]` so a label can never name a directory.
fn file_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug)]
pub struct ScratchArtifact {
    file: NamedTempFile,
    content_hash: Option<String>,
    byte_size: usize,
}

impl ScratchArtifact {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Replace the artifact's content.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        fs::write(self.file.path(), bytes)
            .await
            .with_context(|| format!("writing scratch artifact {}", self.path().display()))?;
        self.content_hash = Some(ScratchSpace::sha256_hex(bytes));
        self.byte_size = bytes.len();
        Ok(())
    }

    pub async fn read_bytes(&self) -> anyhow::Result<Vec<u8>> {
        fs::read(self.file.path())
            .await
            .with_context(|| format!("reading scratch artifact {}", self.path().display()))
    }

    /// Delete the backing file now and report any failure to do so.
    pub fn release(self) -> std::io::Result<()> {
        let path = self.file.path().to_path_buf();
        self.file.close()?;
        debug!(path = %path.display(), "released scratch artifact");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

/// Single-attempt HTTP client. Callers decide whether a failure is worth repeating.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_bytes(
        &self,
        url: &str,
        query: &[(&str, &str)],
        bearer: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        self.send(request)
            .instrument(info_span!("http_fetch", method = "GET", url))
            .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.post(url).form(form);
        self.send(request)
            .instrument(info_span!("http_fetch", method = "POST", url))
            .await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<FetchedResponse, FetchError> {
        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ScratchSpace::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn scratch_artifact_round_trips_and_is_removed_on_release() {
        let dir = tempdir().expect("tempdir");
        let scratch = ScratchSpace::new(dir.path());
        let mut artifact = scratch
            .acquire(Uuid::new_v4(), "saved_look_1")
            .expect("acquire");
        artifact
            .write_bytes(b"Unique_ID,Col1\n1,a\n")
            .await
            .expect("write");

        assert_eq!(artifact.byte_size(), 19);
        assert!(artifact.content_hash().is_some());
        assert_eq!(
            artifact.read_bytes().await.expect("read"),
            b"Unique_ID,Col1\n1,a\n"
        );

        let path = artifact.path().to_path_buf();
        assert!(path.starts_with(dir.path()));
        artifact.release().expect("release");
        assert!(!path.exists());
    }

    #[test]
    fn labels_with_path_separators_stay_inside_the_scratch_root() {
        let dir = tempdir().expect("tempdir");
        let scratch = ScratchSpace::new(dir.path());
        let artifact = scratch
            .acquire(Uuid::new_v4(), "revenue/cost\\..")
            .expect("acquire");
        assert_eq!(artifact.path().parent(), Some(dir.path()));
        let name = artifact.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("rws-revenue_cost___-"), "{name}");
    }

    #[test]
    fn scratch_artifact_is_removed_when_dropped() {
        let dir = tempdir().expect("tempdir");
        let scratch = ScratchSpace::new(dir.path());
        let path = {
            let artifact = scratch.acquire(Uuid::new_v4(), "report").expect("acquire");
            artifact.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn concurrent_runs_get_distinct_artifacts() {
        let dir = tempdir().expect("tempdir");
        let scratch = ScratchSpace::new(dir.path());
        let run_id = Uuid::new_v4();
        let a = scratch.acquire(run_id, "report").expect("a");
        let b = scratch.acquire(run_id, "report").expect("b");
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn status_classification_marks_server_errors_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://looker.example.com".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        assert_eq!(err.status(), Some(503));
    }
}
