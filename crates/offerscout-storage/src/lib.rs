//! Page fetching, artifact capture and the record-store contract for offerscout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use offerscout_core::{RunOptions, DEFAULT_IDENTITY, DEFAULT_TIMEOUT_MS};
use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod memory;
mod postgres;
mod store;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;
pub use store::{RecordStore, StoreError};

pub const CRATE_NAME: &str = "offerscout-storage";

/// Where a captured page landed and whether an earlier capture already held the same bytes.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub final_url: String,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed capture of fetched pages, so a run's input can be inspected later.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `{source}/{yyyymmdd}/{hash}.html`
    pub fn page_relative_path(source_id: &str, page: &FetchedPage, content_hash: &str) -> PathBuf {
        [
            source_id.to_string(),
            page.fetched_at.format("%Y%m%d").to_string(),
            format!("{content_hash}.html"),
        ]
        .iter()
        .collect()
    }

    pub async fn store_page(
        &self,
        source_id: &str,
        page: &FetchedPage,
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(page.body.as_bytes());
        let relative_path = Self::page_relative_path(source_id, page, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let deduplicated = !write_new(&absolute_path, page.body.as_bytes()).await?;
        debug!(
            source_id,
            hash = %content_hash,
            deduplicated,
            path = %relative_path.display(),
            "page captured"
        );
        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            final_url: page.final_url.clone(),
            byte_size: page.body.len(),
            deduplicated,
        })
    }
}

/// Publishes `bytes` at `path` through a staging file in the same directory.
/// Returns `false` when `path` already existed and was left untouched.
async fn write_new(path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let dir = path
        .parent()
        .with_context(|| format!("artifact path {} has no parent", path.display()))?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating artifact directory {}", dir.display()))?;
    if fs::try_exists(path).await.unwrap_or(false) {
        return Ok(false);
    }

    let staging = dir.join(format!(".{}.partial", Uuid::new_v4()));
    fs::write(&staging, bytes)
        .await
        .with_context(|| format!("writing {}", staging.display()))?;
    if let Err(err) = fs::rename(&staging, path).await {
        let _ = fs::remove_file(&staging).await;
        if fs::try_exists(path).await.unwrap_or(false) {
            return Ok(false);
        }
        return Err(err).with_context(|| format!("publishing {}", path.display()));
    }
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only server errors are transient; client errors are reported straight away.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Client-wide defaults. Per-source `RunOptions` override the identity and timeout per request.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            user_agent: DEFAULT_IDENTITY.to_string(),
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub final_url: String,
    pub body: String,
    pub attempts: u32,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("timeout fetching {url}")]
    Timeout { url: String },
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Timeout { .. } | FetchError::Network { .. } => RetryDisposition::Retryable,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }

    fn from_reqwest(err: reqwest::Error, url: &str) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Network {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Retrieves one page body. The orchestrator only depends on this seam.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        source_id: &str,
        url: &str,
        options: &RunOptions,
    ) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .gzip(true)
            .brotli(true)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    async fn attempt(
        &self,
        url: &str,
        options: &RunOptions,
    ) -> Result<(u16, String, String), FetchError> {
        let resp = self
            .client
            .get(url)
            .header(USER_AGENT, options.identity.as_str())
            .timeout(Duration::from_millis(options.timeout_ms))
            .send()
            .await
            .map_err(|err| FetchError::from_reqwest(err, url))?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp
            .text()
            .await
            .map_err(|err| FetchError::from_reqwest(err, url))?;
        Ok((status.as_u16(), final_url, body))
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(
        &self,
        source_id: &str,
        url: &str,
        options: &RunOptions,
    ) -> Result<FetchedPage, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|err| FetchError::Network {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let span = info_span!("http_fetch", source_id, url, retries = options.retry_attempts);
        async move {
            let mut attempt = 0u32;
            loop {
                match self.attempt(url, options).await {
                    Ok((status, final_url, body)) => {
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                            attempts: attempt + 1,
                            fetched_at: Utc::now(),
                        });
                    }
                    Err(err) => {
                        if err.disposition() == RetryDisposition::Retryable
                            && attempt < options.retry_attempts
                        {
                            let delay = self.backoff.delay_for_attempt(attempt);
                            warn!(
                                attempt = attempt + 1,
                                ?delay,
                                error = %err,
                                "fetch attempt failed; retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(err);
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    fn fetched(body: &str) -> FetchedPage {
        FetchedPage {
            status: 200,
            final_url: "https://offers.example/switch".to_string(),
            body: body.to_string(),
            attempts: 1,
            fetched_at: DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[tokio::test]
    async fn identical_pages_share_one_artifact() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let page = fetched("<html>same</html>");

        let first = store.store_page("acme", &page).await.unwrap();
        let second = store.store_page("acme", &page).await.unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(
            first.relative_path,
            PathBuf::from("acme")
                .join("20260224")
                .join(format!("{}.html", first.content_hash))
        );
        assert_eq!(first.final_url, "https://offers.example/switch");
        assert_eq!(std::fs::read_to_string(&first.absolute_path).unwrap(), page.body);
    }

    #[tokio::test]
    async fn changed_pages_get_their_own_artifact() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let before = store.store_page("acme", &fetched("<p>£150</p>")).await.unwrap();
        let after = store.store_page("acme", &fetched("<p>£200</p>")).await.unwrap();

        assert_ne!(before.absolute_path, after.absolute_path);
        assert!(!after.deduplicated);
        assert_eq!(after.byte_size, "<p>£200</p>".len());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn only_server_errors_and_transport_failures_retry() {
        let url = "https://example.com".to_string();
        assert_eq!(
            FetchError::HttpStatus { status: 503, url: url.clone() }.disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(
            FetchError::HttpStatus { status: 404, url: url.clone() }.disposition(),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            FetchError::HttpStatus { status: 429, url: url.clone() }.disposition(),
            RetryDisposition::NonRetryable
        );
        assert_eq!(FetchError::Timeout { url }.disposition(), RetryDisposition::Retryable);
    }
}
