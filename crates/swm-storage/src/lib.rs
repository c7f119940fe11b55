//! Object storage backends + HTTP fetch utilities for SWM.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "swm-storage";

pub const GCS_API_BASE: &str = "https://storage.googleapis.com";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object name: {0}")]
    InvalidName(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Flat bucket-style storage addressed by `/`-separated object names.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket the object names are relative to.
    fn bucket(&self) -> &str;

    fn describe(&self) -> String;

    /// Objects whose name starts with `prefix`, sorted by name.
    async fn list(&self, prefix: &str, max_results: Option<usize>) -> Result<Vec<ObjectMeta>, StoreError>;

    async fn read(&self, name: &str) -> Result<Vec<u8>, StoreError>;

    async fn write(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<(), StoreError>;

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        match self.read(name).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn read_text(&self, name: &str) -> Result<String, StoreError> {
        let bytes = self.read(name).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Object store rooted at a local directory; one file per object.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    bucket: String,
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(bucket: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(name.trim_start_matches('/'));
        if name.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn object_name(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        Some(parts.join("/"))
    }

    async fn walk_files(&self, start: PathBuf) -> Result<Vec<(PathBuf, u64)>, StoreError> {
        let mut out = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(StoreError::Io {
                        path: dir.display().to_string(),
                        source,
                    })
                }
            };
            while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
                path: dir.display().to_string(),
                source,
            })? {
                let meta = entry.metadata().await.map_err(|source| StoreError::Io {
                    path: entry.path().display().to_string(),
                    source,
                })?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else if meta.is_file() {
                    out.push((entry.path(), meta.len()));
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn describe(&self) -> String {
        format!("file://{} (bucket {})", self.root.display(), self.bucket)
    }

    async fn list(&self, prefix: &str, max_results: Option<usize>) -> Result<Vec<ObjectMeta>, StoreError> {
        // Only walk the deepest directory the prefix names.
        let start = match prefix.rfind('/') {
            Some(idx) => self.path_for(&prefix[..idx])?,
            None => self.root.clone(),
        };
        let mut objects = self
            .walk_files(start)
            .await?
            .into_iter()
            .filter_map(|(path, size)| {
                let name = self.object_name(&path)?;
                name.starts_with(prefix).then_some(ObjectMeta { name, size })
            })
            .filter(|meta| !is_temp_name(&meta.name))
            .collect::<Vec<_>>();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(limit) = max_results {
            objects.truncate(limit);
        }
        Ok(objects)
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(source) => Err(StoreError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Replace an object atomically via a temp file in the same directory.
    async fn write(&self, name: &str, bytes: &[u8], _content_type: &str) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        let io_err = |p: &Path| {
            let p = p.display().to_string();
            move |source| StoreError::Io { path: p, source }
        };
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidName(name.to_string()))?
            .to_path_buf();
        fs::create_dir_all(&parent).await.map_err(io_err(&parent))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(bytes).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: path.display().to_string(),
                source,
            });
        }
        Ok(())
    }
}

fn is_temp_name(name: &str) -> bool {
    name.rsplit('/')
        .next()
        .is_some_and(|file| file.starts_with('.') && file.ends_with(".tmp"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsListResponse {
    #[serde(default)]
    items: Vec<GcsObjectItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsObjectItem {
    name: String,
    #[serde(default)]
    size: Option<String>,
}

/// Google Cloud Storage JSON API backend.
#[derive(Debug, Clone)]
pub struct GcsObjectStore {
    client: reqwest::Client,
    bucket: String,
    access_token: Option<String>,
    api_base: String,
}

impl GcsObjectStore {
    pub fn new(
        bucket: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(timeout)
            .build()
            .context("building reqwest client for GCS")?;
        Ok(Self {
            client,
            bucket: bucket.into(),
            access_token,
            api_base: GCS_API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.api_base).map_err(|e| StoreError::Decode {
            url: self.api_base.clone(),
            message: e.to_string(),
        })?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Decode {
                url: self.api_base.clone(),
                message: "api base cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn describe(&self) -> String {
        format!("gs://{}", self.bucket)
    }

    async fn list(&self, prefix: &str, max_results: Option<usize>) -> Result<Vec<ObjectMeta>, StoreError> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.url(&["storage", "v1", "b", &self.bucket, "o"])?;
            {
                let mut pairs = url.query_pairs_mut();
                pairs.append_pair("prefix", prefix);
                if let Some(limit) = max_results {
                    pairs.append_pair("maxResults", &limit.to_string());
                }
                if let Some(token) = &page_token {
                    pairs.append_pair("pageToken", token);
                }
            }
            let resp = self.authorized(self.client.get(url.clone())).send().await?;
            if !resp.status().is_success() {
                return Err(StoreError::HttpStatus {
                    status: resp.status().as_u16(),
                    url: url.to_string(),
                });
            }
            let page: GcsListResponse = resp.json().await.map_err(|e| StoreError::Decode {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            out.extend(page.items.into_iter().map(|item| ObjectMeta {
                size: item.size.and_then(|s| s.parse().ok()).unwrap_or(0),
                name: item.name,
            }));
            if max_results.is_some_and(|limit| out.len() >= limit) {
                break;
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        if let Some(limit) = max_results {
            out.truncate(limit);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let mut url = self.url(&["storage", "v1", "b", &self.bucket, "o", name])?;
        url.query_pairs_mut().append_pair("alt", "media");
        let resp = self.authorized(self.client.get(url.clone())).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(name.to_string())),
            status if status.is_success() => Ok(resp.bytes().await?.to_vec()),
            status => Err(StoreError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    async fn write(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<(), StoreError> {
        let mut url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", name);
        let req = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes.to_vec());
        let resp = self.authorized(req).send().await?;
        if !resp.status().is_success() {
            return Err(StoreError::HttpStatus {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Sequential GET client with a fixed per-request timeout.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
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
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, "retrying after transport error: {err}");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn local_store_writes_reads_and_lists_by_prefix() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new("bucket", dir.path());

        store
            .write("Tharuni/json_backups/2025-06-29/a.json", b"{}", "application/json")
            .await
            .expect("write a");
        store
            .write("Tharuni/json_backups/2025-06-29/b.json", b"[]", "application/json")
            .await
            .expect("write b");
        store
            .write("Tharuni/json_backups/2025-06-30/c.json", b"{}", "application/json")
            .await
            .expect("write c");

        let listed = store
            .list("Tharuni/json_backups/2025-06-29/", None)
            .await
            .expect("list");
        let names = listed.iter().map(|m| m.name.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "Tharuni/json_backups/2025-06-29/a.json",
                "Tharuni/json_backups/2025-06-29/b.json"
            ]
        );
        assert_eq!(listed[0].size, 2);

        let limited = store.list("Tharuni/", Some(1)).await.expect("list limited");
        assert_eq!(limited.len(), 1);

        let bytes = store
            .read("Tharuni/json_backups/2025-06-30/c.json")
            .await
            .expect("read");
        assert_eq!(bytes, b"{}");
    }

    #[tokio::test]
    async fn local_store_overwrites_and_reports_missing_objects() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new("bucket", dir.path());

        store.write("csv/a.csv", b"one", "text/csv").await.expect("first");
        store.write("csv/a.csv", b"two", "text/csv").await.expect("second");
        assert_eq!(store.read_text("csv/a.csv").await.expect("read"), "two");
        assert!(store.exists("csv/a.csv").await.expect("exists"));

        let missing = store.read("csv/none.csv").await.unwrap_err();
        assert!(missing.is_not_found());
        assert!(!store.exists("csv/none.csv").await.expect("exists"));
        assert!(store.list("nothing/here/", None).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn local_store_rejects_escaping_names() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new("bucket", dir.path());
        let err = store.read("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));
    }

    #[test]
    fn gcs_object_urls_encode_names_as_one_segment() {
        let store = GcsObjectStore::new("advitia", None, Duration::from_secs(1)).expect("store");
        let url = store
            .url(&["storage", "v1", "b", "advitia", "o", "Tharuni/json_backups/a b.json"])
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/advitia/o/Tharuni%2Fjson_backups%2Fa%20b.json"
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
