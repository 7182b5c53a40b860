//! Object-store access for publisher snapshot files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use pubsync_core::{ObjectListing, SnapshotObject};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "pubsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {key} not found")]
    NotFound { key: String },
    #[error("{op} failed for {target}: {source}")]
    Io {
        op: &'static str,
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{op} failed: {message}")]
    Backend {
        op: &'static str,
        message: String,
        retryable: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::NotFound { .. } => RetryDisposition::NonRetryable,
            StoreError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    RetryDisposition::NonRetryable
                }
                _ => RetryDisposition::Retryable,
            },
            StoreError::Backend { retryable, .. } => {
                if *retryable {
                    RetryDisposition::Retryable
                } else {
                    RetryDisposition::NonRetryable
                }
            }
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Lists every object under `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectListing>, StoreError>;

    async fn get(&self, key: &str) -> Result<SnapshotObject, StoreError>;
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Fetches one object, retrying transient failures with capped exponential backoff.
pub async fn fetch_with_backoff(
    store: &dyn SnapshotStore,
    key: &str,
    backoff: &BackoffPolicy,
) -> Result<SnapshotObject, StoreError> {
    let mut attempt = 0;
    loop {
        match store.get(key).await {
            Ok(object) => return Ok(object),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt < backoff.max_retries =>
            {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(key, attempt, ?delay, error = %err, "retrying snapshot fetch");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct S3SnapshotStore {
    client: Client,
    bucket: String,
}

impl S3SnapshotStore {
    /// Builds a client from the default AWS credential chain.
    #[tracing::instrument(level = "debug")]
    pub async fn new(cfg: &S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &cfg.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &cfg.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        let s3_cfg = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(cfg.endpoint.is_some())
            .build();

        Self {
            client: Client::from_conf(s3_cfg),
            bucket: cfg.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn sdk_error<E>(op: &'static str, err: SdkError<E, HttpResponse>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let retryable = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(_) => err
            .raw_response()
            .map(|r| r.status().as_u16() >= 500 || r.status().as_u16() == 429)
            .unwrap_or(false),
        _ => false,
    };
    StoreError::Backend {
        op,
        message: DisplayErrorContext(&err).to_string(),
        retryable,
    }
}

fn from_aws_datetime(value: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    value
        .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[async_trait]
impl SnapshotStore for S3SnapshotStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectListing>, StoreError> {
        let mut listings = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(t) = token.take() {
                req = req.continuation_token(t);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| sdk_error("s3 list_objects_v2", e))?;

            if let Some(contents) = resp.contents {
                for obj in contents {
                    let Some(key) = obj.key else {
                        continue;
                    };
                    if key.ends_with('/') {
                        continue;
                    }
                    listings.push(ObjectListing {
                        last_modified: from_aws_datetime(obj.last_modified.as_ref()),
                        key,
                    });
                }
            }

            if resp.is_truncated.unwrap_or(false) {
                token = resp.next_continuation_token;
                if token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        debug!(prefix, count = listings.len(), "listed snapshot objects");
        Ok(listings)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, key: &str) -> Result<SnapshotObject, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                    return Err(StoreError::NotFound {
                        key: key.to_string(),
                    });
                }
                return Err(sdk_error("s3 get_object", e));
            }
        };

        let last_modified = from_aws_datetime(resp.last_modified.as_ref());
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend {
                op: "s3 collect body",
                message: e.to_string(),
                retryable: true,
            })?
            .into_bytes()
            .to_vec();

        Ok(SnapshotObject {
            key: key.to_string(),
            last_modified,
            content_hash: sha256_hex(&bytes),
            bytes,
        })
    }
}

/// Directory-backed store: object keys are `/`-separated paths relative to `root`
/// and last-modified is the file mtime.
#[derive(Debug, Clone)]
pub struct LocalSnapshotStore {
    root: PathBuf,
}

impl LocalSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|seg| !seg.is_empty())
            .fold(self.root.clone(), |acc, seg| acc.join(seg))
    }

    /// Writes an object with a temp-file rename so readers never see a partial file.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let target = self.path_for(key);
        let io_err = |op: &'static str, path: &Path| {
            let target = path.display().to_string();
            move |source| StoreError::Io { op, target, source }
        };

        let parent = target.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(io_err("creating directory", &parent))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", sha256_hex(bytes), bytes.len()));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(io_err("creating temp file", &temp_path))?;
        file.write_all(bytes)
            .await
            .map_err(io_err("writing temp file", &temp_path))?;
        file.flush()
            .await
            .map_err(io_err("flushing temp file", &temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                op: "renaming temp file",
                target: target.display().to_string(),
                source,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectListing>, StoreError> {
        let mut listings = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(StoreError::Io {
                        op: "reading directory",
                        target: dir.display().to_string(),
                        source,
                    })
                }
            };
            while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
                op: "reading directory entry",
                target: dir.display().to_string(),
                source,
            })? {
                let path = entry.path();
                let meta = entry.metadata().await.map_err(|source| StoreError::Io {
                    op: "reading metadata",
                    target: path.display().to_string(),
                    source,
                })?;
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.rsplit('/').next().is_some_and(|name| name.starts_with('.')) {
                    continue;
                }
                if !key.starts_with(prefix) {
                    continue;
                }
                let last_modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or(DateTime::UNIX_EPOCH);
                listings.push(ObjectListing { key, last_modified });
            }
        }

        listings.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listings)
    }

    async fn get(&self, key: &str) -> Result<SnapshotObject, StoreError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(source) => {
                return Err(StoreError::Io {
                    op: "reading object",
                    target: path.display().to_string(),
                    source,
                })
            }
        };
        let last_modified = fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::UNIX_EPOCH);

        Ok(SnapshotObject {
            key: key.to_string(),
            last_modified,
            content_hash: sha256_hex(&bytes),
            bytes,
        })
    }
}
