//! Storage stage.
//!
//! Uploads capture evidence to an S3-compatible bucket (Cloudflare R2 in the
//! reference deployment) and applies the remote retention policy. Object keys
//! are derived from the capture's content hash and file timestamp, so a retry
//! after a transient failure lands on the same key instead of creating a
//! duplicate billable object.
//!
//! The pipeline itself is synchronous; the AWS SDK is driven through a
//! dedicated current-thread runtime owned by the store.

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

use crate::config::{StorageCredentials, StorageSettings};
use crate::error::StageError;
use crate::retry::{Attempt, RetryPolicy};

const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
const LIST_PAGE_SIZE: i32 = 1000;

/// A durably stored capture. Lifetime ends once the public URL has been
/// referenced in a notification or logged.
#[derive(Clone, Debug)]
pub struct UploadResult {
    pub object_key: String,
    pub public_url: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Aggregate bucket usage, for the admin CLI.
#[derive(Clone, Debug, Default)]
pub struct BucketStats {
    pub objects: usize,
    pub total_bytes: i64,
}

/// Object store seam. The S3 implementation is [`S3ObjectStore`]; tests swap
/// in fakes.
pub trait ObjectStore {
    fn upload(&self, image_path: &Path) -> Result<UploadResult, StageError>;

    /// Delete remote objects older than the retention window. Only objects
    /// whose age exceeds the threshold at invocation time are touched, so the
    /// call is safe to run concurrently with new uploads.
    fn cleanup(&self, older_than_days: u32) -> Result<usize, StageError>;

    fn list(&self, max: usize) -> Result<Vec<UploadResult>, StageError>;
}

/// Deterministic object key for one capture: prefix, capture date, file
/// timestamp, the first 8 hex chars of the content hash, and the source
/// file's extension.
pub fn object_key(
    prefix: &str,
    captured_at: DateTime<Utc>,
    content: &[u8],
    extension: &str,
) -> String {
    let digest = Sha256::digest(content);
    let short_hash = &hex::encode(digest)[..8];
    format!(
        "{}/{}/{}_{}.{}",
        prefix.trim_matches('/'),
        captured_at.format("%Y%m%d"),
        captured_at.timestamp(),
        short_hash,
        extension
    )
}

/// Lowercased extension of the capture file; unknown inputs fall back to
/// jpg, the motion daemon's native format.
pub fn key_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "jpg".to_string())
}

/// Accept either a bare object key or a public URL and return the key, so
/// operators can paste the URL straight out of a notification.
pub fn key_from_reference(reference: &str) -> String {
    match url::Url::parse(reference) {
        Ok(url) if !url.cannot_be_a_base() => url.path().trim_start_matches('/').to_string(),
        _ => reference.to_string(),
    }
}

/// Parse the capture timestamp back out of an object key. Keys that do not
/// follow the `{ts}_{hash}` filename layout yield `None` and are never
/// eligible for cleanup.
pub fn key_timestamp(key: &str) -> Option<i64> {
    let filename = key.rsplit('/').next()?;
    let (ts, _) = filename.split_once('_')?;
    ts.parse().ok()
}

pub struct S3ObjectStore {
    runtime: tokio::runtime::Runtime,
    client: S3Client,
    bucket: String,
    key_prefix: String,
    public_url_base: Option<String>,
    account_id: String,
    retry: RetryPolicy,
}

impl S3ObjectStore {
    pub fn new(
        settings: &StorageSettings,
        credentials: &StorageCredentials,
    ) -> Result<Self, StageError> {
        if settings.bucket.is_empty() {
            return Err(StageError::Upload(
                "storage.bucket is not configured".to_string(),
            ));
        }
        let endpoint = settings.endpoint_url.clone().unwrap_or_else(|| {
            format!(
                "https://{}.r2.cloudflarestorage.com",
                credentials.account_id
            )
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StageError::Upload(format!("failed to start storage runtime: {e}")))?;

        let client = runtime.block_on(async {
            let aws_config = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new("auto"))
                .credentials_provider(Credentials::new(
                    credentials.access_key_id.clone(),
                    credentials.secret_access_key.clone(),
                    None,
                    None,
                    "catwatch",
                ))
                .load()
                .await;
            let s3_config = S3ConfigBuilder::from(&aws_config)
                .endpoint_url(&endpoint)
                .force_path_style(true)
                .build();
            S3Client::from_conf(s3_config)
        });

        Ok(Self {
            runtime,
            client,
            bucket: settings.bucket.clone(),
            key_prefix: settings.key_prefix.clone(),
            public_url_base: settings.public_url_base.clone(),
            account_id: credentials.account_id.clone(),
            retry: RetryPolicy::new(2, Duration::from_secs(1)),
        })
    }

    fn public_url(&self, key: &str) -> String {
        match &self.public_url_base {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("https://pub-{}.r2.dev/{}", self.account_id, key),
        }
    }

    /// Verify bucket access without mutating anything.
    pub fn test_connection(&self) -> Result<(), StageError> {
        self.runtime
            .block_on(async {
                self.client
                    .head_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
            })
            .map(|_| ())
            .map_err(|e| StageError::Upload(format!("bucket access check failed: {e}")))
    }

    pub fn bucket_stats(&self) -> Result<BucketStats, StageError> {
        let objects = self.list_objects(LIST_PAGE_SIZE)?;
        Ok(BucketStats {
            objects: objects.len(),
            total_bytes: objects.iter().map(|(_, size)| size).sum(),
        })
    }

    fn list_objects(&self, max_keys: i32) -> Result<Vec<(String, i64)>, StageError> {
        let response = self
            .runtime
            .block_on(async {
                self.client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(format!("{}/", self.key_prefix.trim_matches('/')))
                    .max_keys(max_keys)
                    .send()
                    .await
            })
            .map_err(|e| StageError::Upload(format!("list failed: {e}")))?;

        Ok(response
            .contents()
            .iter()
            .filter_map(|obj| {
                obj.key()
                    .map(|key| (key.to_string(), obj.size().unwrap_or(0)))
            })
            .collect())
    }

    /// Delete one object by key. Used by the admin CLI; retention cleanup
    /// goes through [`ObjectStore::cleanup`].
    pub fn delete_object(&self, key: &str) -> Result<(), StageError> {
        self.runtime
            .block_on(async {
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
            })
            .map(|_| ())
            .map_err(|e| StageError::Upload(format!("delete {key} failed: {e}")))
    }
}

impl ObjectStore for S3ObjectStore {
    fn upload(&self, image_path: &Path) -> Result<UploadResult, StageError> {
        let meta = std::fs::metadata(image_path)
            .map_err(|_| StageError::MissingInput(image_path.to_path_buf()))?;
        if meta.len() > MAX_UPLOAD_BYTES {
            return Err(StageError::OversizedInput {
                actual: meta.len(),
                limit: MAX_UPLOAD_BYTES,
            });
        }
        let captured_at: DateTime<Utc> = meta
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        let bytes = std::fs::read(image_path)
            .map_err(|e| StageError::Upload(format!("read {}: {e}", image_path.display())))?;

        // Key is computed once, before any attempt, so retries are idempotent.
        let key = object_key(&self.key_prefix, captured_at, &bytes, &key_extension(image_path));
        let content_type = content_type_for(image_path);
        let original_name = image_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("capture")
            .to_string();

        self.retry.run(|attempt| {
            if attempt > 0 {
                log::warn!("retrying upload of {key} (attempt {})", attempt + 1);
            }
            let result = self.runtime.block_on(async {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .body(ByteStream::from(bytes.clone()))
                    .content_type(content_type)
                    .cache_control("max-age=86400")
                    .metadata("original-filename", &original_name)
                    .metadata("capture-time", captured_at.to_rfc3339())
                    .send()
                    .await
            });
            match result {
                Ok(_) => Attempt::Done(()),
                Err(e) => Attempt::Retry(StageError::Upload(format!("put {key} failed: {e}"))),
            }
        })?;

        Ok(UploadResult {
            public_url: self.public_url(&key),
            object_key: key,
            uploaded_at: Utc::now(),
        })
    }

    fn cleanup(&self, older_than_days: u32) -> Result<usize, StageError> {
        let cutoff = Utc::now().timestamp() - i64::from(older_than_days) * 24 * 3600;
        let mut removed = 0;
        for (key, _) in self.list_objects(LIST_PAGE_SIZE)? {
            let Some(ts) = key_timestamp(&key) else {
                continue;
            };
            if ts < cutoff {
                self.delete_object(&key)?;
                log::info!("removed expired object {key}");
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn list(&self, max: usize) -> Result<Vec<UploadResult>, StageError> {
        let objects = self.list_objects(max.min(LIST_PAGE_SIZE as usize) as i32)?;
        Ok(objects
            .into_iter()
            .map(|(key, _)| UploadResult {
                public_url: self.public_url(&key),
                uploaded_at: key_timestamp(&key)
                    .and_then(|ts| DateTime::from_timestamp(ts, 0))
                    .unwrap_or_else(Utc::now),
                object_key: key,
            })
            .collect())
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        _ => "image/jpeg",
    }
}
