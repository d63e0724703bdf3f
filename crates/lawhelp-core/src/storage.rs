use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::config::Config;

/// Upload target for signature images and signed PDFs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `path`, overwriting any existing object, and
    /// return its public URL.
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    async fn delete(&self, path: &str) -> Result<()>;

    fn name(&self) -> &str;
}

/// Build the store selected by `STORAGE_BACKEND`, or `None` when it has no
/// credentials.
pub async fn from_config(config: &Config) -> Result<Option<Box<dyn ObjectStore>>> {
    match config.storage_backend.as_str() {
        "supabase" => {
            if !config.has_supabase_storage() {
                return Ok(None);
            }
            let store = SupabaseStore::new(
                &config.supabase_url,
                &config.supabase_key,
                &config.storage_bucket,
            )?;
            Ok(Some(Box::new(store)))
        }
        "s3" => {
            let store = S3Store::from_env(&config.storage_bucket, &config.s3_public_base_url).await;
            Ok(Some(Box::new(store)))
        }
        other => bail!("unknown storage backend {other:?}"),
    }
}

// ── Paths ─────────────────────────────────────────────────────────────────

/// Reduce a client-supplied filename to `[A-Za-z0-9._-]`.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Normalize an object key: no leading slash, no empty, `.` or `..`
/// segments, every segment sanitized.
pub fn sanitize_path(path: &str) -> String {
    path.split('/')
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .map(sanitize_filename)
        .collect::<Vec<_>>()
        .join("/")
}

pub fn signature_path(doc_id: i64, timestamp: i64, filename: &str) -> String {
    format!("signatures/{doc_id}_{timestamp}_{}", sanitize_filename(filename))
}

pub fn signed_pdf_path(doc_id: i64) -> String {
    format!("signed_pdfs/{doc_id}_signed.pdf")
}

// ── Supabase Storage ──────────────────────────────────────────────────────

pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    key: String,
    bucket: String,
}

impl SupabaseStore {
    pub fn new(base_url: &str, key: &str, bucket: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build storage HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            bucket: bucket.to_string(),
        })
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path)
    }

    pub fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, path
        )
    }
}

#[async_trait]
impl ObjectStore for SupabaseStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let path = sanitize_path(path);
        let size = bytes.len();
        let resp = self
            .client
            .post(self.object_url(&path))
            .bearer_auth(&self.key)
            .header("apikey", &self.key)
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .context("storage upload request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("storage upload of {path} failed: HTTP {status}: {body}");
        }
        info!(store = "supabase", path = %path, size, "object stored");
        Ok(self.public_url(&path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = sanitize_path(path);
        let resp = self
            .client
            .delete(self.object_url(&path))
            .bearer_auth(&self.key)
            .header("apikey", &self.key)
            .send()
            .await
            .context("storage delete request failed")?;
        let status = resp.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            bail!("storage delete of {path} failed: HTTP {status}");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "supabase"
    }
}

// ── S3 ────────────────────────────────────────────────────────────────────

pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    public_base_url: String,
}

impl S3Store {
    /// Credentials and region come from the standard AWS environment chain.
    pub async fn from_env(bucket: &str, public_base_url: &str) -> Self {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let public_base_url = if public_base_url.is_empty() {
            format!("https://{bucket}.s3.amazonaws.com")
        } else {
            public_base_url.trim_end_matches('/').to_string()
        };
        Self {
            client: aws_sdk_s3::Client::new(&sdk_config),
            bucket: bucket.to_string(),
            public_base_url,
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let key = sanitize_path(path);
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .body(aws_sdk_s3::primitives::ByteStream::from(bytes))
            .send()
            .await
            .with_context(|| format!("S3 put_object {key} failed"))?;
        info!(store = "s3", path = %key, size, "object stored");
        Ok(format!("{}/{}", self.public_base_url, key))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let key = sanitize_path(path);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("S3 delete_object {key} failed"))?;
        Ok(())
    }

    fn name(&self) -> &str {
        "s3"
    }
}
