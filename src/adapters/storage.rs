//! Remote object storage for log mirroring and result publication.
//!
//! Two backends:
//! - `gs://bucket/prefix`: Google Cloud Storage through the JSON upload API
//! - `file:///dir` or a plain path: a local (or network-mounted) directory

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Body;
use tokio::fs;

use super::ObjectStore;

/// Default Cloud Storage endpoint
pub const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Where remote artifacts go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteDestination {
    Gcs { bucket: String, prefix: String },
    Local { root: PathBuf },
}

impl FromStr for RemoteDestination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("remote destination is empty".to_string());
        }

        if let Some(rest) = s.strip_prefix("gs://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(format!("missing bucket name in '{}'", s));
            }
            return Ok(RemoteDestination::Gcs {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
            });
        }

        let path = s.strip_prefix("file://").unwrap_or(s);
        Ok(RemoteDestination::Local {
            root: PathBuf::from(path),
        })
    }
}

impl fmt::Display for RemoteDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteDestination::Gcs { bucket, prefix } if prefix.is_empty() => write!(f, "gs://{}", bucket),
            RemoteDestination::Gcs { bucket, prefix } => write!(f, "gs://{}/{}", bucket, prefix),
            RemoteDestination::Local { root } => write!(f, "file://{}", root.display()),
        }
    }
}

/// Settings needed to talk to Cloud Storage
#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
    /// API endpoint override (emulators, private endpoints)
    pub endpoint: Option<String>,

    /// OAuth bearer token
    pub access_token: Option<String>,
}

/// Open the object store for a destination
pub fn open_store(destination: &RemoteDestination, settings: &StoreSettings) -> Arc<dyn ObjectStore> {
    match destination {
        RemoteDestination::Gcs { bucket, prefix } => Arc::new(GcsStore::new(
            bucket.clone(),
            prefix.clone(),
            settings.endpoint.clone().unwrap_or_else(|| GCS_ENDPOINT.to_string()),
            settings.access_token.clone(),
        )),
        RemoteDestination::Local { root } => Arc::new(LocalStore::new(root.clone())),
    }
}

/// Reject keys that would escape the destination
fn validate_key(key: &str) -> Result<()> {
    let path = Path::new(key);
    if key.is_empty()
        || path.is_absolute()
        || path.components().any(|c| !matches!(c, Component::Normal(_)))
    {
        anyhow::bail!("Invalid object key '{}'", key);
    }
    Ok(())
}

/// Object store backed by a directory
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        let target = self.root.join(key);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        fs::write(&target, body)
            .await
            .with_context(|| format!("Failed to write object: {}", target.display()))?;

        Ok(())
    }

    async fn put_file(&self, key: &str, local: &Path) -> Result<()> {
        validate_key(key)?;
        let target = self.root.join(key);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        fs::copy(local, &target)
            .await
            .with_context(|| format!("Failed to copy {} to {}", local.display(), target.display()))?;

        Ok(())
    }
}

/// Object store backed by a Cloud Storage bucket
pub struct GcsStore {
    bucket: String,
    prefix: String,
    endpoint: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl GcsStore {
    pub fn new(bucket: String, prefix: String, endpoint: String, access_token: Option<String>) -> Self {
        Self {
            bucket,
            prefix,
            endpoint,
            access_token,
            client: reqwest::Client::new(),
        }
    }

    /// Full object name for a key
    fn object_name(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    /// Media upload URL for the bucket
    fn upload_url(&self) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o",
            self.endpoint.trim_end_matches('/'),
            self.bucket
        )
    }

    /// Single-request media upload of `length` bytes
    async fn upload(&self, key: &str, body: Body, length: u64) -> Result<()> {
        validate_key(key)?;
        let name = self.object_name(key);

        let mut request = self
            .client
            .post(self.upload_url())
            .query(&[("uploadType", "media"), ("name", name.as_str())])
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, length)
            .body(body);

        if let Some(ref token) = self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to upload gs://{}/{}", self.bucket, name))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Cloud Storage rejected gs://{}/{} with {}: {}",
                self.bucket,
                name,
                status,
                text.trim()
            );
        }

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn describe(&self) -> String {
        if self.prefix.is_empty() {
            format!("gs://{}", self.bucket)
        } else {
            format!("gs://{}/{}", self.bucket, self.prefix)
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let length = body.len() as u64;
        self.upload(key, Body::from(body), length).await
    }

    /// Streams the file from disk; results can run to gigabytes
    async fn put_file(&self, key: &str, local: &Path) -> Result<()> {
        let file = fs::File::open(local)
            .await
            .with_context(|| format!("Failed to open {}", local.display()))?;
        let length = file
            .metadata()
            .await
            .with_context(|| format!("Failed to stat {}", local.display()))?
            .len();

        self.upload(key, Body::from(file), length).await
    }
}
