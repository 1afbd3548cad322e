//! [`Storage`] over the `object_store` crate
//!
//! One adapter covers every backend `object_store` offers; the constructors
//! differ only in how the store is built and how direct links are produced:
//!
//! | Constructor | Store | Link |
//! |---|---|---|
//! | [`ObjectStorage::s3`] | `AmazonS3` | pre-signed `GET` URL |
//! | [`ObjectStorage::local`] | `LocalFileSystem` | `file://` URL |
//! | [`ObjectStorage::memory`] | `InMemory` | `memory:///` URL |
//!
//! Objects at or above [`TransferConfig::multipart_threshold`] are uploaded
//! with multipart writes and downloaded with concurrent ranged reads, both
//! bounded by [`TransferConfig::max_concurrency`].

use super::{ByteStream, DeleteError, Storage};
use crate::error::{CustodyError, Result};
use crate::hash::file_chunks;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{ClientOptions, ObjectStore, WriteMultipart};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

const MIB: usize = 1024 * 1024;

/// Default lifetime of links handed out by [`Storage::get_link`]
pub const DEFAULT_LINK_LIFETIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Multipart transfer tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Objects of at least this many bytes use multipart transfer
    pub multipart_threshold: usize,
    /// Part size for multipart uploads and ranged downloads
    pub multipart_chunksize: usize,
    /// Parts in flight at once
    pub max_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: 8 * MIB,
            multipart_chunksize: 8 * MIB,
            max_concurrency: 10,
        }
    }
}

/// Connection settings for an S3-compatible bucket
#[derive(Clone, Serialize, Deserialize)]
pub struct S3Settings {
    /// Bucket name
    pub bucket: String,
    /// Region, `us-east-1` if unset
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Access key id; falls back to the usual AWS environment variables
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// Secret access key
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Allow plain-HTTP endpoints (local test services)
    #[serde(default)]
    pub allow_http: bool,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id.as_ref().map(|_| "<redacted>"))
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("allow_http", &self.allow_http)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug)]
enum LinkStyle {
    Presigned(Arc<dyn Signer>),
    File(PathBuf),
    Memory,
}

/// Named storage backed by an `object_store` implementation
#[derive(Debug)]
pub struct ObjectStorage {
    name: String,
    store: Arc<dyn ObjectStore>,
    links: LinkStyle,
    transfer: TransferConfig,
    link_lifetime: Duration,
}

impl ObjectStorage {
    /// Storage over an S3-compatible bucket
    ///
    /// # Errors
    ///
    /// Returns [`CustodyError::ObjectStore`] if the client cannot be built
    /// from the given settings.
    pub fn s3(name: impl Into<String>, settings: &S3Settings) -> Result<Self> {
        let client_options =
            ClientOptions::new().with_timeout(Duration::from_secs(settings.request_timeout_secs));

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region)
            .with_allow_http(settings.allow_http)
            .with_client_options(client_options);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(key) = &settings.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &settings.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }

        let s3 = Arc::new(builder.build()?);
        debug!("Built S3 storage for bucket {}", settings.bucket);
        Ok(Self::with_store(name, s3.clone(), LinkStyle::Presigned(s3)))
    }

    /// Storage over a local directory, created if missing
    pub fn local(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = root.as_ref().canonicalize()?;
        let store = LocalFileSystem::new_with_prefix(&root)?;
        Ok(Self::with_store(name, Arc::new(store), LinkStyle::File(root)))
    }

    /// Storage held in process memory
    pub fn memory(name: impl Into<String>) -> Self {
        Self::with_store(name, Arc::new(InMemory::new()), LinkStyle::Memory)
    }

    fn with_store(name: impl Into<String>, store: Arc<dyn ObjectStore>, links: LinkStyle) -> Self {
        Self {
            name: name.into(),
            store,
            links,
            transfer: TransferConfig::default(),
            link_lifetime: DEFAULT_LINK_LIFETIME,
        }
    }

    /// Replace the transfer tuning
    pub fn with_transfer_config(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    /// Replace the lifetime of generated links
    pub fn with_link_lifetime(mut self, lifetime: Duration) -> Self {
        self.link_lifetime = lifetime;
        self
    }

    /// Current transfer tuning
    pub fn transfer_config(&self) -> &TransferConfig {
        &self.transfer
    }

    /// Store an in-memory payload under `name`
    pub async fn put_bytes(&self, name: &str, data: impl Into<Bytes>) -> Result<()> {
        let location = object_path(name)?;
        let data: Bytes = data.into();
        self.store.put(&location, data.into()).await?;
        Ok(())
    }

    /// Size of an object in bytes
    pub async fn file_size(&self, name: &str) -> Result<u64> {
        let meta = self.store.head(&object_path(name)?).await?;
        Ok(meta.size)
    }

    async fn upload_multipart(&self, file: tokio::fs::File, location: &ObjectPath) -> Result<()> {
        let upload = self.store.put_multipart(location).await?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, self.transfer.multipart_chunksize);
        let max_concurrency = self.transfer.max_concurrency.max(1);

        let copied: Result<()> = async {
            let chunks = file_chunks(file);
            futures::pin_mut!(chunks);
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk?;
                writer.wait_for_capacity(max_concurrency).await?;
                writer.write(&chunk);
            }
            Ok(())
        }
        .await;

        match copied {
            Ok(()) => {
                writer.finish().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    warn!("Failed to abort multipart upload of {}: {}", location, abort_err);
                }
                Err(e)
            }
        }
    }

    async fn download_ranged(&self, location: &ObjectPath, size: u64, out: &mut tokio::fs::File) -> Result<()> {
        let part = self.transfer.multipart_chunksize.max(1) as u64;
        let mut parts = stream::iter(byte_ranges(size, part))
            .map(|range| {
                let store = self.store.clone();
                let location = location.clone();
                async move { store.get_range(&location, range).await }
            })
            .buffered(self.transfer.max_concurrency.max(1));

        while let Some(chunk) = parts.next().await {
            out.write_all(&chunk?).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for ObjectStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn file_exists(&self, name: &str) -> Result<bool> {
        match self.store.head(&object_path(name)?).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_file(&self, local_path: &Path, name: &str) -> Result<()> {
        let location = object_path(name)?;
        let size = match tokio::fs::metadata(local_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Err(CustodyError::FileNotFound(local_path.display().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CustodyError::FileNotFound(local_path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if size >= self.transfer.multipart_threshold as u64 {
            debug!("Uploading {} ({} bytes) to {} in parts", name, size, self.name);
            let file = tokio::fs::File::open(local_path).await?;
            self.upload_multipart(file, &location).await
        } else {
            debug!("Uploading {} ({} bytes) to {}", name, size, self.name);
            let data = tokio::fs::read(local_path).await?;
            self.store.put(&location, Bytes::from(data).into()).await?;
            Ok(())
        }
    }

    async fn download_file(&self, name: &str, local_path: &Path) -> Result<()> {
        let location = object_path(name)?;
        let size = match self.store.head(&location).await {
            Ok(meta) => meta.size,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(CustodyError::FileNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(local_path).await?;

        if size >= self.transfer.multipart_threshold as u64 {
            debug!("Downloading {} ({} bytes) from {} in parts", name, size, self.name);
            self.download_ranged(&location, size, &mut out).await?;
        } else {
            let mut chunks = self.store.get(&location).await?.into_stream();
            while let Some(chunk) = chunks.next().await {
                out.write_all(&chunk?).await?;
            }
        }
        out.flush().await?;
        Ok(())
    }

    async fn get_file(&self, name: &str) -> Result<ByteStream> {
        let result = self.store.get(&object_path(name)?).await?;
        Ok(result.into_stream().map_err(CustodyError::from).boxed())
    }

    async fn get_link(&self, name: &str) -> Result<Url> {
        let location = object_path(name)?;
        if !self.file_exists(name).await? {
            return Err(CustodyError::FileNotFound(name.to_string()));
        }
        match &self.links {
            LinkStyle::Presigned(signer) => Ok(signer
                .signed_url(reqwest::Method::GET, &location, self.link_lifetime)
                .await?),
            LinkStyle::File(root) => Url::from_file_path(root.join(location.as_ref())).map_err(|_| {
                CustodyError::InvalidConfiguration(format!("cannot build a file URL for {}", name))
            }),
            LinkStyle::Memory => {
                let link = format!("memory:///{}/{}", encode_segment(&self.name), encode_path(location.as_ref()));
                Url::parse(&link).map_err(|e| {
                    CustodyError::InvalidConfiguration(format!("cannot build a link for {}: {}", name, e))
                })
            }
        }
    }

    async fn delete_file(&self, name: &str) -> Result<()> {
        self.store.delete(&object_path(name)?).await?;
        Ok(())
    }

    async fn delete_files(&self, names: &[String]) -> Result<Vec<DeleteError>> {
        let outcomes: Vec<(String, Result<()>)> = stream::iter(names.iter().cloned())
            .map(|name| async move {
                let outcome = self.delete_file(&name).await;
                (name, outcome)
            })
            .buffer_unordered(self.transfer.max_concurrency.max(1))
            .collect()
            .await;

        let mut errors: Vec<DeleteError> = outcomes
            .into_iter()
            .filter_map(|(path, outcome)| {
                outcome.err().map(|e| DeleteError { path, message: e.to_string() })
            })
            .collect();
        errors.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(errors)
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        // object_store lists by path segment, so list the enclosing
        // directory and filter on the raw string prefix.
        let directory = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let base = if directory.is_empty() { None } else { Some(object_path(directory)?) };

        let mut listing = self.store.list(base.as_ref());
        let mut names = Vec::new();
        while let Some(meta) = listing.next().await {
            let key = meta?.location.to_string();
            if key.starts_with(prefix) {
                names.push(key);
            }
        }

        if names.is_empty() {
            return Err(CustodyError::FileNotFound(prefix.to_string()));
        }
        names.sort();
        Ok(names)
    }
}

fn object_path(name: &str) -> Result<ObjectPath> {
    Ok(ObjectPath::parse(name).map_err(object_store::Error::from)?)
}

/// Split `size` bytes into consecutive ranges of at most `part` bytes
pub(crate) fn byte_ranges(size: u64, part: u64) -> Vec<Range<u64>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < size {
        let end = (start + part).min(size);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn encode_path(path: &str) -> String {
    path.split('/').map(encode_segment).collect::<Vec<_>>().join("/")
}
