//! Blob storage abstraction
//!
//! Files are addressed by name. The [`Storage`] trait is the only view of
//! blob storage the pipelines ever see; [`ObjectStorage`] implements it on
//! top of the `object_store` crate for S3-compatible buckets, local
//! directories and process memory.
//!
//! Two policies are part of the contract rather than of any one backend:
//!
//! - [`Storage::file_exists`] answers `false` only for "not found"; every
//!   other failure propagates.
//! - [`Storage::list_files`] treats an empty listing as
//!   [`CustodyError::FileNotFound`](crate::error::CustodyError::FileNotFound), since a flat key space cannot tell an
//!   empty prefix from a missing one.

pub mod object;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;
use std::path::Path;
use url::Url;

pub use object::{ObjectStorage, S3Settings, TransferConfig};

/// Finite, single-pass stream of byte chunks
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// One failed key of a batch delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteError {
    /// Key that could not be deleted
    pub path: String,
    /// Backend error message
    pub message: String,
}

/// Name-addressed blob storage
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Storage name, as referenced from records and routing rules
    fn name(&self) -> &str;

    /// Whether an object exists
    async fn file_exists(&self, name: &str) -> Result<bool>;

    /// Upload a local file under `name`
    async fn upload_file(&self, local_path: &Path, name: &str) -> Result<()>;

    /// Download `name` into a local file
    async fn download_file(&self, name: &str, local_path: &Path) -> Result<()>;

    /// Stream the contents of an object
    async fn get_file(&self, name: &str) -> Result<ByteStream>;

    /// Time-limited direct-access URL for an object
    ///
    /// Fails with `CustodyError::FileNotFound` if the object is absent.
    async fn get_link(&self, name: &str) -> Result<Url>;

    /// Delete one object
    async fn delete_file(&self, name: &str) -> Result<()>;

    /// Delete several objects, reporting failures per key
    async fn delete_files(&self, names: &[String]) -> Result<Vec<DeleteError>>;

    /// Names of every object whose key starts with `prefix`
    async fn list_files(&self, prefix: &str) -> Result<Vec<String>>;
}
