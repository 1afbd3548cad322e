//! The custody context and its pipelines
//!
//! ## Overview
//!
//! [`Custody`] holds every collaborator the pipelines need, constructed once
//! at process start and passed around by reference. Nothing in this crate
//! reads global state; tests swap any collaborator for a fake through
//! [`CustodyBuilder`].
//!
//! - **Ingest** ([`Custody::ingest`]): hash a local file, reject duplicates,
//!   upload it, record it
//! - **Archive** ([`Custody::archive`], [`Custody::archive_pending`]): obtain
//!   an independent third-party copy and remember its URL
//! - **Verify** (see [`crate::verification`]): re-hash every copy
//! - **Enrich** (see [`crate::metadata`]): extract embedded metadata
//! - **Export** ([`Custody::export_table`]): dump a table to JSON
//!
//! ## Examples
//!
//! ```rust,no_run
//! use custody::{CustodyBuilder, ObjectStorage};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> custody::Result<()> {
//! let custody = CustodyBuilder::new()
//!     .storage(Arc::new(ObjectStorage::memory("Audio Storage")))
//!     .storage(Arc::new(ObjectStorage::memory("Backup Audio Storage")))
//!     .route("flac", "Audio Storage")
//!     .build()?;
//!
//! let record = custody.ingest(Path::new("song.flac")).await?;
//! let archive_url = custody.archive(&record.id).await?;
//! assert!(custody.verify(&record.id).await?);
//! # Ok(())
//! # }
//! ```

use crate::archive::{Archive, ArchiveConfig, WaybackClient};
use crate::config::RouteConfig;
use crate::database::{Database, MemoryDatabase, Table};
use crate::error::{CustodyError, Result};
use crate::hash::{hash_file, HashAlgorithm};
use crate::metadata::{ExifTool, MetadataConfig, MetadataExtractor};
use crate::storage::Storage;
use crate::types::{fields, Fields, Filter, Record, ARCHIVE_PLACEHOLDER, FILES_TABLE, METADATA_PLACEHOLDER};
use crate::utils::{atomic_write, format_bytes, format_elapsed};
use crate::verification::VerificationConfig;
use futures::TryStreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// Name of the storage holding the redundant copy of storage `name`
pub fn backup_storage_name(name: &str) -> String {
    format!("Backup {}", name)
}

/// Dependency-injected context for every pipeline
#[derive(Debug)]
pub struct Custody {
    database: Arc<dyn Database>,
    storages: HashMap<String, Arc<dyn Storage>>,
    routes: RouteConfig,
    archive: Arc<dyn Archive>,
    extractor: Arc<dyn MetadataExtractor>,
    verification: VerificationConfig,
    metadata: MetadataConfig,
}

impl Custody {
    /// Record database
    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    /// Handle to the Files table
    pub async fn files(&self) -> Result<Arc<dyn Table>> {
        self.database.table(FILES_TABLE).await
    }

    /// Storage by name
    ///
    /// # Errors
    ///
    /// Returns [`CustodyError::UnknownStorage`] if no storage has that name.
    pub fn storage(&self, name: &str) -> Result<Arc<dyn Storage>> {
        self.storages
            .get(name)
            .cloned()
            .ok_or_else(|| CustodyError::UnknownStorage(name.to_string()))
    }

    /// Archive client
    pub fn archive_client(&self) -> &Arc<dyn Archive> {
        &self.archive
    }

    pub(crate) fn extractor(&self) -> &Arc<dyn MetadataExtractor> {
        &self.extractor
    }

    /// Verification settings
    pub fn verification_config(&self) -> &VerificationConfig {
        &self.verification
    }

    /// Metadata enrichment settings
    pub fn metadata_config(&self) -> &MetadataConfig {
        &self.metadata
    }

    /// Take custody of a local file
    ///
    /// The file is hashed, checked against both the Files table and the
    /// target storage, uploaded, and only then recorded. A crash between the
    /// upload and the record leaves an orphan blob, which makes the next
    /// attempt for the same name fail with [`CustodyError::FileExists`].
    ///
    /// # Arguments
    ///
    /// * `path` - Local file to ingest; its base name becomes the storage key
    ///
    /// # Returns
    ///
    /// The created Files record.
    ///
    /// # Errors
    ///
    /// - [`CustodyError::FileNotFound`] if `path` is not a regular file
    /// - [`CustodyError::UnsupportedFileType`] if no route matches
    /// - [`CustodyError::FileExists`] if the name is already recorded or stored
    /// - any storage or database error, unchanged
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn ingest(&self, path: &Path) -> Result<Record> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(CustodyError::FileNotFound(path.display().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CustodyError::FileNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CustodyError::invalid_record(format!("{} has no usable file name", path.display())))?
            .to_string();

        let storage_name = self
            .routes
            .storage_for(path)
            .ok_or_else(|| CustodyError::UnsupportedFileType { path: path.to_path_buf() })?;
        let storage = self.storage(storage_name)?;

        let size = metadata.len();
        let sha256 = hash_file(path, HashAlgorithm::Sha256).await?;
        debug!("Hashed {} ({}): {}", name, format_bytes(size), sha256);

        let files = self.files().await?;
        let mut by_name = Filter::new();
        by_name.insert(fields::NAME.to_string(), Value::from(name.clone()));
        if !files.find(&by_name).await?.is_empty() || storage.file_exists(&name).await? {
            return Err(CustodyError::FileExists(name));
        }

        storage.upload_file(path, &name).await?;

        let mut record = Fields::new();
        record.insert(fields::NAME.to_string(), Value::from(name.clone()));
        record.insert(fields::SIZE.to_string(), Value::from(size));
        record.insert(fields::SHA256.to_string(), Value::from(sha256));
        record.insert(fields::STORAGE.to_string(), Value::from(storage_name));
        record.insert(fields::INTERNET_ARCHIVE.to_string(), Value::from(ARCHIVE_PLACEHOLDER));
        record.insert(fields::METADATA.to_string(), Value::from(METADATA_PLACEHOLDER));
        let created = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        record.insert(fields::CREATED.to_string(), Value::from(created));
        let record = files.create(record).await?;

        info!("Ingested `{}` ({}) into {}", name, format_bytes(size), storage_name);
        Ok(record)
    }

    /// Archive one file and store the permanent URL in its record
    ///
    /// # Errors
    ///
    /// - [`CustodyError::RecordNotFound`] if the record does not exist
    /// - [`CustodyError::ArchiveTimedOut`] / [`CustodyError::Archive`] from
    ///   the archive client
    #[instrument(skip(self))]
    pub async fn archive(&self, record_id: &str) -> Result<String> {
        let files = self.files().await?;
        let record = files.get(record_id).await?;
        self.archive_record(files.as_ref(), &record).await
    }

    pub(crate) async fn archive_record(&self, files: &dyn Table, record: &Record) -> Result<String> {
        let (name, storage_name) = name_and_storage(record)?;
        let storage = self.storage(storage_name)?;
        let link = storage.get_link(name).await?;
        let archive_url = self.archive.capture(&link).await?;

        let mut update = Fields::new();
        update.insert(fields::INTERNET_ARCHIVE.to_string(), Value::from(archive_url.clone()));
        files.update(&record.id, update).await?;
        info!("Archived `{}` at {}", name, archive_url);
        Ok(archive_url)
    }

    /// Archive every file whose archive field still holds the placeholder
    ///
    /// Files are processed one after another; the first failure stops the
    /// run and is returned.
    #[instrument(skip(self))]
    pub async fn archive_pending(&self) -> Result<Vec<String>> {
        let files = self.files().await?;
        let mut pending = Filter::new();
        pending.insert(fields::INTERNET_ARCHIVE.to_string(), Value::from(ARCHIVE_PLACEHOLDER));
        let records = files.find(&pending).await?;
        info!("{} file(s) waiting for an archive copy", records.len());

        let mut archived = Vec::with_capacity(records.len());
        for record in &records {
            let started = Instant::now();
            let name = record.display_name();
            info!("Start to archive file `{}`", name);
            archived.push(self.archive_record(files.as_ref(), record).await?);
            info!("Finish file `{}` in {}", name, format_elapsed(started.elapsed()));
        }
        Ok(archived)
    }

    /// Write every record of a table to `<dir>/<table>.json`
    ///
    /// # Returns
    ///
    /// The path of the written file.
    pub async fn export_table(&self, table: &str, dir: &Path) -> Result<PathBuf> {
        let handle = self.database.table(table).await?;
        let records: Vec<Record> = handle.get_all(None, &[]).await?.try_collect().await?;
        let json = serde_json::to_vec_pretty(&records)?;

        let path = dir.join(format!("{}.json", table));
        atomic_write(&path, &json)?;
        info!("Exported {} record(s) of {} to {}", records.len(), table, path.display());
        Ok(path)
    }
}

/// `Name` and `Storage` of a Files record
pub(crate) fn name_and_storage(record: &Record) -> Result<(&str, &str)> {
    let name = record
        .text(fields::NAME)
        .ok_or_else(|| CustodyError::invalid_record(format!("record {} has no {}", record.id, fields::NAME)))?;
    let storage = record
        .text(fields::STORAGE)
        .ok_or_else(|| CustodyError::invalid_record(format!("record {} has no {}", record.id, fields::STORAGE)))?;
    Ok((name, storage))
}

/// Builder for [`Custody`]
///
/// # Default Values
///
/// - `database`: an empty [`MemoryDatabase`] named `Primary`
/// - `archive`: a [`WaybackClient`] with default settings
/// - `metadata_extractor`: [`ExifTool`] from `PATH`
/// - no storages and no routes
#[derive(Debug, Default)]
pub struct CustodyBuilder {
    database: Option<Arc<dyn Database>>,
    storages: Vec<Arc<dyn Storage>>,
    routes: RouteConfig,
    archive: Option<Arc<dyn Archive>>,
    extractor: Option<Arc<dyn MetadataExtractor>>,
    verification: VerificationConfig,
    metadata: MetadataConfig,
}

impl CustodyBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record database
    pub fn database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    /// Register a storage under its own name
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storages.push(storage);
        self
    }

    /// Replace the routing table
    pub fn routes(mut self, routes: RouteConfig) -> Self {
        self.routes = routes;
        self
    }

    /// Route files with `extension` to `storage`
    pub fn route(mut self, extension: &str, storage: &str) -> Self {
        self.routes = self.routes.route(extension, storage);
        self
    }

    /// Route files no extension rule matches to `storage`
    pub fn default_storage(mut self, storage: &str) -> Self {
        self.routes.default = Some(storage.to_string());
        self
    }

    /// Set the archive client
    pub fn archive(mut self, archive: Arc<dyn Archive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Set the metadata extractor
    pub fn metadata_extractor(mut self, extractor: Arc<dyn MetadataExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Replace the metadata enrichment settings
    pub fn metadata_config(mut self, metadata: MetadataConfig) -> Self {
        self.metadata = metadata;
        self
    }

    /// Replace the verification settings
    pub fn verification(mut self, verification: VerificationConfig) -> Self {
        self.verification = verification;
        self
    }

    /// Number of shards in one verification cycle
    pub fn shards(mut self, shards: usize) -> Self {
        self.verification.shards = shards;
        self
    }

    /// Files verified concurrently
    pub fn workers(mut self, workers: usize) -> Self {
        self.verification.workers = workers;
        self
    }

    /// Archive files that have no archive copy yet before verifying them
    pub fn archive_missing(mut self, archive_missing: bool) -> Self {
        self.verification.archive_missing = archive_missing;
        self
    }

    /// Build the context
    ///
    /// # Errors
    ///
    /// - [`CustodyError::InvalidConfiguration`] for duplicate storage names or
    ///   zero shards or workers
    /// - [`CustodyError::UnknownStorage`] if a route names a missing storage
    pub fn build(self) -> Result<Custody> {
        let mut storages = HashMap::new();
        for storage in self.storages {
            let name = storage.name().to_string();
            if storages.insert(name.clone(), storage).is_some() {
                return Err(CustodyError::InvalidConfiguration(format!("storage '{}' registered twice", name)));
            }
        }
        if let Some(missing) = self.routes.storage_names().find(|name| !storages.contains_key(*name)) {
            return Err(CustodyError::UnknownStorage(missing.to_string()));
        }
        if self.verification.shards == 0 || self.verification.workers == 0 {
            return Err(CustodyError::InvalidConfiguration(
                "verification needs at least one shard and one worker".to_string(),
            ));
        }
        if self.metadata.workers == 0 {
            return Err(CustodyError::InvalidConfiguration("metadata needs at least one worker".to_string()));
        }

        let archive = match self.archive {
            Some(archive) => archive,
            None => Arc::new(WaybackClient::new(ArchiveConfig::default())?),
        };
        let extractor = match self.extractor {
            Some(extractor) => extractor,
            None => Arc::new(ExifTool::new(&self.metadata.exiftool)),
        };

        Ok(Custody {
            database: self.database.unwrap_or_else(|| Arc::new(MemoryDatabase::new("Primary"))),
            storages,
            routes: self.routes,
            archive,
            extractor,
            verification: self.verification,
            metadata: self.metadata,
        })
    }
}
