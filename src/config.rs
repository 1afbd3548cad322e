//! Process configuration
//!
//! ## Overview
//!
//! A [`CustodyConfig`] describes every collaborator a [`Custody`] context
//! needs: the record database, the named storages, the extension routing
//! table, the archive client and the scheduling knobs of verification and
//! metadata enrichment. It is read from a JSON file and then patched from
//! the environment, so secrets never have to live in the file.
//!
//! ## Examples
//!
//! ```json
//! {
//!   "database": { "kind": "seatable", "name": "Primary" },
//!   "storages": [
//!     { "name": "Audio Storage", "kind": "s3", "bucket": "audio" },
//!     { "name": "Backup Audio Storage", "kind": "local", "root": "/srv/backup" }
//!   ],
//!   "routes": { "extensions": { "flac": "Audio Storage", "mp3": "Audio Storage" } },
//!   "archive": { "poll_interval": "5s", "timeout": "15m" },
//!   "verification": { "shards": 28, "workers": 4 }
//! }
//! ```
//!
//! ## Environment
//!
//! | Variable | Overrides |
//! |---|---|
//! | `CUSTODY_SEATABLE_TOKEN` | SeaTable API token |
//! | `AIRTABLE_API_KEY` | Airtable API key |
//! | `AIRTABLE_BASE_ID` | Airtable base id |
//! | `CUSTODY_S3_ACCESS_KEY_ID` | access key of S3 storages that have none |
//! | `CUSTODY_S3_SECRET_ACCESS_KEY` | secret key of S3 storages that have none |
//! | `INTERNET_ARCHIVE_ACCESS_KEY` | archive access key |
//! | `INTERNET_ARCHIVE_SECRET_KEY` | archive secret key |

use crate::archive::{ArchiveConfig, WaybackClient};
use crate::custody::{Custody, CustodyBuilder};
use crate::database::{
    AirtableConfig, AirtableDatabase, Database, MemoryDatabase, SeaTableConfig, SeaTableDatabase,
};
use crate::error::{CustodyError, Result};
use crate::metadata::{ExifTool, MetadataConfig};
use crate::storage::{ObjectStorage, S3Settings, Storage, TransferConfig};
use crate::verification::VerificationConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "custody.json";

/// Complete process configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustodyConfig {
    /// Record database
    pub database: DatabaseConfig,
    /// Named storages
    pub storages: Vec<StorageConfig>,
    /// Extension routing for ingest
    pub routes: RouteConfig,
    /// Archive client
    pub archive: ArchiveConfig,
    /// Verification scheduling
    pub verification: VerificationConfig,
    /// Metadata enrichment
    pub metadata: MetadataConfig,
}

/// Which record database to use
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DatabaseConfig {
    /// In-process tables, lost on exit
    Memory {
        /// Database name
        #[serde(default = "default_database_name")]
        name: String,
    },
    /// A SeaTable base
    SeaTable {
        /// Database name
        #[serde(default = "default_database_name")]
        name: String,
        /// Connection settings
        #[serde(flatten)]
        connection: SeaTableConfig,
    },
    /// An Airtable base
    Airtable {
        /// Database name
        #[serde(default = "default_database_name")]
        name: String,
        /// Connection settings
        #[serde(flatten)]
        connection: AirtableConfig,
    },
}

fn default_database_name() -> String {
    "Primary".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig::Memory { name: default_database_name() }
    }
}

impl DatabaseConfig {
    /// Connect to the configured database
    ///
    /// # Errors
    ///
    /// Returns [`CustodyError::InvalidConfiguration`] if credentials are
    /// missing, or the error of the backend's handshake.
    pub async fn open(&self) -> Result<Arc<dyn Database>> {
        let database: Arc<dyn Database> = match self {
            DatabaseConfig::Memory { name } => Arc::new(MemoryDatabase::new(name)),
            DatabaseConfig::SeaTable { name, connection } => {
                Arc::new(SeaTableDatabase::connect(name, connection).await?)
            }
            DatabaseConfig::Airtable { name, connection } => Arc::new(AirtableDatabase::connect(name, connection)?),
        };
        Ok(database)
    }
}

/// One named storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Name referenced by records and routes
    pub name: String,
    /// Backend and its settings
    #[serde(flatten)]
    pub backend: StorageBackend,
    /// Multipart tuning
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageBackend {
    /// S3-compatible bucket
    S3(S3Settings),
    /// Local directory
    Local {
        /// Directory holding the objects
        root: PathBuf,
    },
    /// Process memory
    Memory {},
}

/// Maps file extensions to storage names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Lower-case extension (without the dot) to storage name
    pub extensions: BTreeMap<String, String>,
    /// Storage for files no extension rule matches
    pub default: Option<String>,
}

impl RouteConfig {
    /// Add an extension rule
    pub fn route(mut self, extension: &str, storage: &str) -> Self {
        self.extensions
            .insert(extension.trim_start_matches('.').to_ascii_lowercase(), storage.to_string());
        self
    }

    /// Storage name for a local path, if any rule applies
    pub fn storage_for(&self, path: &Path) -> Option<&str> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.extensions.get(&ext.to_ascii_lowercase()))
            .or(self.default.as_ref())
            .map(String::as_str)
    }

    /// Every storage name referenced by a rule
    pub fn storage_names(&self) -> impl Iterator<Item = &str> {
        self.extensions.values().chain(self.default.iter()).map(String::as_str)
    }
}

impl CustodyConfig {
    /// Read a configuration file
    ///
    /// # Errors
    ///
    /// - [`CustodyError::FileNotFound`] if `path` does not exist
    /// - [`CustodyError::Json`] if the file is not valid configuration
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CustodyError::FileNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let config = serde_json::from_str(&text)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        match &mut self.database {
            DatabaseConfig::SeaTable { connection, .. } => {
                if let Some(token) = lookup("CUSTODY_SEATABLE_TOKEN") {
                    connection.api_token = token;
                }
            }
            DatabaseConfig::Airtable { connection, .. } => {
                if let Some(key) = lookup("AIRTABLE_API_KEY") {
                    connection.api_key = key;
                }
                if let Some(base_id) = lookup("AIRTABLE_BASE_ID") {
                    connection.base_id = base_id;
                }
            }
            DatabaseConfig::Memory { .. } => {}
        }

        let key_id = lookup("CUSTODY_S3_ACCESS_KEY_ID");
        let secret = lookup("CUSTODY_S3_SECRET_ACCESS_KEY");
        for storage in &mut self.storages {
            if let StorageBackend::S3(settings) = &mut storage.backend {
                if settings.access_key_id.is_none() {
                    settings.access_key_id = key_id.clone();
                }
                if settings.secret_access_key.is_none() {
                    settings.secret_access_key = secret.clone();
                }
            }
        }

        if let Some(key) = lookup("INTERNET_ARCHIVE_ACCESS_KEY") {
            self.archive.access_key = key;
        }
        if let Some(secret) = lookup("INTERNET_ARCHIVE_SECRET_KEY") {
            self.archive.secret_key = secret;
        }
    }

    /// Open every backend and assemble a [`Custody`] context
    ///
    /// # Errors
    ///
    /// Returns the first error raised while connecting a backend, or
    /// [`CustodyError::UnknownStorage`] / [`CustodyError::InvalidConfiguration`]
    /// if the routing or scheduling settings do not add up.
    pub async fn connect(&self) -> Result<Custody> {
        let database = self.database.open().await?;

        let mut builder = CustodyBuilder::new()
            .database(database)
            .routes(self.routes.clone())
            .archive(Arc::new(WaybackClient::new(self.archive.clone())?))
            .metadata_extractor(Arc::new(ExifTool::new(&self.metadata.exiftool)))
            .metadata_config(self.metadata.clone())
            .verification(self.verification.clone());

        for storage in &self.storages {
            builder = builder.storage(open_storage(storage)?);
        }

        let custody = builder.build()?;
        info!("Custody context ready with {} storage(s)", self.storages.len());
        Ok(custody)
    }
}

fn open_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    let storage = match &config.backend {
        StorageBackend::S3(settings) => ObjectStorage::s3(&config.name, settings)?,
        StorageBackend::Local { root } => ObjectStorage::local(&config.name, root)?,
        StorageBackend::Memory {} => ObjectStorage::memory(&config.name),
    };
    Ok(Arc::new(storage.with_transfer_config(config.transfer)))
}
