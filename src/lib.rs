//! # Custody - durable custody of files
//!
//! Ingest a file once, then keep proving that every copy of it is intact.
//!
//! ## Overview
//!
//! Custody keeps a record of every file it has been handed and makes sure the
//! bytes survive:
//! - Files are hashed at ingest and uploaded to an object store chosen by
//!   their extension
//! - Each file gets an independent copy in a third-party web archive
//! - A daily job re-hashes one shard of the corpus from the primary store,
//!   the backup store and the archive, and reports every mismatch
//! - Embedded metadata is extracted in the background and kept alongside
//!   the record
//!
//! ## Architecture
//!
//! - **Records** ([`database`]): a small table abstraction with batch
//!   operations, filters, sorting and link fields, backed by memory, a
//!   SeaTable base or an Airtable base
//! - **Storage** ([`storage`]): name-addressed blobs on top of
//!   `object_store`, with streaming transfers and pre-signed links
//! - **Archive** ([`archive`]): the Wayback Machine's Save Page Now API
//! - **Pipelines** ([`custody`], [`verification`], [`metadata`]): the
//!   operations, all methods on one explicitly constructed [`Custody`]
//!   context
//! - **Migration** ([`migration`]): copy the tables into another database
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use custody::CustodyConfig;
//! use std::path::Path;
//!
//! # async fn example() -> custody::Result<()> {
//! let mut config = CustodyConfig::load(Path::new("custody.json"))?;
//! config.apply_env();
//! let custody = config.connect().await?;
//!
//! let record = custody.ingest(Path::new("recording.flac")).await?;
//! println!("Stored {} as {}", record.display_name(), record.id);
//!
//! custody.archive_pending().await?;
//! custody.daily_verify().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing with in-memory backends
//!
//! ```rust
//! use custody::{CustodyBuilder, MemoryDatabase, ObjectStorage};
//! use std::sync::Arc;
//!
//! let custody = CustodyBuilder::new()
//!     .database(Arc::new(MemoryDatabase::new("Primary")))
//!     .storage(Arc::new(ObjectStorage::memory("Files")))
//!     .storage(Arc::new(ObjectStorage::memory("Backup Files")))
//!     .default_storage("Files")
//!     .build()
//!     .unwrap();
//! assert!(custody.storage("Files").is_ok());
//! ```

pub mod archive;
pub mod config;
pub mod custody;
pub mod database;
pub mod error;
pub mod hash;
pub mod metadata;
pub mod migration;
pub mod storage;
pub mod types;
pub mod utils;
pub mod verification;

// Re-export main types for convenience
pub use archive::{Archive, ArchiveConfig, WaybackClient};
pub use config::{CustodyConfig, RouteConfig};
pub use custody::{Custody, CustodyBuilder};
pub use database::{
    AirtableConfig, AirtableDatabase, Database, MemoryDatabase, SeaTableConfig, SeaTableDatabase, Table,
};
pub use error::{CustodyError, Result};
pub use hash::{calculate_hash, HashAlgorithm};
pub use metadata::{ExifTool, MetadataConfig, MetadataExtractor, MetadataSummary};
pub use migration::MigrationSummary;
pub use storage::{ObjectStorage, Storage};
pub use types::{Fields, Filter, Record, RecordId, SortKey};
pub use verification::{FileCheck, ShardSchedule, VerificationConfig, VerificationSummary};
