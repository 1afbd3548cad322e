//! Error types for the custody library
//!
//! This module defines every error that can occur while ingesting, archiving
//! or verifying files. Domain errors (missing records, duplicate files,
//! failed verification) get their own variants; transport errors from the
//! backends are carried through unchanged so callers can decide whether they
//! are worth retrying.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the custody library
pub type Result<T> = std::result::Result<T, CustodyError>;

/// Main error type for all custody operations
#[derive(Debug, Error)]
pub enum CustodyError {
    /// I/O errors during local file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Object storage backend error, passed through unchanged
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),

    /// HTTP transport error, passed through unchanged
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Malformed input to a record write operation
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Referenced record id does not exist
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Missing local path, storage object or listing prefix
    #[error("No such file: '{0}'")]
    FileNotFound(String),

    /// Duplicate detected at ingest time
    #[error("File exists: '{0}'")]
    FileExists(String),

    /// A remote batch call reported fewer affected rows than were sent
    #[error("Batch {operation} incomplete: expected {expected}, backend reported {actual}")]
    BatchIncomplete {
        /// Operation that was being performed
        operation: String,
        /// Number of items sent in the chunk
        expected: usize,
        /// Number of items the backend reported as processed
        actual: usize,
    },

    /// The capture job did not finish before the overall timeout
    #[error("Archiving process timed out after {0:?}")]
    ArchiveTimedOut(std::time::Duration),

    /// The capture API answered with an error or an unexpected status
    #[error("Archive error: {0}")]
    Archive(String),

    /// One or more files in a verification run failed
    #[error("Verification failed for {} file(s): {}", failed.len(), failed.join(", "))]
    Verification {
        /// Names of every file that failed
        failed: Vec<String>,
    },

    /// Unknown hash algorithm name
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// No storage route matches the file
    #[error("File type is not supported: {path:?}")]
    UnsupportedFileType {
        /// Path to the rejected file
        path: PathBuf,
    },

    /// A storage name was referenced that the context does not know
    #[error("Unknown storage: {0}")]
    UnknownStorage(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The external metadata tool failed
    #[error("Metadata extraction failed: {0}")]
    MetadataExtraction(String),

    /// Remote table service returned something we could not interpret
    #[error("Table backend error: {0}")]
    Backend(String),
}

impl CustodyError {
    /// Create an invalid record error with a custom message
    pub fn invalid_record(msg: impl Into<String>) -> Self {
        CustodyError::InvalidRecord(msg.into())
    }

    /// Create an archive error with a custom message
    pub fn archive(msg: impl Into<String>) -> Self {
        CustodyError::Archive(msg.into())
    }

    /// Create a backend error with a custom message
    pub fn backend(msg: impl Into<String>) -> Self {
        CustodyError::Backend(msg.into())
    }

    /// Check if retrying the same call may succeed
    ///
    /// Only timeouts and transient transport failures qualify. Everything
    /// else needs a human to look at it first.
    pub fn is_retryable(&self) -> bool {
        match self {
            CustodyError::ArchiveTimedOut(_) => true,
            CustodyError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            _ => false,
        }
    }

    /// Check if this error means "the thing is not there"
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CustodyError::RecordNotFound(_)
                | CustodyError::FileNotFound(_)
                | CustodyError::ObjectStore(object_store::Error::NotFound { .. })
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            CustodyError::FileExists(name) => {
                format!("A file named '{}' is already in custody. Rename the file or remove the existing copy first.", name)
            }
            CustodyError::RecordNotFound(id) => {
                format!("Record '{}' not found. It may have been removed or the id is stale.", id)
            }
            CustodyError::ArchiveTimedOut(after) => {
                format!(
                    "Archiving did not finish within {}. The capture may still complete remotely; try again later.",
                    humantime::format_duration(*after)
                )
            }
            CustodyError::Verification { failed } => {
                format!("Verification failed for the following files: {}", failed.join(", "))
            }
            _ => self.to_string(),
        }
    }
}
