//! Streaming content hashing
//!
//! ## Overview
//!
//! Every integrity check in this crate boils down to one primitive:
//! [`calculate_hash`] consumes a finite stream of byte chunks and feeds them
//! into an incremental digest. The same function hashes a local file at ingest
//! time and the three remote copies at verification time, so the digest of a
//! payload never depends on how it happened to be chunked.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use custody::hash::{calculate_hash, hash_bytes, HashAlgorithm};
//! use bytes::Bytes;
//! use futures::stream;
//!
//! # async fn example() -> custody::Result<()> {
//! let chunks = stream::iter(vec![
//!     Ok(Bytes::from_static(b"test ")),
//!     Ok(Bytes::from_static(b"content")),
//! ]);
//! let digest = calculate_hash(chunks, HashAlgorithm::Sha256).await?;
//! assert_eq!(digest, hash_bytes(b"test content", HashAlgorithm::Sha256));
//! # Ok(())
//! # }
//! ```

use crate::error::{CustodyError, Result};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio_util::io::ReaderStream;
use tracing::trace;

/// Read size used when streaming local files and HTTP bodies
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// SHA-224
    Sha224,
    /// SHA-256, used for the `SHA256` field of every record
    #[default]
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Lower-case algorithm name
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Start a fresh incremental hasher
    pub fn hasher(&self) -> StreamHasher {
        match self {
            HashAlgorithm::Sha224 => StreamHasher::Sha224(Sha224::new()),
            HashAlgorithm::Sha256 => StreamHasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => StreamHasher::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => StreamHasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha224" => Ok(HashAlgorithm::Sha224),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => Err(CustodyError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// Incremental hasher for one of the [`HashAlgorithm`]s
#[derive(Clone)]
pub enum StreamHasher {
    /// SHA-224 state, 56 hex characters when finished
    Sha224(Sha224),
    /// SHA-256 state, the digest recorded at ingest
    Sha256(Sha256),
    /// SHA-384 state
    Sha384(Sha384),
    /// SHA-512 state
    Sha512(Sha512),
}

impl StreamHasher {
    /// Feed one chunk
    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamHasher::Sha224(h) => h.update(data),
            StreamHasher::Sha256(h) => h.update(data),
            StreamHasher::Sha384(h) => h.update(data),
            StreamHasher::Sha512(h) => h.update(data),
        }
    }

    /// Consume the hasher and return the lower-case hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            StreamHasher::Sha224(h) => hex::encode(h.finalize()),
            StreamHasher::Sha256(h) => hex::encode(h.finalize()),
            StreamHasher::Sha384(h) => hex::encode(h.finalize()),
            StreamHasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hash a stream of byte chunks
///
/// Chunks are folded into the digest as they arrive, so memory use is bounded
/// by the chunk size of the producer rather than by the payload.
///
/// # Arguments
///
/// * `chunks` - Finite stream of byte chunks
/// * `algorithm` - Digest algorithm
///
/// # Returns
///
/// The lower-case hexadecimal digest.
///
/// # Errors
///
/// Returns the first error yielded by the stream, unchanged.
pub async fn calculate_hash<S>(chunks: S, algorithm: HashAlgorithm) -> Result<String>
where
    S: Stream<Item = Result<Bytes>>,
{
    let mut hasher = algorithm.hasher();
    let mut total = 0u64;
    futures::pin_mut!(chunks);
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        total += chunk.len() as u64;
        hasher.update(&chunk);
    }
    trace!("Hashed {} bytes with {}", total, algorithm);
    Ok(hasher.finalize_hex())
}

/// Hash data that is already in memory
pub fn hash_bytes(data: &[u8], algorithm: HashAlgorithm) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finalize_hex()
}

/// Hash a local file in [`CHUNK_SIZE`] reads
///
/// # Errors
///
/// - [`CustodyError::FileNotFound`] if `path` does not exist
/// - [`CustodyError::Io`] for any other read failure
pub async fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CustodyError::FileNotFound(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    calculate_hash(file_chunks(file), algorithm).await
}

/// Stream the contents of an open file in [`CHUNK_SIZE`] chunks
pub fn file_chunks(file: tokio::fs::File) -> impl Stream<Item = Result<Bytes>> {
    ReaderStream::with_capacity(file, CHUNK_SIZE).map(|chunk| chunk.map_err(CustodyError::from))
}
