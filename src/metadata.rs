//! Metadata enrichment
//!
//! Files are ingested with a `Metadata` placeholder. Enrichment later
//! downloads each pending file, runs an extractor over it and stores the
//! result as JSON text. Audio files also get a row in the Musics table that
//! links back to their Files row.

use crate::custody::{name_and_storage, Custody};
use crate::database::Table;
use crate::error::{CustodyError, Result};
use crate::types::{fields, Fields, Filter, Record, SortKey, METADATA_PLACEHOLDER, MUSICS_TABLE};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, error, info, instrument};

/// Metadata enrichment settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// ExifTool executable
    pub exiftool: PathBuf,
    /// Files processed per run unless the caller overrides it
    pub limit: usize,
    /// Files processed concurrently
    pub workers: usize,
    /// Extensions that get a Musics row
    pub audio_extensions: Vec<String>,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            exiftool: PathBuf::from("exiftool"),
            limit: 8,
            workers: 4,
            audio_extensions: vec!["flac".to_string(), "mp3".to_string(), "m4a".to_string()],
        }
    }
}

impl MetadataConfig {
    /// Whether a file name has one of the audio extensions
    pub fn is_audio(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.audio_extensions.iter().any(|a| a.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }
}

/// Extracts embedded metadata from a local file
#[async_trait]
pub trait MetadataExtractor: Send + Sync + std::fmt::Debug {
    /// Metadata of the file as a JSON object
    async fn extract(&self, path: &Path) -> Result<Value>;
}

/// [`MetadataExtractor`] backed by the `exiftool` command
#[derive(Debug, Clone)]
pub struct ExifTool {
    program: PathBuf,
}

impl ExifTool {
    /// Use the given executable
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
        }
    }
}

impl Default for ExifTool {
    fn default() -> Self {
        Self::new("exiftool")
    }
}

#[async_trait]
impl MetadataExtractor for ExifTool {
    async fn extract(&self, path: &Path) -> Result<Value> {
        let output = tokio::process::Command::new(&self.program)
            .arg("-j")
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                CustodyError::MetadataExtraction(format!("failed to run {}: {}", self.program.display(), e))
            })?;
        if !output.status.success() {
            return Err(CustodyError::MetadataExtraction(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        first_entry(serde_json::from_slice(&output.stdout)?)
    }
}

/// ExifTool prints one object per input file inside an array
fn first_entry(value: Value) -> Result<Value> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .next()
            .ok_or_else(|| CustodyError::MetadataExtraction("empty exiftool output".to_string())),
        other => Err(CustodyError::MetadataExtraction(format!(
            "expected a JSON array from exiftool, got {}",
            other
        ))),
    }
}

/// Musics row for an audio file's metadata
///
/// Missing tags are left out, except `Title` which falls back to the file
/// name.
pub fn music_fields(metadata: &Value, file_name: &str) -> Fields {
    let mut row = Fields::new();
    for tag in ["Title", "Artist", "Album"] {
        if let Some(value) = metadata.get(tag).filter(|v| !v.is_null()) {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            row.insert(tag.to_string(), Value::from(text));
        }
    }
    row.entry("Title")
        .or_insert_with(|| Value::from(file_name.to_string()));
    row
}

/// Result of one enrichment run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetadataSummary {
    /// Files whose metadata was stored
    pub processed: Vec<String>,
    /// Files that failed; their placeholder is left in place
    pub failed: Vec<String>,
}

impl Custody {
    /// Extract and store metadata for files still holding the placeholder
    ///
    /// Oldest files go first. At most `limit` files are processed, falling
    /// back to the configured limit. Failures are logged and counted but do
    /// not stop the run.
    #[instrument(skip(self))]
    pub async fn add_metadata(&self, limit: Option<usize>) -> Result<MetadataSummary> {
        let config = self.metadata_config();
        let limit = limit.unwrap_or(config.limit);

        let files = self.files().await?;
        let mut pending = Filter::new();
        pending.insert(fields::METADATA.to_string(), Value::from(METADATA_PLACEHOLDER));
        let records: Vec<Record> = files
            .get_all(Some(&pending), &[SortKey::asc(fields::CREATED)])
            .await?
            .take(limit)
            .try_collect()
            .await?;
        info!("Adding metadata to {} file(s)", records.len());

        let scratch = TempDir::new()?;
        let summary = Mutex::new(MetadataSummary::default());
        let (summary_ref, scratch_dir) = (&summary, scratch.path());
        futures::stream::iter(records.iter())
            .for_each_concurrent(config.workers, |record| async move {
                let name = record.display_name();
                info!("Start to process `{}`", name);
                match self.enrich(record, scratch_dir).await {
                    Ok(()) => {
                        info!("Finished processing file `{}`", name);
                        summary_ref.lock().processed.push(name);
                    }
                    Err(e) => {
                        error!("Failed to add metadata to file `{}`: {}", name, e);
                        summary_ref.lock().failed.push(name);
                    }
                }
            })
            .await;

        let mut summary = summary.into_inner();
        summary.processed.sort();
        summary.failed.sort();
        Ok(summary)
    }

    async fn enrich(&self, record: &Record, scratch_dir: &Path) -> Result<()> {
        let (name, storage_name) = name_and_storage(record)?;
        let storage = self.storage(storage_name)?;
        let local = scratch_dir.join(format!("{}-{}", record.id, name));

        storage.download_file(name, &local).await?;
        let extracted = self.extractor().extract(&local).await;
        if let Err(e) = tokio::fs::remove_file(&local).await {
            debug!("Could not remove {}: {}", local.display(), e);
        }
        let metadata = extracted?;

        if self.metadata_config().is_audio(name) {
            let musics = self.database().table(MUSICS_TABLE).await?;
            // A run that stopped before the Metadata update already linked a row
            match linked_music(musics.as_ref(), &record.id).await? {
                Some(music) => debug!("Reusing Musics row {} for `{}`", music.id, name),
                None => {
                    let music = musics.create(music_fields(&metadata, name)).await?;
                    musics.add_link(fields::FILES, &music.id, &record.id).await?;
                    debug!("Linked Musics row {} to `{}`", music.id, name);
                }
            }
        }

        let mut update = Fields::new();
        update.insert(fields::METADATA.to_string(), Value::from(serde_json::to_string(&metadata)?));
        self.files().await?.update(&record.id, update).await?;
        Ok(())
    }
}

/// Musics row already linked to Files record `file_id`
async fn linked_music(musics: &dyn Table, file_id: &str) -> Result<Option<Record>> {
    musics
        .get_all(None, &[])
        .await?
        .try_filter(|row| futures::future::ready(row.links(fields::FILES).iter().any(|id| id == file_id)))
        .try_next()
        .await
}
