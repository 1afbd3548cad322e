//! Copy the record tables from one database to another
//!
//! Files rows are copied first. Every backend assigns its own ids, so the
//! Musics rows are created without their link to Files and the links are
//! then rewritten with the ids the target gave the copied Files rows.
//! Nothing is deleted from the source, and running a migration twice
//! copies everything twice.

use crate::custody::Custody;
use crate::database::{ensure_complete, Database};
use crate::error::{CustodyError, Result};
use crate::types::{fields, Fields, Record, RecordId, FILES_TABLE, MUSICS_TABLE};
use futures::TryStreamExt;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, instrument};

/// Rows copied by one migration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    /// Files rows created in the target
    pub files: usize,
    /// Musics rows created in the target
    pub musics: usize,
}

/// Copy Files and Musics from `source` into `target`
///
/// # Errors
///
/// - [`CustodyError::RecordNotFound`] if a Musics row links to a Files id
///   that does not exist in the source; nothing of Musics is written then
/// - [`CustodyError::BatchIncomplete`] if the target created fewer rows
///   than it was sent
/// - any backend error, unchanged
#[instrument(skip_all, fields(source = source.name(), target = target.name()))]
pub async fn migrate(source: &dyn Database, target: &dyn Database) -> Result<MigrationSummary> {
    info!("Start migrating");

    let files = all_records(source, FILES_TABLE).await?;
    let copies = target
        .table(FILES_TABLE)
        .await?
        .batch_create(files.iter().map(|r| r.fields.clone()).collect())
        .await?;
    ensure_complete("migrate files", files.len(), copies.len())?;
    let id_map: HashMap<&str, RecordId> = files
        .iter()
        .map(|r| r.id.as_str())
        .zip(copies.into_iter().map(|r| r.id))
        .collect();
    info!("Copied {} Files row(s)", id_map.len());

    let musics = all_records(source, MUSICS_TABLE).await?;
    let mut rows: Vec<Fields> = Vec::with_capacity(musics.len());
    let mut links: Vec<Vec<RecordId>> = Vec::with_capacity(musics.len());
    for music in &musics {
        let mapped = music
            .links(fields::FILES)
            .iter()
            .map(|id| {
                id_map
                    .get(id.as_str())
                    .cloned()
                    .ok_or_else(|| CustodyError::RecordNotFound(id.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut row = music.fields.clone();
        row.remove(fields::FILES);
        rows.push(row);
        links.push(mapped);
    }

    let target_musics = target.table(MUSICS_TABLE).await?;
    let created = target_musics.batch_create(rows).await?;
    ensure_complete("migrate musics", musics.len(), created.len())?;
    let relinked: HashMap<RecordId, Vec<RecordId>> = created
        .iter()
        .map(|r| r.id.clone())
        .zip(links)
        .filter(|(_, ids)| !ids.is_empty())
        .collect();
    if !relinked.is_empty() {
        target_musics.batch_update_links(fields::FILES, relinked).await?;
    }
    info!("Copied {} Musics row(s)", created.len());

    Ok(MigrationSummary { files: files.len(), musics: created.len() })
}

async fn all_records(database: &dyn Database, table: &str) -> Result<Vec<Record>> {
    database.table(table).await?.get_all(None, &[]).await?.try_collect().await
}

impl Custody {
    /// Copy this context's Files and Musics tables into `target`
    pub async fn migrate(&self, target: &dyn Database) -> Result<MigrationSummary> {
        migrate(self.database().as_ref(), target).await
    }
}
