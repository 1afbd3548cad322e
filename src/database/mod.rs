//! Record, table and database abstraction
//!
//! This module presents one capability surface over interchangeable record
//! stores. The pipelines in this crate depend only on the [`Table`] and
//! [`Database`] traits, never on a concrete backend:
//!
//! - [`memory`]: an in-process map, used in tests and for scratch runs
//! - [`seatable`]: a remote spreadsheet-like service reached over HTTP
//! - [`airtable`]: the same kind of service with small write batches
//!
//! ## Batches
//!
//! Every operation has a batch form. For remote backends a batch is chunked
//! to [`MAX_BATCH_SIZE`] items per round trip, and a chunk the backend only
//! partially applied is a hard failure ([`CustodyError::BatchIncomplete`]):
//! the batch stops at that chunk and the error is returned to the caller.
//!
//! ## Links
//!
//! Link fields hold lists of record ids in another table. Some backends only
//! offer a "replace the whole list" primitive, so [`Table::batch_add_links`]
//! reads the current list first and writes the union.

pub mod airtable;
pub mod memory;
pub mod seatable;

use crate::error::{CustodyError, Result};
use crate::types::{Fields, Filter, Record, RecordId, SortKey};
use async_trait::async_trait;
use futures::stream::{BoxStream, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;

pub use airtable::{AirtableConfig, AirtableDatabase, AirtableTable};
pub use memory::{MemoryDatabase, MemoryTable};
pub use seatable::{SeaTableConfig, SeaTableDatabase, SeaTableTable};

/// Largest number of rows sent to a remote backend in one request
pub const MAX_BATCH_SIZE: usize = 1000;

/// Lazy sequence of records
///
/// Single-pass. Remote backends page through results as the stream is
/// polled; call [`Table::get_all`] again to start over.
pub type RecordStream = BoxStream<'static, Result<Record>>;

/// A named collection of records within one database
#[async_trait]
pub trait Table: Send + Sync + std::fmt::Debug {
    /// Table name
    fn name(&self) -> &str;

    /// Create records, assigning fresh ids
    async fn batch_create(&self, fields_list: Vec<Fields>) -> Result<Vec<Record>>;

    /// Fetch records by id; any missing id fails the whole call
    async fn batch_get(&self, record_ids: &[RecordId]) -> Result<Vec<Record>>;

    /// Shallow-merge fields into existing records and return fresh copies
    async fn batch_update(&self, updates: Vec<(RecordId, Fields)>) -> Result<Vec<Record>>;

    /// Delete records and return their ids
    async fn batch_delete(&self, record_ids: &[RecordId]) -> Result<Vec<RecordId>>;

    /// Every record matching `filter`, ordered by `sort`
    async fn get_all(&self, filter: Option<&Filter>, sort: &[SortKey]) -> Result<RecordStream>;

    /// Current contents of a link field for each given record
    async fn get_linked_records(
        &self,
        field: &str,
        record_ids: &[RecordId],
    ) -> Result<HashMap<RecordId, Vec<RecordId>>>;

    /// Replace the contents of a link field for each given record
    async fn batch_update_links(
        &self,
        field: &str,
        links: HashMap<RecordId, Vec<RecordId>>,
    ) -> Result<()>;

    /// Create one record
    async fn create(&self, fields: Fields) -> Result<Record> {
        self.batch_create(vec![fields])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CustodyError::backend(format!("create on '{}' returned no record", self.name())))
    }

    /// Fetch one record
    async fn get(&self, record_id: &str) -> Result<Record> {
        self.batch_get(&[record_id.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CustodyError::RecordNotFound(record_id.to_string()))
    }

    /// Merge fields into one record and return the fresh copy
    async fn update(&self, record_id: &str, fields: Fields) -> Result<Record> {
        self.batch_update(vec![(record_id.to_string(), fields)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CustodyError::RecordNotFound(record_id.to_string()))
    }

    /// Delete one record
    async fn delete(&self, record_id: &str) -> Result<RecordId> {
        self.batch_delete(&[record_id.to_string()]).await?;
        Ok(record_id.to_string())
    }

    /// Collect every record matching `filter`
    async fn find(&self, filter: &Filter) -> Result<Vec<Record>> {
        self.get_all(Some(filter), &[]).await?.try_collect().await
    }

    /// Replace one record's link list
    async fn update_link(&self, field: &str, record_id: &str, other_ids: Vec<RecordId>) -> Result<()> {
        let mut links = HashMap::new();
        links.insert(record_id.to_string(), other_ids);
        self.batch_update_links(field, links).await
    }

    /// Add one link, keeping the existing ones
    async fn add_link(&self, field: &str, record_id: &str, other_id: &str) -> Result<()> {
        let mut links = HashMap::new();
        links.insert(record_id.to_string(), vec![other_id.to_string()]);
        self.batch_add_links(field, links).await
    }

    /// Add links, keeping the existing ones
    async fn batch_add_links(
        &self,
        field: &str,
        links: HashMap<RecordId, Vec<RecordId>>,
    ) -> Result<()> {
        let record_ids: Vec<RecordId> = links.keys().cloned().collect();
        let mut current = self.get_linked_records(field, &record_ids).await?;
        let merged = links
            .into_iter()
            .map(|(record_id, added)| {
                let existing = current.remove(&record_id).unwrap_or_default();
                (record_id, union_ids(existing, added))
            })
            .collect();
        self.batch_update_links(field, merged).await
    }
}

/// A named connection to one backend
#[async_trait]
pub trait Database: Send + Sync + std::fmt::Debug {
    /// Database name
    fn name(&self) -> &str;

    /// Handle to a table
    async fn table(&self, name: &str) -> Result<Arc<dyn Table>>;

    /// Release backend resources; safe to call more than once
    async fn close(&self) -> Result<()>;
}

/// Existing ids followed by new ones, without duplicates
pub fn union_ids(existing: Vec<RecordId>, added: Vec<RecordId>) -> Vec<RecordId> {
    let mut out = Vec::with_capacity(existing.len() + added.len());
    for id in existing.into_iter().chain(added) {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

/// Check a backend-reported count against what was sent
pub(crate) fn ensure_complete(operation: &str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(CustodyError::BatchIncomplete {
            operation: operation.to_string(),
            expected,
            actual,
        })
    }
}
