//! In-memory table backend
//!
//! Records live in a map guarded by a `parking_lot::RwLock`. Ids are random
//! UUIDs. `get_all` snapshots the matching rows, so the returned stream can be
//! re-created any number of times and always sees a consistent view.

use super::{Database, RecordStream, Table};
use crate::error::{CustodyError, Result};
use crate::types::{
    matches_filter, sort_records, validate_fields, Fields, Filter, Record, RecordId, SortKey,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct Rows {
    /// Monotonic insertion counter, used to keep `get_all` deterministic
    next_seq: u64,
    rows: HashMap<RecordId, (u64, Fields)>,
}

/// A table held entirely in memory
#[derive(Debug)]
pub struct MemoryTable {
    name: String,
    inner: RwLock<Rows>,
}

impl MemoryTable {
    /// Create an empty table
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(Rows::default()),
        }
    }

    /// Number of records in the table
    pub fn len(&self) -> usize {
        self.inner.read().rows.len()
    }

    /// Whether the table has no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Table for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn batch_create(&self, fields_list: Vec<Fields>) -> Result<Vec<Record>> {
        for fields in &fields_list {
            validate_fields(fields)?;
        }
        let mut inner = self.inner.write();
        let mut created = Vec::with_capacity(fields_list.len());
        for fields in fields_list {
            let id = uuid::Uuid::new_v4().to_string();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.rows.insert(id.clone(), (seq, fields.clone()));
            created.push(Record::new(id, fields));
        }
        debug!("Created {} record(s) in '{}'", created.len(), self.name);
        Ok(created)
    }

    async fn batch_get(&self, record_ids: &[RecordId]) -> Result<Vec<Record>> {
        let inner = self.inner.read();
        record_ids
            .iter()
            .map(|id| {
                inner
                    .rows
                    .get(id)
                    .map(|(_, fields)| Record::new(id.clone(), fields.clone()))
                    .ok_or_else(|| CustodyError::RecordNotFound(id.clone()))
            })
            .collect()
    }

    async fn batch_update(&self, updates: Vec<(RecordId, Fields)>) -> Result<Vec<Record>> {
        let mut inner = self.inner.write();
        // All-or-nothing: check every id before touching anything.
        for (id, fields) in &updates {
            validate_fields(fields)?;
            if !inner.rows.contains_key(id) {
                return Err(CustodyError::RecordNotFound(id.clone()));
            }
        }
        let mut updated = Vec::with_capacity(updates.len());
        for (id, fields) in updates {
            if let Some((_, existing)) = inner.rows.get_mut(&id) {
                for (key, value) in fields {
                    existing.insert(key, value);
                }
                updated.push(Record::new(id, existing.clone()));
            }
        }
        Ok(updated)
    }

    async fn batch_delete(&self, record_ids: &[RecordId]) -> Result<Vec<RecordId>> {
        let mut inner = self.inner.write();
        if let Some(missing) = record_ids.iter().find(|id| !inner.rows.contains_key(*id)) {
            return Err(CustodyError::RecordNotFound(missing.clone()));
        }
        for id in record_ids {
            inner.rows.remove(id);
        }
        Ok(record_ids.to_vec())
    }

    async fn get_all(&self, filter: Option<&Filter>, sort: &[SortKey]) -> Result<RecordStream> {
        let mut matching: Vec<(u64, Record)> = {
            let inner = self.inner.read();
            inner
                .rows
                .iter()
                .map(|(id, (seq, fields))| (*seq, Record::new(id.clone(), fields.clone())))
                .filter(|(_, record)| filter.map_or(true, |f| matches_filter(record, f)))
                .collect()
        };
        matching.sort_by_key(|(seq, _)| *seq);
        let mut records: Vec<Record> = matching.into_iter().map(|(_, r)| r).collect();
        sort_records(&mut records, sort);
        Ok(stream::iter(records.into_iter().map(Ok)).boxed())
    }

    async fn get_linked_records(
        &self,
        field: &str,
        record_ids: &[RecordId],
    ) -> Result<HashMap<RecordId, Vec<RecordId>>> {
        let records = self.batch_get(record_ids).await?;
        Ok(records
            .into_iter()
            .map(|record| {
                let links = record.links(field);
                (record.id, links)
            })
            .collect())
    }

    async fn batch_update_links(
        &self,
        field: &str,
        links: HashMap<RecordId, Vec<RecordId>>,
    ) -> Result<()> {
        let updates = links
            .into_iter()
            .map(|(id, targets)| {
                let mut fields = Fields::new();
                fields.insert(
                    field.to_string(),
                    Value::Array(targets.into_iter().map(Value::String).collect()),
                );
                (id, fields)
            })
            .collect();
        self.batch_update(updates).await.map(|_| ())
    }
}

/// A database whose tables live in memory
#[derive(Debug)]
pub struct MemoryDatabase {
    name: String,
    tables: DashMap<String, Arc<MemoryTable>>,
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: DashMap::new(),
        }
    }

    /// Concrete handle to a table, created on first use
    pub fn memory_table(&self, name: &str) -> Arc<MemoryTable> {
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryTable::new(name)))
            .clone()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn table(&self, name: &str) -> Result<Arc<dyn Table>> {
        Ok(self.memory_table(name))
    }

    async fn close(&self) -> Result<()> {
        self.tables.clear();
        Ok(())
    }
}
