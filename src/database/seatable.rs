//! SeaTable table backend
//!
//! Talks to a SeaTable base over its REST API with `reqwest`. A base is
//! opened with an API token, which is exchanged for a short-lived access
//! token and the address of the base's row server:
//!
//! ```text
//! GET {server}/api/v2.1/dtable/app-access-token/     Authorization: Token <api token>
//! ... {dtable_server}/api/v1/dtables/{uuid}/...       Authorization: Token <access token>
//! ```
//!
//! Every batch call is split into chunks of [`MAX_BATCH_SIZE`] rows. A chunk
//! whose reported row count disagrees with what was sent aborts the batch
//! with [`CustodyError::BatchIncomplete`]. Rows are paged 1000 at a time when
//! listed; filtering happens client side, and sorting forces the whole table
//! to be fetched before the first record is yielded.

use super::{ensure_complete, Database, RecordStream, Table, MAX_BATCH_SIZE};
use crate::error::{CustodyError, Result};
use crate::types::{
    fields, link_id, matches_filter, sort_records, validate_fields, Fields, Filter, Record,
    RecordId, SortKey,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

/// Row fetches kept in flight by `batch_get`
const GET_CONCURRENCY: usize = 8;

/// Connection settings for a SeaTable base
#[derive(Clone, Serialize, Deserialize)]
pub struct SeaTableConfig {
    /// Server root, `https://cloud.seatable.io` if unset
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// API token of the base
    #[serde(default)]
    pub api_token: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_server_url() -> String {
    "https://cloud.seatable.io".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for SeaTableConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            api_token: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl fmt::Debug for SeaTableConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeaTableConfig")
            .field("server_url", &self.server_url)
            .field("api_token", &"<redacted>")
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct AppAccessToken {
    access_token: String,
    dtable_uuid: String,
    dtable_server: String,
}

#[derive(Debug, Deserialize)]
struct BaseMetadata {
    metadata: MetadataTables,
}

#[derive(Debug, Deserialize)]
struct MetadataTables {
    tables: Vec<TableMetadata>,
}

#[derive(Debug, Deserialize)]
struct TableMetadata {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    #[serde(default)]
    columns: Vec<ColumnMetadata>,
}

#[derive(Debug, Deserialize)]
struct ColumnMetadata {
    key: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Identifiers needed to read and write one link column
#[derive(Debug, Clone, PartialEq, Eq)]
struct LinkColumn {
    key: String,
    link_id: String,
    table_id: String,
    other_table_id: String,
}

/// Authenticated connection shared by every table of a base
struct Session {
    client: reqwest::Client,
    access_token: String,
    rows_base: Url,
    linked_records_url: Url,
    metadata: OnceCell<Vec<TableMetadata>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("rows_base", &self.rows_base.as_str())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn endpoint(&self, path: &str) -> Result<Url> {
        join_url(&self.rows_base, path)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header(AUTHORIZATION, format!("Token {}", self.access_token))
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn tables(&self) -> Result<&[TableMetadata]> {
        let tables = self
            .metadata
            .get_or_try_init(|| async {
                let url = self.endpoint("metadata/")?;
                let body = self.call(self.request(Method::GET, url)).await?;
                let parsed: BaseMetadata = serde_json::from_value(body)?;
                Ok::<_, CustodyError>(parsed.metadata.tables)
            })
            .await?;
        Ok(tables.as_slice())
    }

    async fn link_column(&self, table: &str, field: &str) -> Result<LinkColumn> {
        let tables = self.tables().await?;
        let meta = tables
            .iter()
            .find(|t| t.name == table)
            .ok_or_else(|| CustodyError::backend(format!("table '{}' not found in base metadata", table)))?;
        let column = meta
            .columns
            .iter()
            .find(|c| c.name == field && c.kind == "link")
            .ok_or_else(|| CustodyError::backend(format!("'{}.{}' is not a link column", table, field)))?;
        link_column_from(&meta.id, column)
    }

    async fn list_rows(&self, table: &str, start: usize, limit: usize) -> Result<Vec<Value>> {
        let url = self.endpoint("rows/")?;
        let request = self.request(Method::GET, url).query(&[
            ("table_name", table.to_string()),
            ("start", start.to_string()),
            ("limit", limit.to_string()),
        ]);
        let body = self.call(request).await?;
        match body.get("rows") {
            Some(Value::Array(rows)) => Ok(rows.clone()),
            _ => Err(CustodyError::backend("row listing without a 'rows' array")),
        }
    }

    async fn get_row(&self, table: &str, record_id: &str) -> Result<Record> {
        let url = self.endpoint(&format!("rows/{}/", record_id))?;
        let response = self
            .request(Method::GET, url)
            .query(&[("table_name", table)])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(CustodyError::RecordNotFound(record_id.to_string()));
        }
        let body: Value = response.error_for_status()?.json().await?;
        match &body {
            Value::Object(map) if !map.is_empty() => record_from_row(body),
            _ => Err(CustodyError::RecordNotFound(record_id.to_string())),
        }
    }
}

fn link_column_from(table_id: &str, column: &ColumnMetadata) -> Result<LinkColumn> {
    let data = column.data.as_ref().ok_or_else(|| {
        CustodyError::backend(format!("link column '{}' has no link data", column.name))
    })?;
    let text = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CustodyError::backend(format!("link column '{}' is missing '{}'", column.name, key)))
    };
    let link_id = text("link_id")?;
    let first = text("table_id")?;
    let second = text("other_table_id")?;
    // The link data is stored once per link; flip it when seen from the other side.
    let (table_id, other_table_id) = if first == table_id { (first, second) } else { (second, first) };
    Ok(LinkColumn { key: column.key.clone(), link_id, table_id, other_table_id })
}

/// Convert one SeaTable row into a record
///
/// `_id` becomes the record id; `_ctime` is kept as `Created` unless the row
/// already has one; `_mtime` is dropped.
fn record_from_row(row: Value) -> Result<Record> {
    let Value::Object(mut map) = row else {
        return Err(CustodyError::backend("row is not an object"));
    };
    let id = match map.remove("_id") {
        Some(Value::String(id)) => id,
        _ => return Err(CustodyError::backend("row without an '_id'")),
    };
    let created = map.remove("_ctime");
    map.remove("_mtime");
    if let Some(created) = created {
        if !map.contains_key(fields::CREATED) {
            map.insert(fields::CREATED.to_string(), created);
        }
    }
    Ok(Record::new(id, map))
}

fn join_url(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| CustodyError::InvalidConfiguration(format!("bad URL '{}' + '{}': {}", base, path, e)))
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') { url.to_string() } else { format!("{}/", url) }
}

/// One table of a SeaTable base
#[derive(Debug)]
pub struct SeaTableTable {
    name: String,
    session: Arc<Session>,
}

#[async_trait]
impl Table for SeaTableTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn batch_create(&self, fields_list: Vec<Fields>) -> Result<Vec<Record>> {
        for fields in &fields_list {
            validate_fields(fields)?;
        }
        let url = self.session.endpoint("batch-append-rows/")?;
        let mut created = Vec::with_capacity(fields_list.len());

        for chunk in fields_list.chunks(MAX_BATCH_SIZE) {
            let body = json!({ "table_name": self.name, "rows": chunk });
            let response = self.session.call(self.session.request(Method::POST, url.clone()).json(&body)).await?;

            let inserted = response.get("inserted_row_count").and_then(Value::as_u64).unwrap_or(0) as usize;
            ensure_complete("append", chunk.len(), inserted)?;
            let ids: Vec<RecordId> = match response.get("row_ids") {
                Some(Value::Array(ids)) => ids
                    .iter()
                    .filter_map(|v| v.get("_id").and_then(Value::as_str).map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };
            ensure_complete("append", chunk.len(), ids.len())?;

            created.extend(ids.into_iter().zip(chunk.iter().cloned()).map(|(id, f)| Record::new(id, f)));
        }
        debug!("Appended {} row(s) to '{}'", created.len(), self.name);
        Ok(created)
    }

    async fn batch_get(&self, record_ids: &[RecordId]) -> Result<Vec<Record>> {
        stream::iter(record_ids.iter().cloned())
            .map(|id| {
                let session = self.session.clone();
                let table = self.name.clone();
                async move { session.get_row(&table, &id).await }
            })
            .buffered(GET_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn batch_update(&self, updates: Vec<(RecordId, Fields)>) -> Result<Vec<Record>> {
        for (_, fields) in &updates {
            validate_fields(fields)?;
        }
        // The row server ignores unknown ids, so resolve every id first.
        let ids: Vec<RecordId> = updates.iter().map(|(id, _)| id.clone()).collect();
        let mut current: HashMap<RecordId, Record> =
            self.batch_get(&ids).await?.into_iter().map(|r| (r.id.clone(), r)).collect();

        let url = self.session.endpoint("batch-update-rows/")?;
        for chunk in updates.chunks(MAX_BATCH_SIZE) {
            let rows: Vec<Value> = chunk
                .iter()
                .map(|(id, fields)| json!({ "row_id": id, "row": fields }))
                .collect();
            let body = json!({ "table_name": self.name, "updates": rows });
            let response = self.session.call(self.session.request(Method::PUT, url.clone()).json(&body)).await?;
            if response.get("success").and_then(Value::as_bool) != Some(true) {
                ensure_complete("update", chunk.len(), 0)?;
            }
        }

        Ok(updates
            .into_iter()
            .filter_map(|(id, fields)| {
                current.remove(&id).map(|mut record| {
                    for (key, value) in fields {
                        record.fields.insert(key, value);
                    }
                    record
                })
            })
            .collect())
    }

    async fn batch_delete(&self, record_ids: &[RecordId]) -> Result<Vec<RecordId>> {
        self.batch_get(record_ids).await?;

        let url = self.session.endpoint("batch-delete-rows/")?;
        for chunk in record_ids.chunks(MAX_BATCH_SIZE) {
            let body = json!({ "table_name": self.name, "row_ids": chunk });
            let response = self.session.call(self.session.request(Method::DELETE, url.clone()).json(&body)).await?;
            let deleted = response.get("deleted_rows").and_then(Value::as_u64).unwrap_or(0) as usize;
            ensure_complete("delete", chunk.len(), deleted)?;
        }
        Ok(record_ids.to_vec())
    }

    async fn get_all(&self, filter: Option<&Filter>, sort: &[SortKey]) -> Result<RecordStream> {
        let session = self.session.clone();
        let table = self.name.clone();
        let pages = stream::try_unfold(Some(0usize), move |start| {
            let session = session.clone();
            let table = table.clone();
            async move {
                let Some(start) = start else {
                    return Ok(None);
                };
                let rows = session.list_rows(&table, start, MAX_BATCH_SIZE).await?;
                if rows.is_empty() {
                    return Ok(None);
                }
                let next = (rows.len() == MAX_BATCH_SIZE).then_some(start + rows.len());
                Ok::<_, CustodyError>(Some((rows, next)))
            }
        })
        .boxed();

        let filter = filter.cloned();
        let records = pages
            .map_ok(|rows| stream::iter(rows.into_iter().map(Ok::<_, CustodyError>)))
            .try_flatten()
            .and_then(|row| future::ready(record_from_row(row)))
            .try_filter(move |record| {
                future::ready(filter.as_ref().map_or(true, |f| matches_filter(record, f)))
            });

        if sort.is_empty() {
            return Ok(records.boxed());
        }
        let mut all: Vec<Record> = records.try_collect().await?;
        sort_records(&mut all, sort);
        Ok(stream::iter(all.into_iter().map(Ok)).boxed())
    }

    async fn get_linked_records(
        &self,
        field: &str,
        record_ids: &[RecordId],
    ) -> Result<HashMap<RecordId, Vec<RecordId>>> {
        let column = self.session.link_column(&self.name, field).await?;
        let mut linked: HashMap<RecordId, Vec<RecordId>> =
            record_ids.iter().map(|id| (id.clone(), Vec::new())).collect();

        for chunk in record_ids.chunks(MAX_BATCH_SIZE) {
            let rows: Vec<Value> = chunk
                .iter()
                .map(|id| json!({ "row_id": id, "offset": 0, "limit": MAX_BATCH_SIZE }))
                .collect();
            let body = json!({ "table_id": column.table_id, "link_column": column.key, "rows": rows });
            let request = self
                .session
                .request(Method::POST, self.session.linked_records_url.clone())
                .json(&body);
            let response = self.session.call(request).await?;
            if let Value::Object(map) = response {
                for (row_id, targets) in map {
                    if let (Some(slot), Value::Array(targets)) = (linked.get_mut(&row_id), targets) {
                        *slot = targets.iter().filter_map(link_id).collect();
                    }
                }
            }
        }
        Ok(linked)
    }

    async fn batch_update_links(
        &self,
        field: &str,
        links: HashMap<RecordId, Vec<RecordId>>,
    ) -> Result<()> {
        let column = self.session.link_column(&self.name, field).await?;
        let url = self.session.endpoint("batch-update-links/")?;
        let entries: Vec<(RecordId, Vec<RecordId>)> = links.into_iter().collect();

        for chunk in entries.chunks(MAX_BATCH_SIZE) {
            let row_ids: Vec<&RecordId> = chunk.iter().map(|(id, _)| id).collect();
            let targets: serde_json::Map<String, Value> =
                chunk.iter().map(|(id, other)| (id.clone(), json!(other))).collect();
            let body = json!({
                "link_id": column.link_id,
                "table_id": column.table_id,
                "other_table_id": column.other_table_id,
                "row_id_list": row_ids,
                "other_rows_ids_map": targets,
            });
            let response = self.session.call(self.session.request(Method::PUT, url.clone()).json(&body)).await?;
            if response.get("success").and_then(Value::as_bool) != Some(true) {
                ensure_complete("update links", chunk.len(), 0)?;
            }
        }
        Ok(())
    }
}

/// A SeaTable base
#[derive(Debug)]
pub struct SeaTableDatabase {
    name: String,
    session: Arc<Session>,
    tables: DashMap<String, Arc<SeaTableTable>>,
}

impl SeaTableDatabase {
    /// Authenticate against the server and open the base
    ///
    /// # Errors
    ///
    /// - [`CustodyError::InvalidConfiguration`] if no API token is set or a
    ///   URL is malformed
    /// - [`CustodyError::Http`] if the token exchange fails
    pub async fn connect(name: impl Into<String>, config: &SeaTableConfig) -> Result<Self> {
        if config.api_token.is_empty() {
            return Err(CustodyError::InvalidConfiguration("SeaTable API token is not set".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let server = Url::parse(&with_trailing_slash(&config.server_url))
            .map_err(|e| CustodyError::InvalidConfiguration(format!("bad server URL: {}", e)))?;
        let token_url = join_url(&server, "api/v2.1/dtable/app-access-token/")?;
        // TODO: refresh the access token on 401; it is only valid for three days.
        let token: AppAccessToken = client
            .get(token_url)
            .header(AUTHORIZATION, format!("Token {}", config.api_token))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let dtable_server = Url::parse(&with_trailing_slash(&token.dtable_server))
            .map_err(|e| CustodyError::backend(format!("bad dtable server URL: {}", e)))?;
        let rows_base = join_url(&dtable_server, &format!("api/v1/dtables/{}/", token.dtable_uuid))?;
        let linked_records_url = join_url(&dtable_server, &format!("api/v1/linked-records/{}", token.dtable_uuid))?;

        let name = name.into();
        info!("Connected to SeaTable base {} ({})", name, token.dtable_uuid);
        Ok(Self {
            name,
            session: Arc::new(Session {
                client,
                access_token: token.access_token,
                rows_base,
                linked_records_url,
                metadata: OnceCell::new(),
            }),
            tables: DashMap::new(),
        })
    }
}

#[async_trait]
impl Database for SeaTableDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn table(&self, name: &str) -> Result<Arc<dyn Table>> {
        let table = self
            .tables
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(SeaTableTable { name: name.to_string(), session: self.session.clone() })
            })
            .clone();
        Ok(table)
    }

    async fn close(&self) -> Result<()> {
        self.tables.clear();
        Ok(())
    }
}
