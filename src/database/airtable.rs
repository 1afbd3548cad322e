//! Airtable table backend
//!
//! Talks to one Airtable base over its REST API:
//!
//! ```text
//! {api_url}/{base_id}/{table}            list, create, update, delete
//! {api_url}/{base_id}/{table}/{record}   fetch one record
//! Authorization: Bearer <api key>
//! ```
//!
//! The API accepts at most [`AIRTABLE_BATCH_SIZE`] records per write, so
//! batches are chunked far finer than for other backends. Listings are
//! paged by the `offset` cursor the API returns with each page. A filter is
//! sent as a `filterByFormula` and re-checked client side; sorting happens
//! client side once every page has arrived.
//!
//! Link fields are plain arrays of record ids, so links are read and
//! written through the ordinary record calls.

use super::{ensure_complete, Database, RecordStream, Table};
use crate::error::{CustodyError, Result};
use crate::types::{
    fields, matches_filter, sort_records, validate_fields, Fields, Filter, Record, RecordId,
    SortKey,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Largest number of records one Airtable write accepts
pub const AIRTABLE_BATCH_SIZE: usize = 10;

/// Records requested per listing page
const PAGE_SIZE: usize = 100;

/// Record fetches kept in flight by `batch_get`
const GET_CONCURRENCY: usize = 4;

/// Connection settings for an Airtable base
#[derive(Clone, Serialize, Deserialize)]
pub struct AirtableConfig {
    /// API root, `https://api.airtable.com/v0` if unset
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Personal access token or API key
    #[serde(default)]
    pub api_key: String,
    /// Base id, `app...`
    #[serde(default)]
    pub base_id: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_url() -> String {
    "https://api.airtable.com/v0".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for AirtableConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: String::new(),
            base_id: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl fmt::Debug for AirtableConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AirtableConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .field("base_id", &self.base_id)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ApiRecord {
    id: String,
    #[serde(rename = "createdTime", default)]
    created_time: Option<String>,
    #[serde(default)]
    fields: Fields,
}

impl ApiRecord {
    /// `createdTime` is kept as `Created` unless the record has its own
    fn into_record(self) -> Record {
        let mut fields = self.fields;
        if let Some(created) = self.created_time {
            fields
                .entry(fields::CREATED.to_string())
                .or_insert(Value::String(created));
        }
        Record::new(self.id, fields)
    }
}

#[derive(Debug, Deserialize)]
struct RecordList {
    #[serde(default)]
    records: Vec<ApiRecord>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Deleted {
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct DeletedList {
    #[serde(default)]
    records: Vec<Deleted>,
}

struct Session {
    client: reqwest::Client,
    api_key: String,
    base: Url,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// URL of `segments` below the base, each percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| CustodyError::InvalidConfiguration(format!("bad Airtable URL '{}'", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.client.request(method, url).bearer_auth(&self.api_key)
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn get_record(&self, table: &str, record_id: &str) -> Result<Record> {
        let url = self.endpoint(&[table, record_id])?;
        let response = self.request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(CustodyError::RecordNotFound(record_id.to_string()));
        }
        let record: ApiRecord = response.error_for_status()?.json().await?;
        Ok(record.into_record())
    }

    async fn list_page(&self, table: &str, formula: Option<&str>, offset: Option<&str>) -> Result<RecordList> {
        let mut query = vec![("pageSize", PAGE_SIZE.to_string())];
        if let Some(formula) = formula {
            query.push(("filterByFormula", formula.to_string()));
        }
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }
        let url = self.endpoint(&[table])?;
        self.call(self.request(Method::GET, url).query(&query)).await
    }
}

/// Airtable formula matching records whose fields equal every filter value
///
/// # Example
///
/// ```rust
/// use custody::database::airtable::filter_formula;
/// use custody::Filter;
/// use serde_json::json;
///
/// let mut filter = Filter::new();
/// filter.insert("Name".to_string(), json!("it's.flac"));
/// assert_eq!(filter_formula(&filter), r#"AND({Name}='it\'s.flac')"#);
/// ```
pub fn filter_formula(filter: &Filter) -> String {
    let terms: Vec<String> = filter
        .iter()
        .map(|(field, value)| format!("{{{}}}={}", field, formula_literal(value)))
        .collect();
    format!("AND({})", terms.join(","))
}

fn formula_literal(value: &Value) -> String {
    match value {
        Value::Bool(true) => "TRUE()".to_string(),
        Value::Bool(false) => "FALSE()".to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "BLANK()".to_string(),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// One table of an Airtable base
#[derive(Debug)]
pub struct AirtableTable {
    name: String,
    session: Arc<Session>,
}

impl AirtableTable {
    async fn write(&self, method: Method, records: Vec<Value>) -> Result<Vec<ApiRecord>> {
        let url = self.session.endpoint(&[self.name.as_str()])?;
        let list: RecordList = self
            .session
            .call(self.session.request(method, url).json(&json!({ "records": records })))
            .await?;
        Ok(list.records)
    }
}

#[async_trait]
impl Table for AirtableTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn batch_create(&self, fields_list: Vec<Fields>) -> Result<Vec<Record>> {
        for fields in &fields_list {
            validate_fields(fields)?;
        }
        let mut created = Vec::with_capacity(fields_list.len());
        for chunk in fields_list.chunks(AIRTABLE_BATCH_SIZE) {
            let records = chunk.iter().map(|fields| json!({ "fields": fields })).collect();
            let written = self.write(Method::POST, records).await?;
            ensure_complete("create", chunk.len(), written.len())?;
            created.extend(written.into_iter().map(ApiRecord::into_record));
        }
        debug!("Created {} record(s) in '{}'", created.len(), self.name);
        Ok(created)
    }

    async fn batch_get(&self, record_ids: &[RecordId]) -> Result<Vec<Record>> {
        stream::iter(record_ids.iter().cloned())
            .map(|id| {
                let session = self.session.clone();
                let table = self.name.clone();
                async move { session.get_record(&table, &id).await }
            })
            .buffered(GET_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn batch_update(&self, updates: Vec<(RecordId, Fields)>) -> Result<Vec<Record>> {
        for (_, fields) in &updates {
            validate_fields(fields)?;
        }
        // Resolve ids first so a missing one is a RecordNotFound, not a 4xx.
        let ids: Vec<RecordId> = updates.iter().map(|(id, _)| id.clone()).collect();
        self.batch_get(&ids).await?;

        let mut updated = Vec::with_capacity(updates.len());
        for chunk in updates.chunks(AIRTABLE_BATCH_SIZE) {
            let records = chunk
                .iter()
                .map(|(id, fields)| json!({ "id": id, "fields": fields }))
                .collect();
            let written = self.write(Method::PATCH, records).await?;
            ensure_complete("update", chunk.len(), written.len())?;
            updated.extend(written.into_iter().map(ApiRecord::into_record));
        }
        Ok(updated)
    }

    async fn batch_delete(&self, record_ids: &[RecordId]) -> Result<Vec<RecordId>> {
        self.batch_get(record_ids).await?;

        for chunk in record_ids.chunks(AIRTABLE_BATCH_SIZE) {
            let url = self.session.endpoint(&[self.name.as_str()])?;
            let query: Vec<(&str, &str)> = chunk.iter().map(|id| ("records[]", id.as_str())).collect();
            let list: DeletedList = self
                .session
                .call(self.session.request(Method::DELETE, url).query(&query))
                .await?;
            let deleted = list.records.iter().filter(|r| r.deleted).count();
            ensure_complete("delete", chunk.len(), deleted)?;
        }
        Ok(record_ids.to_vec())
    }

    async fn get_all(&self, filter: Option<&Filter>, sort: &[SortKey]) -> Result<RecordStream> {
        let session = self.session.clone();
        let table = self.name.clone();
        let formula = filter.filter(|f| !f.is_empty()).map(filter_formula);
        // State: `None` once the last page was read, else the cursor to send
        let pages = stream::try_unfold(Some(None::<String>), move |cursor| {
            let session = session.clone();
            let table = table.clone();
            let formula = formula.clone();
            async move {
                let Some(offset) = cursor else {
                    return Ok(None);
                };
                let page = session.list_page(&table, formula.as_deref(), offset.as_deref()).await?;
                let next = page.offset.map(Some);
                Ok::<_, CustodyError>(Some((page.records, next)))
            }
        })
        .boxed();

        let filter = filter.cloned();
        let records = pages
            .map_ok(|records| stream::iter(records.into_iter().map(|r| Ok::<_, CustodyError>(r.into_record()))))
            .try_flatten()
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
        Ok(self
            .batch_get(record_ids)
            .await?
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
            .map(|(id, others)| {
                let mut fields = Fields::new();
                fields.insert(field.to_string(), json!(others));
                (id, fields)
            })
            .collect();
        self.batch_update(updates).await?;
        Ok(())
    }
}

/// An Airtable base
#[derive(Debug)]
pub struct AirtableDatabase {
    name: String,
    session: Arc<Session>,
    tables: DashMap<String, Arc<AirtableTable>>,
}

impl AirtableDatabase {
    /// Open a base
    ///
    /// No request is made until a table is used.
    ///
    /// # Errors
    ///
    /// Returns [`CustodyError::InvalidConfiguration`] if the API key or base
    /// id is missing or the API URL is malformed.
    pub fn connect(name: impl Into<String>, config: &AirtableConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(CustodyError::InvalidConfiguration("Airtable API key is not set".to_string()));
        }
        if config.base_id.is_empty() {
            return Err(CustodyError::InvalidConfiguration("Airtable base id is not set".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let mut base = Url::parse(config.api_url.trim_end_matches('/'))
            .map_err(|e| CustodyError::InvalidConfiguration(format!("bad Airtable URL: {}", e)))?;
        base.path_segments_mut()
            .map_err(|_| CustodyError::InvalidConfiguration(format!("bad Airtable URL '{}'", config.api_url)))?
            .pop_if_empty()
            .push(&config.base_id);

        let name = name.into();
        info!("Opened Airtable base {} ({})", name, config.base_id);
        Ok(Self {
            name,
            session: Arc::new(Session { client, api_key: config.api_key.clone(), base }),
            tables: DashMap::new(),
        })
    }
}

#[async_trait]
impl Database for AirtableDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn table(&self, name: &str) -> Result<Arc<dyn Table>> {
        let table = self
            .tables
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(AirtableTable { name: name.to_string(), session: self.session.clone() })
            })
            .clone();
        Ok(table)
    }

    async fn close(&self) -> Result<()> {
        self.tables.clear();
        Ok(())
    }
}
