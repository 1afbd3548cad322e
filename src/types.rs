//! Core data types used throughout the custody library
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Records**: `Record`, `Fields`, `RecordId` - one row of a table
//! - **Queries**: `Filter`, `SortKey` - equality filters and multi-key sorts
//! - **File schema**: the field names and placeholder values of the Files table
//!
//! ## Examples
//!
//! ```rust
//! use custody::types::{Record, SortKey};
//! use serde_json::json;
//!
//! let record = Record::new("rec1", custody::types::fields_from_value(json!({
//!     "Name": "t.txt",
//!     "Size": 12,
//! })).unwrap());
//! assert_eq!(record.text("Name"), Some("t.txt"));
//! assert_eq!(record.integer("Size"), Some(12));
//!
//! let key = SortKey::parse("-Created");
//! assert!(key.descending);
//! ```

use crate::error::{CustodyError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Opaque, store-assigned record identity
pub type RecordId = String;

/// Ordered mapping from field name to value
///
/// Insertion order is preserved (`serde_json` is built with
/// `preserve_order`).
pub type Fields = serde_json::Map<String, Value>;

/// Equality conjunction: every key must equal its value
pub type Filter = Fields;

/// Field names that backends manage themselves
pub const RESERVED_KEYS: [&str; 3] = ["_id", "_ctime", "_mtime"];

/// Names of the fields of the Files table
pub mod fields {
    /// Original file name, also the storage key
    pub const NAME: &str = "Name";
    /// Size in bytes
    pub const SIZE: &str = "Size";
    /// Hex SHA-256 computed at ingest time
    pub const SHA256: &str = "SHA256";
    /// Name of the storage holding the primary copy
    pub const STORAGE: &str = "Storage";
    /// Permanent archive URL, or [`super::ARCHIVE_PLACEHOLDER`]
    pub const INTERNET_ARCHIVE: &str = "Internet Archive";
    /// Serialized metadata JSON, or [`super::METADATA_PLACEHOLDER`]
    pub const METADATA: &str = "Metadata";
    /// RFC 3339 creation timestamp
    pub const CREATED: &str = "Created";
    /// Link field on the Musics table pointing back at Files
    pub const FILES: &str = "Files";
}

/// Table holding one row per ingested file
pub const FILES_TABLE: &str = "Files";

/// Table holding one row per audio file
pub const MUSICS_TABLE: &str = "Musics";

/// Archive field value meaning "not archived yet"
pub const ARCHIVE_PLACEHOLDER: &str = "https://example.com/";

/// Metadata field value meaning "not extracted yet"
pub const METADATA_PLACEHOLDER: &str = "To be added";

/// Convert an arbitrary JSON value into record fields
///
/// # Errors
///
/// Returns [`CustodyError::InvalidRecord`] if the value is not a JSON object
/// or uses a reserved or empty field name.
pub fn fields_from_value(value: Value) -> Result<Fields> {
    match value {
        Value::Object(map) => {
            validate_fields(&map)?;
            Ok(map)
        }
        other => Err(CustodyError::invalid_record(format!(
            "fields must be a mapping, got {}",
            json_kind(&other)
        ))),
    }
}

/// Reject empty and backend-reserved field names
pub fn validate_fields(fields: &Fields) -> Result<()> {
    for key in fields.keys() {
        if key.trim().is_empty() {
            return Err(CustodyError::invalid_record("field names must not be empty"));
        }
        if RESERVED_KEYS.contains(&key.as_str()) {
            return Err(CustodyError::invalid_record(format!("field name '{}' is reserved", key)));
        }
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One row of structured data
///
/// A `Record` held by a caller is a view: the table that created it owns the
/// authoritative copy. Re-fetch, or use the record returned by an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Store-assigned identity, immutable once assigned
    pub id: RecordId,
    /// Field values
    pub fields: Fields,
}

impl Record {
    /// Create a record view
    pub fn new(id: impl Into<RecordId>, fields: Fields) -> Self {
        Self { id: id.into(), fields }
    }

    /// Raw field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// String field value
    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Integer field value (accepts integral floats, which some services return)
    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| {
                n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)
            }),
            _ => None,
        }
    }

    /// Link field value as a list of record ids
    ///
    /// Accepts both plain id arrays and the `{"row_id": ..}` objects remote
    /// services return. Missing fields read as an empty list.
    pub fn links(&self, key: &str) -> Vec<RecordId> {
        match self.fields.get(key) {
            Some(Value::Array(items)) => items.iter().filter_map(link_id).collect(),
            _ => Vec::new(),
        }
    }

    /// Name of the file this record describes, or its id when unnamed
    pub fn display_name(&self) -> String {
        self.text(fields::NAME)
            .map(str::to_string)
            .unwrap_or_else(|| self.id.clone())
    }
}

pub(crate) fn link_id(value: &Value) -> Option<RecordId> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("row_id")
            .or_else(|| map.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// One sort key: field name plus direction
///
/// Written as `"field"` for ascending and `"-field"` for descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Field to sort on
    pub field: String,
    /// Whether to sort in descending order
    pub descending: bool,
}

impl SortKey {
    /// Parse `"field"` / `"-field"`
    pub fn parse(key: &str) -> Self {
        match key.strip_prefix('-') {
            Some(field) => Self { field: field.to_string(), descending: true },
            None => Self { field: key.to_string(), descending: false },
        }
    }

    /// Ascending key
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), descending: false }
    }

    /// Descending key
    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), descending: true }
    }
}

/// Parse a list of sort specs
pub fn sort_keys<S: AsRef<str>>(specs: &[S]) -> Vec<SortKey> {
    specs.iter().map(|s| SortKey::parse(s.as_ref())).collect()
}

/// Check a record against an equality filter
///
/// An empty filter matches everything. A missing field compares as `null`.
pub fn matches_filter(record: &Record, filter: &Filter) -> bool {
    filter
        .iter()
        .all(|(key, expected)| record.fields.get(key).unwrap_or(&Value::Null) == expected)
}

/// Sort records in place by several keys
///
/// Keys are applied in reverse with a stable sort so the first key listed
/// dominates.
pub fn sort_records(records: &mut [Record], keys: &[SortKey]) {
    for key in keys.iter().rev() {
        records.sort_by(|a, b| {
            let ord = compare_values(a.fields.get(&key.field), b.fields.get(&key.field));
            if key.descending { ord.reverse() } else { ord }
        });
    }
}

/// Total order over optional JSON values
///
/// Missing < null < bool < number < string < anything else. Values of other
/// kinds compare equal, which keeps the sort stable for them.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
