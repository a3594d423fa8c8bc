//! JSON-object records.
//!
//! A record is a mapping from field name to JSON value. Every stored
//! record carries the three system fields `id`, `created`, `updated` and
//! an integer `_version >= 1`. Schemas are permissive: caller-supplied
//! extras beyond the declared fields are stored as-is.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// System field: opaque 15-character record identifier.
pub const FIELD_ID: &str = "id";
/// System field: RFC 3339 insertion timestamp; never mutates.
pub const FIELD_CREATED: &str = "created";
/// System field: RFC 3339 last-mutation timestamp; strictly advances.
pub const FIELD_UPDATED: &str = "updated";
/// System field: optimistic-concurrency counter, starts at 1.
pub const FIELD_VERSION: &str = "_version";

/// A schema-shaped record: field name to JSON value.
///
/// Stored in the KV substrate as canonical JSON bytes. Cloning is cheap
/// enough for cache fan-out at typical record sizes; hot paths hold
/// records behind `Arc` instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wraps an existing JSON object map.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Converts a JSON value into a record, if it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Returns the field value, if present.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Sets a field value, returning any previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    /// Removes a field, returning its value if it was present.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Returns true if the field is present.
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// The record's `id`, if set.
    pub fn id(&self) -> Option<&str> {
        self.get(FIELD_ID).and_then(Value::as_str)
    }

    /// The record's `created` timestamp, if set.
    pub fn created(&self) -> Option<&str> {
        self.get(FIELD_CREATED).and_then(Value::as_str)
    }

    /// The record's `updated` timestamp, if set.
    pub fn updated(&self) -> Option<&str> {
        self.get(FIELD_UPDATED).and_then(Value::as_str)
    }

    /// The record's `_version`, defaulting to 0 when absent (a record
    /// that has never been committed).
    pub fn version(&self) -> i64 {
        self.get(FIELD_VERSION).and_then(Value::as_i64).unwrap_or(0)
    }

    /// Sets `_version`.
    pub fn set_version(&mut self, version: i64) {
        self.insert(FIELD_VERSION, Value::from(version));
    }

    /// Merges `patch` into this record: every field in the patch
    /// overwrites the corresponding field here. System fields are the
    /// caller's responsibility (the engine re-stamps them after merging).
    pub fn merge(&mut self, patch: &Record) {
        for (field, value) in patch.iter() {
            self.0.insert(field.clone(), value.clone());
        }
    }

    /// Returns a copy with every field in `private_fields` removed.
    ///
    /// This is the sanitize step applied to records leaving the engine.
    /// The raw read feeding an update diff must NOT go through this,
    /// otherwise omitted private fields would be dropped on update.
    pub fn sanitized(&self, private_fields: &[&str]) -> Record {
        let mut out = self.0.clone();
        for field in private_fields {
            out.remove(*field);
        }
        Self(out)
    }

    /// Iterates over `(field, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the record, returning the underlying map.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Borrows the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Encodes the record as canonical JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.0)
    }

    /// Decodes a record from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error if the bytes are not a
    /// JSON object.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Object(record.0)
    }
}

/// Loose equality across primitive JSON values, used by list filters.
///
/// Strings and numbers compare across types (`"42" == 42`); booleans
/// compare to their string spellings; everything else falls back to
/// strict equality.
pub fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.parse::<f64>().map(|parsed| Some(parsed) == n.as_f64()).unwrap_or(false)
        },
        (Value::String(s), Value::Bool(b)) | (Value::Bool(b), Value::String(s)) => {
            matches!((s.as_str(), b), ("true", true) | ("false", false))
        },
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
