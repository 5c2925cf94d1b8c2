//! Core types for the subscription cache.

use crate::error::CacheError;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Field map of a backend document.
pub type Fields = Map<String, Value>;

/// Data shared by all observers of a collection query.
pub type CollectionData = Arc<Vec<Record>>;

/// Data shared by all observers of a single document.
pub type DocumentData = Arc<Record>;

/// Identifies one live query or document in the registry.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        CacheKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        CacheKey(s.to_string())
    }
}

/// Kind of read an error is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Collection query.
    List,
    /// Single document read.
    Get,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::List => f.write_str("list"),
            Operation::Get => f.write_str("get"),
        }
    }
}

/// A backend document: its identity plus its field map.
///
/// The identity is kept apart from the fields, so a field that happens to be
/// named `id` never replaces it.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    id: String,
    fields: Fields,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Document identity (last path segment).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Deserialize the field map into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }

    /// Merged JSON object with the identity under `id`.
    pub fn to_json(&self) -> Value {
        let mut merged = self.fields.clone();
        merged.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(merged)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let shadowed = self.fields.contains_key("id");
        let len = self.fields.len() + usize::from(!shadowed);
        let mut map = serializer.serialize_map(Some(len))?;
        for (name, value) in &self.fields {
            if name != "id" {
                map.serialize_entry(name, value)?;
            }
        }
        map.serialize_entry("id", &self.id)?;
        map.end()
    }
}

/// What an observer sees for its key at a given moment.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedState<D> {
    pub data: Option<D>,
    pub is_loading: bool,
    pub error: Option<CacheError>,
    /// True while the data came from the cache and no fresh emission has
    /// reached this observer yet.
    pub is_stale: bool,
}

impl<D> ObservedState<D> {
    /// State for a `None` query: nothing, not loading.
    pub fn idle() -> Self {
        Self {
            data: None,
            is_loading: false,
            error: None,
            is_stale: false,
        }
    }

    /// State of a brand new entry waiting for its first emission.
    pub fn loading() -> Self {
        Self {
            data: None,
            is_loading: true,
            error: None,
            is_stale: false,
        }
    }
}

impl<D> Default for ObservedState<D> {
    fn default() -> Self {
        Self::idle()
    }
}
