// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicated documents.
//!
//! A [`Document`] is an arbitrary JSON object. A few underscore fields carry
//! meaning for the engine:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `_id` / `id` | Identity within the doctype (`id` wins when both exist) |
//! | `_type` | Doctype the document belongs to |
//! | `_rev` | Revision marker assigned by the store |
//! | `_deleted` | Tombstone flag |
//!
//! Ids starting with `_design/` are internal design documents and never
//! leave the replication layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of internal design document ids.
pub const DESIGN_DOC_PREFIX: &str = "_design";

/// A JSON document as stored and replicated.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Create a document with an id and a doctype.
    pub fn with_id(doctype: &str, id: &str) -> Self {
        let mut doc = Self::new();
        doc.0.insert("_id".to_string(), Value::String(id.to_string()));
        doc.0.insert("_type".to_string(), Value::String(doctype.to_string()));
        doc
    }

    /// Build a document from a JSON value, returning `None` for non-objects.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Identity of the document. `id` takes precedence over `_id`.
    pub fn id(&self) -> Option<&str> {
        self.str_field("id").or_else(|| self.str_field("_id"))
    }

    /// Doctype (`_type`) of the document.
    pub fn doctype(&self) -> Option<&str> {
        self.str_field("_type")
    }

    /// Revision marker (`_rev`), if the store assigned one.
    pub fn rev(&self) -> Option<&str> {
        self.str_field("_rev")
    }

    /// Whether the document is a tombstone.
    pub fn is_deleted(&self) -> bool {
        matches!(self.0.get("_deleted"), Some(Value::Bool(true)))
    }

    /// Whether the document is an internal design document.
    pub fn is_design(&self) -> bool {
        self.str_field("_id")
            .map(|id| id.starts_with(DESIGN_DOC_PREFIX))
            .unwrap_or(false)
    }

    /// Read a top-level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Set a top-level field, returning the document for chaining.
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    /// Insert a top-level field in place.
    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    /// Borrow the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Convert into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Keep only documents that consumers may see: no design docs, no tombstones.
pub fn visible_documents(docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
    docs.into_iter()
        .filter(|doc| !doc.is_design() && !doc.is_deleted())
        .collect()
}
