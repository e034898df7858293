// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document store facade.
//!
//! Holds the latest known revision of every document, per doctype. It is
//! written by replication results and by local mutations, and read by the
//! query cache to turn query ids back into documents.
//!
//! Writes replace a document by id under a lock (last writer wins). No
//! other coordination is needed.

use crate::document::Document;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::trace;

/// In-memory, per-doctype map of the latest document revisions.
#[derive(Debug, Default)]
pub struct DocumentStore {
    doctypes: RwLock<HashMap<String, HashMap<String, Document>>>,
}

impl DocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a document by id.
    pub fn get(&self, doctype: &str, id: &str) -> Option<Document> {
        let guard = self.doctypes.read().unwrap_or_else(|e| e.into_inner());
        guard.get(doctype).and_then(|docs| docs.get(id)).cloned()
    }

    /// Store a document. Returns `true` if the store changed.
    pub fn put(&self, doctype: &str, document: Document) -> bool {
        !self.bulk_put(doctype, vec![document]).is_empty()
    }

    /// Store several documents.
    ///
    /// Returns the documents that actually changed the store (new ids or
    /// different content). Documents without an id are ignored.
    pub fn bulk_put(&self, doctype: &str, documents: Vec<Document>) -> Vec<Document> {
        let mut guard = self.doctypes.write().unwrap_or_else(|e| e.into_inner());
        let docs = guard.entry(doctype.to_string()).or_default();
        let mut changed = Vec::new();

        for document in documents {
            let Some(id) = document.id().map(str::to_string) else {
                trace!(doctype = %doctype, "Ignoring document without id");
                continue;
            };
            if docs.get(&id) == Some(&document) {
                continue;
            }
            docs.insert(id, document.clone());
            changed.push(document);
        }

        changed
    }

    /// Remove a document. Returns the removed document, if any.
    pub fn remove(&self, doctype: &str, id: &str) -> Option<Document> {
        let mut guard = self.doctypes.write().unwrap_or_else(|e| e.into_inner());
        guard.get_mut(doctype).and_then(|docs| docs.remove(id))
    }

    /// Materialize ids into documents, dropping unknown ids.
    pub fn get_many(&self, doctype: &str, ids: &[String]) -> Vec<Document> {
        let guard = self.doctypes.read().unwrap_or_else(|e| e.into_inner());
        match guard.get(doctype) {
            Some(docs) => ids.iter().filter_map(|id| docs.get(id).cloned()).collect(),
            None => Vec::new(),
        }
    }

    /// Number of documents known for a doctype.
    pub fn len(&self, doctype: &str) -> usize {
        let guard = self.doctypes.read().unwrap_or_else(|e| e.into_inner());
        guard.get(doctype).map(HashMap::len).unwrap_or(0)
    }

    /// Whether no document is known for a doctype.
    pub fn is_empty(&self, doctype: &str) -> bool {
        self.len(doctype) == 0
    }
}
