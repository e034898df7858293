// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query cache types.
//!
//! # Fetch Status Transitions
//!
//! ```text
//!            init_query()            receive_fetch_result()
//! Pending ───────────────→ Loading ─────────────────────────→ Loaded ←──┐
//!                            ↑  │                               │       │ reconcile
//!                            │  │ receive_fetch_error()         └───────┘
//!                            │  ↓
//!                 init_query() Failed
//! ```
//!
//! A loaded query is revalidated silently by reconciliation: its status stays
//! `Loaded`. Only an explicit new fetch (`init_query`) puts it back to
//! `Loading`.

use crate::document::Document;
use crate::error::{Result, SyncError};
use crate::selector::DocumentFilter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Definition of a query: which doctype, and which of its documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinition {
    /// Doctype the query targets. Required.
    pub doctype: String,

    /// Selector over document fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Value>,

    /// Direct lookup of a single document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Stable name of the query (used to track warm-up).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Pagination offset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,

    /// Page size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Opaque pagination cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<String>,
}

impl QueryDefinition {
    /// Definition for a doctype, with no selector or id yet.
    pub fn new(doctype: impl Into<String>) -> Self {
        Self {
            doctype: doctype.into(),
            selector: None,
            id: None,
            alias: None,
            skip: None,
            limit: None,
            bookmark: None,
        }
    }

    /// Set the selector.
    pub fn with_selector(mut self, selector: Value) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Look up a single document by id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Name the query.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Set pagination.
    pub fn with_page(mut self, skip: usize, limit: usize) -> Self {
        self.skip = Some(skip);
        self.limit = Some(limit);
        self
    }

    /// Check the definition is usable.
    pub fn validate(&self) -> Result<()> {
        if self.doctype.trim().is_empty() {
            return Err(SyncError::InvalidDefinition(
                "Cannot init query with no doctype".to_string(),
            ));
        }
        Ok(())
    }

    /// Compile the automatic membership filter.
    pub fn filter(&self) -> DocumentFilter {
        DocumentFilter::compile(self.selector.as_ref(), self.id.as_deref())
    }
}

/// Fetch status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    /// Registered, never fetched.
    Pending,
    /// A fetch is in flight.
    Loading,
    /// Last fetch succeeded.
    Loaded,
    /// Last fetch failed. `data` is stale but kept.
    Failed,
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchStatus::Pending => write!(f, "pending"),
            FetchStatus::Loading => write!(f, "loading"),
            FetchStatus::Loaded => write!(f, "loaded"),
            FetchStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Cached state of one query.
///
/// `data` holds document ids only; resolve them through the
/// [`DocumentStore`](crate::store::DocumentStore).
#[derive(Debug, Clone)]
pub struct QueryState {
    pub id: String,
    pub definition: QueryDefinition,
    pub fetch_status: FetchStatus,
    pub last_fetch: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    /// Error of the last failed fetch.
    pub last_error: Option<Arc<SyncError>>,
    pub has_more: bool,
    /// Advisory: server-reported total when known, else local length.
    pub count: usize,
    pub data: Vec<String>,

    /// Compiled membership filter.
    pub(crate) filter: DocumentFilter,

    /// Last seen version of each member.
    pub(crate) seen: HashMap<String, SeenVersion>,
}

/// How a member was last seen: its revision, or its whole content when the
/// store gave it no revision.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SeenVersion {
    Revision(String),
    Content(Document),
}

impl SeenVersion {
    fn of(document: &Document) -> Self {
        match document.rev() {
            Some(rev) => Self::Revision(rev.to_string()),
            None => Self::Content(document.clone()),
        }
    }
}

impl QueryState {
    /// Fresh, pending state for a definition.
    pub(crate) fn pending(id: &str, definition: QueryDefinition) -> Self {
        Self {
            id: id.to_string(),
            filter: definition.filter(),
            definition,
            fetch_status: FetchStatus::Pending,
            last_fetch: None,
            last_update: None,
            last_error: None,
            has_more: false,
            count: 0,
            data: Vec::new(),
            seen: HashMap::new(),
        }
    }

    /// Doctype of the query.
    pub fn doctype(&self) -> &str {
        &self.definition.doctype
    }

    /// Whether the document belongs to this query.
    ///
    /// Wrong doctype and tombstones never belong, whatever the selector says.
    pub fn is_fulfilled_by(&self, document: &Document) -> bool {
        if document.doctype() != Some(self.doctype()) {
            return false;
        }
        if !self.filter.accepts(document) {
            return false;
        }
        !document.is_deleted()
    }

    /// Whether this exact version of the document was already seen:
    /// same revision, or same content for an unrevisioned document.
    pub(crate) fn has_seen(&self, document: &Document) -> bool {
        let Some(id) = document.id() else {
            return false;
        };
        self.seen
            .get(id)
            .is_some_and(|seen| *seen == SeenVersion::of(document))
    }

    pub(crate) fn remember(&mut self, documents: &[Document]) {
        for doc in documents {
            if let Some(id) = doc.id() {
                self.seen.insert(id.to_string(), SeenVersion::of(doc));
            }
        }
        let members: std::collections::HashSet<&String> = self.data.iter().collect();
        self.seen.retain(|id, _| members.contains(id));
    }
}

/// Payload of a fetch or mutation response.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchData {
    /// A single document (lookup by id).
    One(Document),
    /// A page of documents.
    Many(Vec<Document>),
}

impl FetchData {
    /// Documents carried by the payload.
    pub fn documents(&self) -> Vec<Document> {
        match self {
            FetchData::One(doc) => vec![doc.clone()],
            FetchData::Many(docs) => docs.clone(),
        }
    }
}

/// Response to a query fetch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchResponse {
    /// Returned documents. `None` leaves the query as it is.
    pub data: Option<FetchData>,
    /// Offset of this page. `0` replaces `data`, anything else appends.
    pub skip: usize,
    /// Whether another page exists, when the server says so.
    pub next: Option<bool>,
    /// Server-reported total.
    pub total: Option<usize>,
}

impl FetchResponse {
    /// Single-document response.
    pub fn one(document: Document) -> Self {
        Self {
            data: Some(FetchData::One(document)),
            ..Default::default()
        }
    }

    /// Page response at an offset.
    pub fn page(documents: Vec<Document>, skip: usize) -> Self {
        Self {
            data: Some(FetchData::Many(documents)),
            skip,
            ..Default::default()
        }
    }

    /// Set the next-page indicator.
    pub fn with_next(mut self, next: bool) -> Self {
        self.next = Some(next);
        self
    }

    /// Set the server-reported total.
    pub fn with_total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    /// Documents carried by the response.
    pub fn documents(&self) -> Vec<Document> {
        self.data.as_ref().map(FetchData::documents).unwrap_or_default()
    }
}

/// Caller-supplied pure function computing a query's new documents after a
/// write, from its current documents and the mutation.
pub type ManualUpdater = Arc<dyn Fn(&[Document], &MutationResult) -> Vec<Document> + Send + Sync>;

/// Result of a local write, as seen by the query cache.
#[derive(Clone, Default)]
pub struct MutationResult {
    /// Documents returned by the write.
    pub response: Option<FetchData>,
    /// Document the write was issued with (used when no response data).
    pub document: Option<Document>,
    /// Explicit per-query updaters, by query id.
    pub update_queries: HashMap<String, ManualUpdater>,
}

impl MutationResult {
    /// Mutation that returned documents.
    pub fn with_response(response: FetchData) -> Self {
        Self {
            response: Some(response),
            ..Default::default()
        }
    }

    /// Declare a manual updater for a query.
    pub fn update_query<F>(mut self, query_id: impl Into<String>, updater: F) -> Self
    where
        F: Fn(&[Document], &MutationResult) -> Vec<Document> + Send + Sync + 'static,
    {
        self.update_queries.insert(query_id.into(), Arc::new(updater));
        self
    }

    /// Documents affected by the write.
    pub fn documents(&self) -> Vec<Document> {
        match (&self.response, &self.document) {
            (Some(data), _) => data.documents(),
            (None, Some(doc)) => vec![doc.clone()],
            (None, None) => Vec::new(),
        }
    }
}

impl fmt::Debug for MutationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationResult")
            .field("response", &self.response)
            .field("document", &self.document)
            .field("update_queries", &self.update_queries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A query with its ids resolved to documents.
#[derive(Debug, Clone)]
pub struct ResolvedQuery {
    pub state: Arc<QueryState>,
    pub documents: Vec<Document>,
}
