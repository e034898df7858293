// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query cache engine.
//!
//! Keeps one [`QueryState`] per registered query and maintains its result
//! set incrementally from three kinds of input:
//!
//! 1. Fetch results (full or paginated) for the query itself
//! 2. Newly seen documents (replication, other queries' fetches, writes),
//!    matched against each query's selector
//! 3. Manual updaters declared by a write for specific queries
//!
//! The engine performs no I/O and never suspends. Entries are held behind
//! `Arc`: an update that changes nothing keeps the same `Arc`, so callers
//! can skip work with [`Arc::ptr_eq`].

mod types;
mod updaters;

pub use types::{
    FetchData, FetchResponse, FetchStatus, ManualUpdater, MutationResult, QueryDefinition,
    QueryState, ResolvedQuery,
};
pub use updaters::{diff_membership, MembershipDiff};

use crate::document::Document;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::store::DocumentStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Source of timestamps for `last_fetch` / `last_update`.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The query cache.
pub struct QueryCache {
    queries: HashMap<String, Arc<QueryState>>,
    clock: Clock,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    /// Create an empty cache using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    /// Create an empty cache with a custom clock.
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            queries: HashMap::new(),
            clock,
        }
    }

    /// Register a query, or restart the fetch of an existing one.
    ///
    /// Existing `data` is kept; status becomes `Loading`.
    pub fn init_query(&mut self, query_id: &str, definition: QueryDefinition) -> Result<Arc<QueryState>> {
        definition.validate()?;

        let mut state = match self.queries.get(query_id) {
            Some(existing) => QueryState::clone(existing),
            None => QueryState::pending(query_id, definition.clone()),
        };
        state.filter = definition.filter();
        state.definition = definition;
        state.fetch_status = FetchStatus::Loading;

        let state = Arc::new(state);
        self.queries.insert(query_id.to_string(), Arc::clone(&state));
        debug!(query_id = %query_id, doctype = %state.doctype(), "Query initialized");
        Ok(state)
    }

    /// Apply a fetch result to its query.
    ///
    /// Returns `false` (query untouched) when the response carries no data.
    /// Other queries are not touched here: callers reconcile them with
    /// [`reconcile_on_document_change`](Self::reconcile_on_document_change).
    pub fn receive_fetch_result(&mut self, query_id: &str, response: &FetchResponse) -> Result<bool> {
        let current = self
            .queries
            .get(query_id)
            .ok_or_else(|| SyncError::UnknownQuery(query_id.to_string()))?;

        let Some(data) = &response.data else {
            trace!(query_id = %query_id, "Fetch result without data, ignoring");
            return Ok(false);
        };

        let now = (self.clock)();
        let mut next = QueryState::clone(current);
        next.fetch_status = FetchStatus::Loaded;
        next.last_fetch = Some(now);
        next.last_update = Some(now);

        let documents = match data {
            FetchData::One(doc) => {
                next.has_more = false;
                next.data = doc.id().map(|id| vec![id.to_string()]).unwrap_or_default();
                next.count = next.data.len();
                vec![doc.clone()]
            }
            FetchData::Many(docs) => {
                let ids = docs.iter().filter_map(|d| d.id().map(str::to_string));
                if response.skip == 0 {
                    next.data = ids.collect();
                } else {
                    next.data.extend(ids);
                }
                if let Some(more) = response.next {
                    next.has_more = more;
                }
                next.count = match response.total {
                    Some(total) if total > 0 => total,
                    _ => docs.len(),
                };
                docs.clone()
            }
        };
        next.remember(&documents);

        debug!(
            query_id = %query_id,
            skip = response.skip,
            count = next.count,
            has_more = next.has_more,
            "Fetch result received"
        );
        self.queries.insert(query_id.to_string(), Arc::new(next));
        Ok(true)
    }

    /// Record a fetch failure. `data` is kept.
    pub fn receive_fetch_error(&mut self, query_id: &str, error: impl Into<String>) -> Result<()> {
        let current = self
            .queries
            .get(query_id)
            .ok_or_else(|| SyncError::UnknownQuery(query_id.to_string()))?;

        let mut next = QueryState::clone(current);
        next.fetch_status = FetchStatus::Failed;
        let error = SyncError::FetchFailure {
            query_id: query_id.to_string(),
            message: error.into(),
        };
        debug!(error = %error, "Fetch failed");
        next.last_error = Some(Arc::new(error));

        self.queries.insert(query_id.to_string(), Arc::new(next));
        Ok(())
    }

    /// Recompute membership of every query (except `except`) against
    /// changed documents.
    ///
    /// Returns the ids of the queries that changed.
    pub fn reconcile_on_document_change(
        &mut self,
        changed: &[Document],
        except: Option<&str>,
    ) -> Vec<String> {
        if changed.is_empty() {
            return Vec::new();
        }
        let now = (self.clock)();
        let mut updated = Vec::new();

        for (query_id, state) in self.queries.iter_mut() {
            if except == Some(query_id.as_str()) {
                continue;
            }
            if let Some(next) = updaters::auto_update(state, changed, now) {
                *state = Arc::new(next);
                updated.push(query_id.clone());
            }
        }

        metrics::record_queries_reconciled("documents", updated.len());
        if !updated.is_empty() {
            debug!(
                changed_docs = changed.len(),
                updated_queries = updated.len(),
                "Queries reconciled with changed documents"
            );
        }
        updated
    }

    /// Apply a local write to the queries.
    ///
    /// Manual updaters declared by the write take precedence: only the
    /// queries they name change. Without any, every query is reconciled
    /// automatically with the write's documents.
    pub fn reconcile_on_mutation(
        &mut self,
        mutation: &MutationResult,
        documents: &DocumentStore,
    ) -> Vec<String> {
        if mutation.update_queries.is_empty() {
            let changed = mutation.documents();
            return self.reconcile_on_document_change(&changed, None);
        }

        let now = (self.clock)();
        let mut updated = Vec::new();

        for (query_id, state) in self.queries.iter_mut() {
            let Some(updater) = mutation.update_queries.get(query_id) else {
                continue;
            };
            let current = documents.get_many(state.doctype(), &state.data);
            let next = updaters::manual_update(state, updater, &current, mutation, now);
            *state = Arc::new(next);
            updated.push(query_id.clone());
        }

        metrics::record_queries_reconciled("manual", updated.len());
        debug!(updated_queries = updated.len(), "Manual query updates applied");
        updated
    }

    /// Get a query's cached state.
    pub fn get_query(&self, query_id: &str) -> Option<Arc<QueryState>> {
        self.queries.get(query_id).cloned()
    }

    /// Get a query with its ids resolved to documents (unknown ids dropped).
    pub fn resolve_query(&self, query_id: &str, documents: &DocumentStore) -> Option<ResolvedQuery> {
        let state = self.get_query(query_id)?;
        let docs = documents.get_many(state.doctype(), &state.data);
        Some(ResolvedQuery {
            state,
            documents: docs,
        })
    }

    /// De-register a query.
    pub fn remove_query(&mut self, query_id: &str) -> Option<Arc<QueryState>> {
        self.queries.remove(query_id)
    }

    /// Ids of all registered queries.
    pub fn query_ids(&self) -> Vec<String> {
        self.queries.keys().cloned().collect()
    }

    /// Number of registered queries.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Whether no query is registered.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}
