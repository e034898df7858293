// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumer-facing query client.
//!
//! Couples a [`QueryCache`] with the [`DocumentStore`] it resolves against
//! and routes every input through both:
//!
//! | Input | Store | Queries |
//! |-------|-------|---------|
//! | fetch result | documents written | the fetched query, then every other one |
//! | local write | documents written (optimistic) | manual updaters, else every query |
//! | replication | documents written | every query |
//!
//! Implements [`SchedulerHooks`] so it can be handed to the scheduler
//! directly.

use crate::document::Document;
use crate::error::{Result, SyncError};
use crate::query::{
    FetchResponse, MutationResult, QueryCache, QueryDefinition, QueryState, ResolvedQuery,
};
use crate::scheduler::{DoctypeUpdates, SchedulerHooks};
use crate::store::DocumentStore;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

/// Query cache and document store behind one lock.
pub struct QueryClient {
    store: Arc<DocumentStore>,
    cache: RwLock<QueryCache>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    pub fn new() -> Self {
        Self::with_cache(QueryCache::new())
    }

    pub fn with_cache(cache: QueryCache) -> Self {
        Self {
            store: Arc::new(DocumentStore::new()),
            cache: RwLock::new(cache),
        }
    }

    /// The document store queries resolve against.
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    fn read(&self) -> RwLockReadGuard<'_, QueryCache> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, QueryCache> {
        self.cache.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a query (or restart its fetch).
    pub fn register_query(&self, query_id: &str, definition: QueryDefinition) -> Result<Arc<QueryState>> {
        self.write().init_query(query_id, definition)
    }

    /// Apply a fetch result.
    ///
    /// Returns the ids of every query that changed, the fetched one first.
    /// Other queries are only reconciled against documents the store did
    /// not already hold.
    pub fn receive_fetch_result(&self, query_id: &str, response: &FetchResponse) -> Result<Vec<String>> {
        let mut cache = self.write();
        let doctype = cache
            .get_query(query_id)
            .map(|q| q.doctype().to_string())
            .ok_or_else(|| SyncError::UnknownQuery(query_id.to_string()))?;

        let changed = self.store.bulk_put(&doctype, with_doctype(response.documents(), &doctype));
        if !cache.receive_fetch_result(query_id, response)? {
            return Ok(Vec::new());
        }

        let mut updated = vec![query_id.to_string()];
        // Documents the store already held cannot move other queries
        if !changed.is_empty() {
            updated.extend(cache.reconcile_on_document_change(&changed, Some(query_id)));
        }
        Ok(updated)
    }

    /// Record a fetch failure.
    pub fn receive_fetch_error(&self, query_id: &str, error: impl Into<String>) -> Result<()> {
        self.write().receive_fetch_error(query_id, error)
    }

    /// Apply a local write: store its documents, then update the queries.
    ///
    /// Documents without a doctype are not stored.
    pub fn apply_mutation(&self, mutation: &MutationResult) -> Vec<String> {
        let mut cache = self.write();
        for (doctype, documents) in by_doctype(mutation.documents()) {
            self.store.bulk_put(&doctype, documents);
        }
        cache.reconcile_on_mutation(mutation, &self.store)
    }

    /// Apply the documents brought by a replication iteration.
    pub fn apply_sync(&self, updates: &DoctypeUpdates) -> Vec<String> {
        let mut cache = self.write();
        let mut updated = Vec::new();
        // Reconciled per doctype: a batch is matched by its first document's doctype
        for (doctype, documents) in updates {
            let documents = with_doctype(documents.clone(), doctype);
            self.store.bulk_put(doctype, documents.clone());
            for query_id in cache.reconcile_on_document_change(&documents, None) {
                if !updated.contains(&query_id) {
                    updated.push(query_id);
                }
            }
        }
        debug!(doctypes = updates.len(), queries = updated.len(), "Replicated documents applied");
        updated
    }

    pub fn get_query(&self, query_id: &str) -> Option<Arc<QueryState>> {
        self.read().get_query(query_id)
    }

    /// A query with its documents.
    pub fn resolve_query(&self, query_id: &str) -> Option<ResolvedQuery> {
        self.read().resolve_query(query_id, &self.store)
    }

    pub fn remove_query(&self, query_id: &str) -> Option<Arc<QueryState>> {
        self.write().remove_query(query_id)
    }
}

impl SchedulerHooks for QueryClient {
    fn on_sync(&self, updates: &DoctypeUpdates) {
        self.apply_sync(updates);
    }

    fn on_error(&self, error: &SyncError) {
        warn!(error = %error, "Replication stopped");
    }
}

/// Tag documents that lack a doctype with `doctype`.
fn with_doctype(documents: Vec<Document>, doctype: &str) -> Vec<Document> {
    documents
        .into_iter()
        .map(|doc| match doc.doctype() {
            Some(_) => doc,
            None => doc.set("_type", doctype),
        })
        .collect()
}

fn by_doctype(documents: Vec<Document>) -> BTreeMap<String, Vec<Document>> {
    let mut groups: BTreeMap<String, Vec<Document>> = BTreeMap::new();
    for doc in documents {
        match doc.doctype() {
            Some(doctype) => groups.entry(doctype.to_string()).or_default().push(doc),
            None => trace!("Mutation document without doctype, not stored"),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FetchData, FetchStatus};
    use serde_json::json;

    const NOTES: &str = "io.cozy.notes";

    fn note(id: &str, status: &str, rev: &str) -> Document {
        Document::with_id(NOTES, id)
            .set("status", status)
            .set("_rev", rev)
    }

    fn client_with_queries() -> QueryClient {
        let client = QueryClient::new();
        client
            .register_query(
                "open",
                QueryDefinition::new(NOTES).with_selector(json!({"status": "open"})),
            )
            .unwrap();
        client
            .register_query(
                "done",
                QueryDefinition::new(NOTES).with_selector(json!({"status": "done"})),
            )
            .unwrap();
        client
    }

    fn ids(client: &QueryClient, query_id: &str) -> Vec<String> {
        client.get_query(query_id).unwrap().data.clone()
    }

    #[test]
    fn test_fetch_result_updates_other_queries() {
        let client = client_with_queries();
        let response = FetchResponse::page(vec![note("n1", "open", "1"), note("n2", "done", "1")], 0);

        let updated = client.receive_fetch_result("open", &response).unwrap();

        assert_eq!(updated, vec!["open".to_string(), "done".to_string()]);
        assert_eq!(ids(&client, "done"), vec!["n2"]);
        assert_eq!(client.store().len(NOTES), 2);
    }

    #[test]
    fn test_refetch_of_stored_documents_leaves_other_queries() {
        let client = client_with_queries();
        let response = FetchResponse::page(vec![note("n1", "open", "1"), note("n2", "done", "1")], 0);
        client.receive_fetch_result("open", &response).unwrap();
        let done = client.get_query("done").unwrap();

        let refetch = FetchResponse::page(vec![note("n1", "open", "1"), note("n2", "done", "1")], 0);
        let updated = client.receive_fetch_result("open", &refetch).unwrap();

        assert_eq!(updated, vec!["open".to_string()]);
        assert!(Arc::ptr_eq(&done, &client.get_query("done").unwrap()));
    }

    #[test]
    fn test_fetch_result_for_unknown_query() {
        let client = QueryClient::new();
        let res = client.receive_fetch_result("nope", &FetchResponse::page(Vec::new(), 0));
        assert!(matches!(res, Err(SyncError::UnknownQuery(_))));
    }

    #[test]
    fn test_fetch_documents_without_doctype_are_tagged() {
        let client = client_with_queries();
        let untagged = Document::from_value(json!({"_id": "n3", "status": "done", "_rev": "1"})).unwrap();
        client
            .receive_fetch_result("open", &FetchResponse::page(vec![untagged], 0))
            .unwrap();

        assert_eq!(ids(&client, "done"), vec!["n3"]);
        assert_eq!(client.store().get(NOTES, "n3").unwrap().doctype(), Some(NOTES));
    }

    #[test]
    fn test_sync_moves_document_between_queries() {
        let client = client_with_queries();
        let mut updates = DoctypeUpdates::new();
        updates.insert(NOTES.to_string(), vec![note("n1", "open", "1")]);
        client.apply_sync(&updates);
        assert_eq!(ids(&client, "open"), vec!["n1"]);

        updates.insert(NOTES.to_string(), vec![note("n1", "done", "2")]);
        let updated = client.apply_sync(&updates);

        assert_eq!(updated.len(), 2);
        assert!(ids(&client, "open").is_empty());
        assert_eq!(ids(&client, "done"), vec!["n1"]);
        let resolved = client.resolve_query("done").unwrap();
        assert_eq!(resolved.documents[0].get("status"), Some(&json!("done")));
    }

    #[test]
    fn test_sync_reconciles_every_doctype() {
        let client = client_with_queries();
        client
            .register_query("files", QueryDefinition::new("io.cozy.files"))
            .unwrap();
        let mut updates = DoctypeUpdates::new();
        updates.insert("io.cozy.files".to_string(), vec![Document::with_id("io.cozy.files", "f1")]);
        updates.insert(NOTES.to_string(), vec![note("n1", "open", "1")]);

        let mut updated = client.apply_sync(&updates);
        updated.sort();
        assert_eq!(updated, vec!["files".to_string(), "open".to_string()]);
    }

    #[test]
    fn test_redelivered_sync_changes_nothing() {
        let client = client_with_queries();
        let mut updates = DoctypeUpdates::new();
        updates.insert(NOTES.to_string(), vec![note("n1", "open", "1")]);
        client.apply_sync(&updates);
        let before = client.get_query("open").unwrap();

        assert!(client.apply_sync(&updates).is_empty());
        assert!(Arc::ptr_eq(&before, &client.get_query("open").unwrap()));
    }

    #[test]
    fn test_mutation_is_stored_optimistically() {
        let client = client_with_queries();
        let mutation = MutationResult::with_response(FetchData::One(note("n9", "open", "1")));

        let updated = client.apply_mutation(&mutation);

        assert_eq!(updated, vec!["open".to_string()]);
        assert!(client.store().get(NOTES, "n9").is_some());
    }

    #[test]
    fn test_mutation_manual_updater() {
        let client = client_with_queries();
        let mutation = MutationResult::with_response(FetchData::One(note("n9", "archived", "1")))
            .update_query("open", |current, mutation| {
                let mut docs = current.to_vec();
                docs.extend(mutation.documents());
                docs
            });

        let updated = client.apply_mutation(&mutation);

        assert_eq!(updated, vec!["open".to_string()]);
        assert_eq!(ids(&client, "open"), vec!["n9"]);
        assert!(ids(&client, "done").is_empty());
    }

    #[test]
    fn test_fetch_error_keeps_data() {
        let client = client_with_queries();
        client
            .receive_fetch_result("open", &FetchResponse::page(vec![note("n1", "open", "1")], 0))
            .unwrap();
        client.receive_fetch_error("open", "timeout").unwrap();

        let query = client.get_query("open").unwrap();
        assert_eq!(query.fetch_status, FetchStatus::Failed);
        assert_eq!(query.data, vec!["n1"]);
    }

    #[test]
    fn test_hooks_apply_sync() {
        let client = client_with_queries();
        let mut updates = DoctypeUpdates::new();
        updates.insert(NOTES.to_string(), vec![note("n1", "done", "1")]);

        let hooks: &dyn SchedulerHooks = &client;
        hooks.on_sync(&updates);
        hooks.on_error(&SyncError::Cancelled);
        assert_eq!(ids(&client, "done"), vec!["n1"]);
    }
}
