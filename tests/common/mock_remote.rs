//! Mock RemoteSource for testing.
//!
//! Serves each doctype's documents as a sorted `_all_docs` listing and
//! records every listing request for assertions. Can be told to fail or to
//! slow down each page.

use docsync_engine::error::{BoxFuture, SyncError};
use docsync_engine::remote::{AllDocsPage, AllDocsQuery, AllDocsRow, RemoteSource};
use docsync_engine::Document;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// A recorded all_docs() call.
#[derive(Debug, Clone)]
pub struct ListingCall {
    pub doctype: String,
    pub query: AllDocsQuery,
}

/// In-memory remote that records all listing calls.
#[derive(Default)]
pub struct MockRemote {
    /// doctype -> id -> document
    documents: RwLock<BTreeMap<String, BTreeMap<String, Document>>>,
    listings: RwLock<Vec<ListingCall>>,
    sequences: RwLock<BTreeMap<String, String>>,
    fail_listing: AtomicBool,
    page_delay: RwLock<Option<Duration>>,
}

#[allow(dead_code)]
impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, doctype: &str, docs: Vec<Document>) {
        let mut all = self.documents.write().await;
        let entry = all.entry(doctype.to_string()).or_default();
        for doc in docs {
            if let Some(id) = doc.id() {
                entry.insert(id.to_string(), doc);
            }
        }
    }

    pub async fn set_last_sequence(&self, doctype: &str, seq: &str) {
        self.sequences
            .write()
            .await
            .insert(doctype.to_string(), seq.to_string());
    }

    /// Make every listing request fail.
    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Delay every page by `delay`.
    pub async fn set_page_delay(&self, delay: Duration) {
        *self.page_delay.write().await = Some(delay);
    }

    pub async fn listings(&self) -> Vec<ListingCall> {
        self.listings.read().await.clone()
    }

    pub async fn listing_count(&self, doctype: &str) -> usize {
        self.listings
            .read()
            .await
            .iter()
            .filter(|c| c.doctype == doctype)
            .count()
    }
}

impl RemoteSource for MockRemote {
    fn replication_url(&self, doctype: &str) -> String {
        format!("memory://remote/{}", doctype)
    }

    fn all_docs(&self, doctype: &str, query: AllDocsQuery) -> BoxFuture<'_, AllDocsPage> {
        let doctype = doctype.to_string();
        Box::pin(async move {
            self.listings.write().await.push(ListingCall {
                doctype: doctype.clone(),
                query: query.clone(),
            });

            let delay = *self.page_delay.read().await;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(SyncError::remote_msg("all_docs", "HTTP 503 - unavailable"));
            }

            let all = self.documents.read().await;
            let docs = all.get(&doctype).cloned().unwrap_or_default();
            let start = query.startkey_docid.unwrap_or_default();
            let rows = docs
                .range(start..)
                .take(query.limit)
                .map(|(id, doc)| AllDocsRow {
                    id: id.clone(),
                    doc: query.include_docs.then(|| doc.clone()),
                })
                .collect();

            Ok(AllDocsPage {
                total_rows: Some(docs.len()),
                rows,
            })
        })
    }

    fn last_sequence(&self, doctype: &str) -> BoxFuture<'_, Option<String>> {
        let doctype = doctype.to_string();
        Box::pin(async move { Ok(self.sequences.read().await.get(&doctype).cloned()) })
    }
}
