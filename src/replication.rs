// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication of one doctype.
//!
//! Two strategies:
//!
//! - **Bulk initial load** ([`replicate_all_docs`]): on the first sync of a
//!   doctype, page the remote `_all_docs` listing and insert each batch
//!   without revision negotiation. Much cheaper than a native replication,
//!   which would transfer every revision's history.
//! - **Incremental** ([`start_replication`]): the local replica's native
//!   replication, reported through a [`ReplicationHandle`].
//!
//! # Bulk Load Paging
//!
//! ```text
//! page 1: limit=N                      → rows r1..rN        cursor = rN
//! page 2: limit=N, startkey_docid=rN   → rows rN..r2N-1     (rN dropped)
//! ...
//! stop when a page has fewer than N rows, or brings nothing new
//! ```
//!
//! Design documents and tombstones are never inserted nor returned.
//! Cancellation is checked between pages.

use crate::document::{visible_documents, Document};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::remote::{AllDocsQuery, RemoteSource};
use crate::replica::{
    LocalReplica, ReplicationEvent, ReplicationHandle, ReplicationRequest, ReplicationSummary,
};
use crate::scheduler::Diagnostics;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Result of an incremental replication.
#[derive(Debug, Clone, Default)]
pub struct IncrementalOutcome {
    /// Changed documents, deduplicated by id (last revision wins).
    pub documents: Vec<Document>,
    pub summary: ReplicationSummary,
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Load every document of a doctype from the remote listing.
///
/// Returns the inserted documents.
#[instrument(skip_all, fields(doctype = %doctype, batch_size = batch_size))]
pub async fn replicate_all_docs(
    doctype: &str,
    replica: &dyn LocalReplica,
    remote: &dyn RemoteSource,
    batch_size: usize,
    cancel: &watch::Receiver<bool>,
    diagnostics: &dyn Diagnostics,
) -> Result<Vec<Document>> {
    let start = Instant::now();
    // Follow-up pages repeat the cursor row
    let batch_size = batch_size.max(2);
    let mut loaded = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;

    loop {
        if is_cancelled(cancel) {
            info!(pages, docs = loaded.len(), "Bulk load cancelled");
            return Err(SyncError::Cancelled);
        }

        let page = remote
            .all_docs(
                doctype,
                AllDocsQuery {
                    limit: batch_size,
                    include_docs: true,
                    startkey_docid: cursor.clone(),
                },
            )
            .await?;
        pages += 1;
        let row_count = page.rows.len();

        let mut rows = page.rows.into_iter().peekable();
        // A follow-up page starts with the previous page's last row
        if let (Some(previous), Some(first)) = (cursor.as_deref(), rows.peek()) {
            if first.id == previous {
                rows.next();
            }
        }
        let rows: Vec<_> = rows.collect();

        let Some(last) = rows.last() else {
            debug!(pages, "Listing exhausted");
            break;
        };
        cursor = Some(last.id.clone());

        let docs = visible_documents(rows.into_iter().filter_map(|row| row.doc));
        if !docs.is_empty() {
            replica
                .bulk_insert(docs.clone(), true)
                .await
                .map_err(|e| SyncError::replication(doctype, e.to_string()))?;
        }

        debug!(page = pages, rows = row_count, docs = docs.len(), "Bulk page inserted");
        metrics::record_bulk_page(doctype, docs.len());
        diagnostics.bulk_page_loaded(doctype, pages, docs.len());
        loaded.extend(docs);

        if row_count < batch_size {
            break;
        }
    }

    info!(
        pages,
        docs = loaded.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Bulk load complete"
    );
    Ok(loaded)
}

/// Run the replica's native replication to completion.
#[instrument(skip_all, fields(doctype = %doctype, strategy = %request.strategy))]
pub async fn start_replication(
    doctype: &str,
    replica: &dyn LocalReplica,
    url: &str,
    request: ReplicationRequest,
    cancel: &watch::Receiver<bool>,
) -> Result<IncrementalOutcome> {
    if is_cancelled(cancel) {
        return Err(SyncError::Cancelled);
    }

    let start = Instant::now();
    let mut cancel = cancel.clone();
    let mut handle: ReplicationHandle = replica
        .replicate(url, request)
        .await
        .map_err(|e| SyncError::replication(doctype, e.to_string()))?;

    let mut documents: Vec<Document> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            changed = cancel.changed() => {
                if changed.is_err() || is_cancelled(&cancel) {
                    handle.cancel();
                    info!(docs = documents.len(), "Replication cancelled");
                    return Err(SyncError::Cancelled);
                }
            }

            event = handle.next_event() => match event {
                Some(ReplicationEvent::Change(batch)) => {
                    for doc in visible_documents(batch) {
                        let Some(id) = doc.id().map(str::to_string) else { continue };
                        match positions.get(&id) {
                            Some(&pos) => documents[pos] = doc,
                            None => {
                                positions.insert(id, documents.len());
                                documents.push(doc);
                            }
                        }
                    }
                }
                Some(ReplicationEvent::Complete(summary)) => {
                    info!(
                        docs_read = summary.docs_read,
                        docs_written = summary.docs_written,
                        docs = documents.len(),
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Replication complete"
                    );
                    return Ok(IncrementalOutcome { documents, summary });
                }
                Some(ReplicationEvent::Error(message)) => {
                    warn!(error = %message, "Replication failed");
                    return Err(SyncError::replication(doctype, message));
                }
                None => {
                    return Err(SyncError::replication(
                        doctype,
                        "replication ended without completing",
                    ));
                }
            }
        }
    }
}
