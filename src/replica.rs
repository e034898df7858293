// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local replica seam.
//!
//! A [`LocalReplica`] is one local database (one per doctype) able to
//! replicate with its remote counterpart. The scheduler only needs:
//!
//! 1. Existence check (`info`)
//! 2. Raw batch insert for the initial bulk load (`bulk_insert`)
//! 3. Native incremental replication (`replicate`), reported through a
//!    [`ReplicationHandle`] event channel
//! 4. Maintenance (`compact`, `destroy`)
//!
//! [`MemoryReplica`] implements it in memory. Its incremental replication
//! delivers changes queued with [`MemoryReplica::queue_remote_changes`].

use crate::document::Document;
use crate::error::{BoxFuture, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, debug_span, Instrument};

/// Channel capacity of a replication handle.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Direction of a native replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicationStrategy {
    /// Pull only.
    FromRemote,
    /// Push only.
    ToRemote,
    /// Pull and push.
    #[default]
    Sync,
}

impl std::fmt::Display for ReplicationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FromRemote => write!(f, "fromRemote"),
            Self::ToRemote => write!(f, "toRemote"),
            Self::Sync => write!(f, "sync"),
        }
    }
}

/// Local database metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub db_name: String,
    pub doc_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_seq: Option<String>,
}

/// Parameters of a native replication.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationRequest {
    pub strategy: ReplicationStrategy,
    pub batch_size: usize,
    /// Resume point in the remote changes feed.
    pub since: Option<String>,
    /// Skip `_design/` documents.
    pub exclude_design_docs: bool,
}

/// Summary sent when a replication completes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplicationSummary {
    pub docs_read: usize,
    pub docs_written: usize,
    pub last_seq: Option<String>,
}

/// Progress of a native replication.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    /// A batch of documents changed locally.
    Change(Vec<Document>),
    /// Replication finished.
    Complete(ReplicationSummary),
    /// Replication failed.
    Error(String),
}

/// Consumer side of a running replication.
pub struct ReplicationHandle {
    events: mpsc::Receiver<ReplicationEvent>,
    cancel_tx: watch::Sender<bool>,
}

/// Producer side of a running replication.
pub struct ReplicationSender {
    events: mpsc::Sender<ReplicationEvent>,
    cancel_rx: watch::Receiver<bool>,
}

impl ReplicationHandle {
    /// Create a connected handle / sender pair.
    pub fn channel() -> (ReplicationHandle, ReplicationSender) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (
            ReplicationHandle {
                events: events_rx,
                cancel_tx,
            },
            ReplicationSender {
                events: events_tx,
                cancel_rx,
            },
        )
    }

    /// Next event, or `None` once the producer is gone.
    pub async fn next_event(&mut self) -> Option<ReplicationEvent> {
        self.events.recv().await
    }

    /// Ask the producer to stop.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

impl ReplicationSender {
    /// Send an event. Returns `false` if the consumer is gone.
    pub async fn send(&self, event: ReplicationEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }
}

/// A local database replicating with a remote one.
pub trait LocalReplica: Send + Sync + 'static {
    /// Database name.
    fn name(&self) -> &str;

    /// Metadata; creates the database if needed.
    fn info(&self) -> BoxFuture<'_, ReplicaInfo>;

    /// Insert documents as-is. With `no_revision_negotiation` the
    /// documents overwrite whatever is stored. Returns how many were
    /// written.
    fn bulk_insert(&self, documents: Vec<Document>, no_revision_negotiation: bool)
        -> BoxFuture<'_, usize>;

    /// Start a native replication with the remote database at `url`.
    fn replicate(&self, url: &str, request: ReplicationRequest) -> BoxFuture<'_, ReplicationHandle>;

    fn compact(&self) -> BoxFuture<'_, ()>;

    /// Delete the database and all its documents.
    fn destroy(&self) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Default)]
struct MemoryContents {
    documents: HashMap<String, Document>,
    update_seq: u64,
    remote_changes: Vec<Document>,
}

/// In-memory local replica.
pub struct MemoryReplica {
    name: String,
    contents: Arc<RwLock<MemoryContents>>,
    destroyed: AtomicBool,
}

impl MemoryReplica {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: Arc::new(RwLock::new(MemoryContents::default())),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Queue documents the next incremental replication will pull.
    pub async fn queue_remote_changes(&self, documents: Vec<Document>) {
        self.contents.write().await.remote_changes.extend(documents);
    }

    pub async fn get(&self, id: &str) -> Option<Document> {
        self.contents.read().await.documents.get(id).cloned()
    }

    pub async fn doc_count(&self) -> usize {
        self.contents.read().await.documents.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Insert into the contents, honoring revision negotiation.
fn apply(contents: &mut MemoryContents, documents: Vec<Document>, force: bool) -> usize {
    let mut written = 0;
    for doc in documents {
        let Some(id) = doc.id().map(str::to_string) else {
            continue;
        };
        if !force {
            if let Some(existing) = contents.documents.get(&id) {
                if existing.rev().is_some() && existing.rev() == doc.rev() {
                    continue;
                }
            }
        }
        contents.documents.insert(id, doc);
        contents.update_seq += 1;
        written += 1;
    }
    written
}

impl LocalReplica for MemoryReplica {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> BoxFuture<'_, ReplicaInfo> {
        Box::pin(async move {
            self.destroyed.store(false, Ordering::SeqCst);
            let contents = self.contents.read().await;
            Ok(ReplicaInfo {
                db_name: self.name.clone(),
                doc_count: contents.documents.len(),
                update_seq: Some(contents.update_seq.to_string()),
            })
        })
    }

    fn bulk_insert(
        &self,
        documents: Vec<Document>,
        no_revision_negotiation: bool,
    ) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            if self.is_destroyed() {
                return Err(SyncError::Internal(format!("{} was destroyed", self.name)));
            }
            let mut contents = self.contents.write().await;
            Ok(apply(&mut contents, documents, no_revision_negotiation))
        })
    }

    fn replicate(&self, url: &str, request: ReplicationRequest) -> BoxFuture<'_, ReplicationHandle> {
        let url = url.to_string();
        let span = debug_span!("replicate", db = %self.name, strategy = %request.strategy);
        let (handle, sender) = ReplicationHandle::channel();
        let contents = Arc::clone(&self.contents);
        let name = self.name.clone();

        let task = async move {
            // Push-only replications leave queued remote changes for a later pull
            let pulled: Vec<Document> = if request.strategy == ReplicationStrategy::ToRemote {
                Vec::new()
            } else {
                std::mem::take(&mut contents.write().await.remote_changes)
                    .into_iter()
                    .filter(|d| !(request.exclude_design_docs && d.is_design()))
                    .collect()
            };

            let mut summary = ReplicationSummary::default();
            for chunk in pulled.chunks(request.batch_size.max(1)) {
                if sender.is_cancelled() {
                    let _ = sender.send(ReplicationEvent::Error("cancelled".to_string())).await;
                    return;
                }
                let written = apply(&mut *contents.write().await, chunk.to_vec(), false);
                summary.docs_read += chunk.len();
                summary.docs_written += written;
                if !sender.send(ReplicationEvent::Change(chunk.to_vec())).await {
                    return;
                }
            }

            summary.last_seq = Some(contents.read().await.update_seq.to_string());
            debug!(db = %name, url = %url, docs_read = summary.docs_read, "Memory replication complete");
            let _ = sender.send(ReplicationEvent::Complete(summary)).await;
        };

        Box::pin(async move {
            tokio::spawn(task.instrument(span));
            Ok(handle)
        })
    }

    fn compact(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn destroy(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut contents = self.contents.write().await;
            *contents = MemoryContents::default();
            self.destroyed.store(true, Ordering::SeqCst);
            debug!(db = %self.name, "Replica destroyed");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILES: &str = "io.cozy.files";

    fn request(strategy: ReplicationStrategy) -> ReplicationRequest {
        ReplicationRequest {
            strategy,
            batch_size: 2,
            since: None,
            exclude_design_docs: true,
        }
    }

    async fn drain(mut handle: ReplicationHandle) -> Vec<ReplicationEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_strategy_serde() {
        let s: ReplicationStrategy = serde_json::from_str("\"fromRemote\"").unwrap();
        assert_eq!(s, ReplicationStrategy::FromRemote);
        assert_eq!(ReplicationStrategy::default(), ReplicationStrategy::Sync);
        assert_eq!(ReplicationStrategy::ToRemote.to_string(), "toRemote");
    }

    #[tokio::test]
    async fn test_info_reports_count() {
        let replica = MemoryReplica::new("app_io.cozy.files");
        replica
            .bulk_insert(vec![Document::with_id(FILES, "a")], true)
            .await
            .unwrap();
        let info = replica.info().await.unwrap();
        assert_eq!(info.db_name, "app_io.cozy.files");
        assert_eq!(info.doc_count, 1);
    }

    #[tokio::test]
    async fn test_bulk_insert_revision_negotiation() {
        let replica = MemoryReplica::new("db");
        let doc = Document::with_id(FILES, "a").set("_rev", "1-x");
        assert_eq!(replica.bulk_insert(vec![doc.clone()], false).await.unwrap(), 1);
        assert_eq!(replica.bulk_insert(vec![doc.clone()], false).await.unwrap(), 0);
        assert_eq!(replica.bulk_insert(vec![doc], true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replicate_delivers_queued_changes_in_batches() {
        let replica = MemoryReplica::new("db");
        replica
            .queue_remote_changes(vec![
                Document::with_id(FILES, "a"),
                Document::with_id(FILES, "_design/views"),
                Document::with_id(FILES, "b"),
                Document::with_id(FILES, "c"),
            ])
            .await;

        let handle = replica
            .replicate("https://remote/db", request(ReplicationStrategy::Sync))
            .await
            .unwrap();
        let events = drain(handle).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ReplicationEvent::Change(docs) if docs.len() == 2));
        assert!(matches!(&events[1], ReplicationEvent::Change(docs) if docs.len() == 1));
        assert!(matches!(&events[2], ReplicationEvent::Complete(s) if s.docs_read == 3));
        assert_eq!(replica.doc_count().await, 3);
        assert!(replica.get("_design/views").await.is_none());
    }

    #[tokio::test]
    async fn test_push_only_pulls_nothing() {
        let replica = MemoryReplica::new("db");
        replica.queue_remote_changes(vec![Document::with_id(FILES, "a")]).await;
        let handle = replica
            .replicate("https://remote/db", request(ReplicationStrategy::ToRemote))
            .await
            .unwrap();
        let events = drain(handle).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ReplicationEvent::Complete(_)));
        assert!(replica.get("a").await.is_none());

        // Queued changes are still pulled by the next two-way replication
        let handle = replica
            .replicate("https://remote/db", request(ReplicationStrategy::Sync))
            .await
            .unwrap();
        let events = drain(handle).await;
        assert!(matches!(&events[0], ReplicationEvent::Change(docs) if docs.len() == 1));
        assert!(replica.get("a").await.is_some());
    }

    #[tokio::test]
    async fn test_destroy_clears_documents() {
        let replica = MemoryReplica::new("db");
        replica.bulk_insert(vec![Document::with_id(FILES, "a")], true).await.unwrap();
        replica.destroy().await.unwrap();
        assert!(replica.is_destroyed());
        assert_eq!(replica.doc_count().await, 0);
        assert!(replica.bulk_insert(vec![Document::with_id(FILES, "a")], true).await.is_err());

        // info() recreates it
        replica.info().await.unwrap();
        assert!(!replica.is_destroyed());
    }
}
