//! Recording collaborators.
//!
//! Each records its calls for assertions. Hooks and diagnostics are
//! synchronous callbacks, so they record behind a std mutex.

use docsync_engine::error::{BoxFuture, SyncError};
use docsync_engine::flags::{FlagStore, MemoryFlagStore};
use docsync_engine::scheduler::{Connectivity, Diagnostics, DoctypeUpdates, QueryExecutor, SchedulerHooks};
use docsync_engine::QueryDefinition;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;

/// Hooks that record every sync and error.
#[derive(Default)]
pub struct RecordingHooks {
    syncs: Mutex<Vec<DoctypeUpdates>>,
    errors: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl RecordingHooks {
    pub fn syncs(&self) -> Vec<DoctypeUpdates> {
        self.syncs.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl SchedulerHooks for RecordingHooks {
    fn on_sync(&self, updates: &DoctypeUpdates) {
        self.syncs.lock().unwrap().push(updates.clone());
    }

    fn on_error(&self, error: &SyncError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

/// Warm-up executor recording each executed alias.
#[derive(Default)]
pub struct RecordingExecutor {
    executed: Mutex<Vec<String>>,
    fail: AtomicBool,
}

#[allow(dead_code)]
impl RecordingExecutor {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl QueryExecutor for RecordingExecutor {
    fn execute(&self, query: &QueryDefinition) -> BoxFuture<'_, ()> {
        let alias = query.alias.clone().unwrap_or_default();
        Box::pin(async move {
            self.executed.lock().unwrap().push(alias);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SyncError::Internal("query failed".to_string()));
            }
            Ok(())
        })
    }
}

/// Connectivity probe the test can flip.
pub struct ToggleConnectivity(AtomicBool);

#[allow(dead_code)]
impl ToggleConnectivity {
    pub fn new(online: bool) -> Self {
        Self(AtomicBool::new(online))
    }

    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

impl Connectivity for ToggleConnectivity {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A recorded diagnostics callback.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    Started { doctype: String, initial: bool },
    Finished { doctype: String, docs: usize },
    Page { doctype: String, page: usize, docs: usize },
}

#[derive(Default)]
pub struct RecordingDiagnostics {
    events: Mutex<Vec<DiagnosticEvent>>,
}

#[allow(dead_code)]
impl RecordingDiagnostics {
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn replication_started(&self, doctype: &str, initial: bool) {
        self.events.lock().unwrap().push(DiagnosticEvent::Started {
            doctype: doctype.to_string(),
            initial,
        });
    }

    fn replication_finished(&self, doctype: &str, docs: usize) {
        self.events.lock().unwrap().push(DiagnosticEvent::Finished {
            doctype: doctype.to_string(),
            docs,
        });
    }

    fn bulk_page_loaded(&self, doctype: &str, page: usize, docs: usize) {
        self.events.lock().unwrap().push(DiagnosticEvent::Page {
            doctype: doctype.to_string(),
            page,
            docs,
        });
    }
}

/// Memory flag store counting writes per key.
#[derive(Default)]
pub struct RecordingFlagStore {
    inner: MemoryFlagStore,
    writes: RwLock<HashMap<String, usize>>,
}

#[allow(dead_code)]
impl RecordingFlagStore {
    pub async fn writes(&self, key: &str) -> usize {
        self.writes.read().await.get(key).copied().unwrap_or(0)
    }
}

impl FlagStore for RecordingFlagStore {
    fn get_item(&self, key: &str) -> BoxFuture<'_, Option<String>> {
        self.inner.get_item(key)
    }

    fn set_item(&self, key: &str, value: String) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            *self.writes.write().await.entry(key.clone()).or_default() += 1;
            self.inner.set_item(&key, value).await
        })
    }

    fn remove_item(&self, key: &str) -> BoxFuture<'_, ()> {
        self.inner.remove_item(key)
    }
}
