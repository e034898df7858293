// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persisted replication state.
//!
//! Three flag keys, each holding JSON:
//!
//! | Key | Value |
//! |-----|-------|
//! | `docsync-synced` | array of synced doctypes |
//! | `docsync-warmedupqueries` | object: doctype → array of aliases |
//! | `docsync-nextreplicationsequence` | object: doctype → sequence |
//!
//! The state is read once when the scheduler is built, then mutated in
//! memory and written through on every change. Older clients stored the
//! synced key as a boolean; anything that is not an array reads as empty.

use crate::error::Result;
use crate::flags::FlagStore;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const SYNCED_KEY: &str = "docsync-synced";
pub const WARMED_UP_KEY: &str = "docsync-warmedupqueries";
pub const SEQUENCE_KEY: &str = "docsync-nextreplicationsequence";

#[derive(Debug, Default)]
struct Snapshot {
    synced: BTreeSet<String>,
    warmed_up: BTreeMap<String, BTreeSet<String>>,
    sequences: BTreeMap<String, String>,
}

/// Replication state of every doctype, backed by a [`FlagStore`].
pub struct ReplicationStateStore {
    flags: Arc<dyn FlagStore>,
    inner: Mutex<Snapshot>,
}

impl ReplicationStateStore {
    /// Load the persisted state.
    ///
    /// Malformed values are logged and read as empty.
    pub async fn load(flags: Arc<dyn FlagStore>) -> Result<Self> {
        let synced = match flags.get_item(SYNCED_KEY).await? {
            Some(raw) => parse_synced(&raw),
            None => BTreeSet::new(),
        };
        let warmed_up = match flags.get_item(WARMED_UP_KEY).await? {
            Some(raw) => parse_or_default(WARMED_UP_KEY, &raw),
            None => BTreeMap::new(),
        };
        let sequences = match flags.get_item(SEQUENCE_KEY).await? {
            Some(raw) => parse_or_default(SEQUENCE_KEY, &raw),
            None => BTreeMap::new(),
        };

        debug!(
            synced = synced.len(),
            warmed_up = warmed_up.len(),
            sequences = sequences.len(),
            "Replication state loaded"
        );

        Ok(Self {
            flags,
            inner: Mutex::new(Snapshot {
                synced,
                warmed_up,
                sequences,
            }),
        })
    }

    pub async fn is_synced(&self, doctype: &str) -> bool {
        self.inner.lock().await.synced.contains(doctype)
    }

    /// Mark a doctype as synced. Returns `false` if it already was.
    pub async fn add_synced(&self, doctype: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.synced.insert(doctype.to_string()) {
            return Ok(false);
        }
        let raw = serde_json::to_string(&inner.synced)?;
        self.flags.set_item(SYNCED_KEY, raw).await?;
        Ok(true)
    }

    pub async fn synced_doctypes(&self) -> Vec<String> {
        self.inner.lock().await.synced.iter().cloned().collect()
    }

    /// Whether warm-up has an entry for this doctype (possibly empty).
    pub async fn has_warmup_entry(&self, doctype: &str) -> bool {
        self.inner.lock().await.warmed_up.contains_key(doctype)
    }

    /// Create an empty in-memory warm-up entry for a doctype. Returns
    /// `false` if one already exists.
    ///
    /// Nothing is persisted until [`set_warmed_up`](Self::set_warmed_up).
    pub async fn begin_warmup(&self, doctype: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.warmed_up.contains_key(doctype) {
            return false;
        }
        inner.warmed_up.insert(doctype.to_string(), BTreeSet::new());
        true
    }

    /// Aliases already warmed up for a doctype.
    pub async fn warmed_up(&self, doctype: &str) -> BTreeSet<String> {
        self.inner
            .lock()
            .await
            .warmed_up
            .get(doctype)
            .cloned()
            .unwrap_or_default()
    }

    /// Record the warmed-up aliases of a doctype.
    pub async fn set_warmed_up(&self, doctype: &str, aliases: BTreeSet<String>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.warmed_up.insert(doctype.to_string(), aliases);
        let raw = serde_json::to_string(&inner.warmed_up)?;
        self.flags.set_item(WARMED_UP_KEY, raw).await
    }

    /// Forget a doctype's warm-up progress.
    pub async fn clear_warmed_up(&self, doctype: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.warmed_up.remove(doctype).is_none() {
            return Ok(());
        }
        let raw = serde_json::to_string(&inner.warmed_up)?;
        self.flags.set_item(WARMED_UP_KEY, raw).await
    }

    /// Sequence to resume incremental replication from.
    pub async fn sequence(&self, doctype: &str) -> Option<String> {
        self.inner.lock().await.sequences.get(doctype).cloned()
    }

    pub async fn set_sequence(&self, doctype: &str, sequence: String) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.sequences.insert(doctype.to_string(), sequence);
        let raw = serde_json::to_string(&inner.sequences)?;
        self.flags.set_item(SEQUENCE_KEY, raw).await
    }

    /// Forget everything, in memory and on disk.
    pub async fn clear_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        *inner = Snapshot::default();
        self.flags.remove_item(SYNCED_KEY).await?;
        self.flags.remove_item(WARMED_UP_KEY).await?;
        self.flags.remove_item(SEQUENCE_KEY).await?;
        debug!("Replication state cleared");
        Ok(())
    }
}

fn parse_synced(raw: &str) -> BTreeSet<String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Ok(_) => {
            debug!(key = SYNCED_KEY, "Legacy synced value, starting from scratch");
            BTreeSet::new()
        }
        Err(e) => {
            warn!(key = SYNCED_KEY, error = %e, "Unreadable synced value, ignoring");
            BTreeSet::new()
        }
    }
}

fn parse_or_default<T: serde::de::DeserializeOwned + Default>(key: &str, raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(key, error = %e, "Unreadable flag value, ignoring");
        T::default()
    })
}
