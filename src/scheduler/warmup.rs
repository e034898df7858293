// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Warm-up of a doctype's configured queries.
//!
//! Runs at most once per process for each doctype, and not at all when a
//! previous process persisted an entry for it. A failure forgets the
//! doctype's progress so the next successful replication tries again.

use super::types::QueryExecutor;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::query::QueryDefinition;
use crate::state::ReplicationStateStore;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Warm up a doctype. Never fails; errors are logged.
#[instrument(skip_all, fields(doctype = %doctype, queries = queries.len()))]
pub(super) async fn warmup_doctype(
    doctype: &str,
    queries: &[QueryDefinition],
    executor: &dyn QueryExecutor,
    state: &ReplicationStateStore,
) {
    if queries.is_empty() {
        return;
    }
    if !state.begin_warmup(doctype).await {
        debug!("Warm-up already done or in progress");
        return;
    }

    let start = Instant::now();
    match run(doctype, queries, executor).await {
        Ok((executed, aliases)) => match state.set_warmed_up(doctype, aliases).await {
            Ok(()) => {
                metrics::record_warmup(doctype, true, executed);
                info!(
                    executed,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Warm-up complete"
                );
            }
            Err(e) => fail(doctype, state, &e).await,
        },
        Err(e) => fail(doctype, state, &e).await,
    }
}

async fn run(
    doctype: &str,
    queries: &[QueryDefinition],
    executor: &dyn QueryExecutor,
) -> Result<(usize, BTreeSet<String>)> {
    let mut seen = BTreeSet::new();
    // One execution per alias
    let pending: Vec<&QueryDefinition> = queries
        .iter()
        .filter(|q| q.alias.as_ref().is_some_and(|a| seen.insert(a.clone())))
        .collect();

    let mut aliases = BTreeSet::new();
    let results = join_all(pending.iter().map(|q| executor.execute(q))).await;
    for (query, result) in pending.iter().zip(results) {
        let alias = query.alias.clone().unwrap_or_default();
        result.map_err(|e| SyncError::Warmup {
            doctype: doctype.to_string(),
            message: format!("query {}: {}", alias, e),
        })?;
        aliases.insert(alias);
    }
    Ok((pending.len(), aliases))
}

async fn fail(doctype: &str, state: &ReplicationStateStore, error: &SyncError) {
    warn!(error = %error, "Warm-up failed, will retry after next replication");
    metrics::record_warmup(doctype, false, 0);
    if let Err(e) = state.clear_warmed_up(doctype).await {
        warn!(error = %e, "Failed to clear warm-up progress");
    }
}
