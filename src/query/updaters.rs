// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental query updaters.
//!
//! Each updater takes one query state and returns `Some(new_state)` when
//! the query changed, or `None` to keep the current `Arc` untouched.
//!
//! # Automatic Update
//!
//! ```text
//! changed docs ──┬──▶ matched   ──┬─▶ to_add    = matched \ original
//!                │                └─▶ to_update = original ∩ matched (new revision)
//!                └──▶ unmatched ────▶ to_remove = original ∩ unmatched
//!
//! data = (original ∪ to_add) \ to_remove
//! ```

use super::types::{ManualUpdater, MutationResult, QueryState};
use chrono::{DateTime, Utc};
use crate::document::Document;
use std::collections::HashSet;
use std::sync::Arc;

/// Id sets computed by an automatic update.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MembershipDiff {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
    pub to_update: Vec<String>,
}

impl MembershipDiff {
    /// Whether the diff changes anything.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.to_update.is_empty()
    }
}

/// Compute the membership diff of a query against changed documents.
pub fn diff_membership(query: &QueryState, changed: &[Document]) -> MembershipDiff {
    let original: HashSet<&str> = query.data.iter().map(String::as_str).collect();
    let mut diff = MembershipDiff::default();
    let mut seen_add: HashSet<&str> = HashSet::new();

    for doc in changed {
        let Some(id) = doc.id() else { continue };
        let present = original.contains(id);

        if query.is_fulfilled_by(doc) {
            if !present {
                if seen_add.insert(id) {
                    diff.to_add.push(id.to_string());
                }
            } else if !query.has_seen(doc) && !diff.to_update.iter().any(|u| u == id) {
                diff.to_update.push(id.to_string());
            }
        } else if present && !diff.to_remove.iter().any(|r| r == id) {
            diff.to_remove.push(id.to_string());
        }
    }

    diff
}

/// Automatic update driven by newly seen documents.
///
/// Skipped when there are no documents, when the first document's doctype
/// is not the query's, or when the query has no automatic filter.
pub fn auto_update(
    query: &Arc<QueryState>,
    changed: &[Document],
    now: DateTime<Utc>,
) -> Option<QueryState> {
    let first = changed.first()?;
    if first.doctype() != Some(query.doctype()) {
        return None;
    }
    if !query.filter.is_automatic() {
        return None;
    }

    let diff = diff_membership(query, changed);
    if diff.is_empty() {
        return None;
    }

    let removed: HashSet<&str> = diff.to_remove.iter().map(String::as_str).collect();
    let data: Vec<String> = query
        .data
        .iter()
        .chain(diff.to_add.iter())
        .filter(|id| !removed.contains(id.as_str()))
        .cloned()
        .collect();

    let mut next = QueryState::clone(query);
    next.count = data.len();
    next.data = data;
    next.last_update = Some(now);

    let touched: Vec<Document> = changed
        .iter()
        .filter(|doc| query.is_fulfilled_by(doc))
        .cloned()
        .collect();
    next.remember(&touched);

    Some(next)
}

/// Manual update: the caller's updater decides the new documents.
///
/// `current` are the query's documents as currently materialized.
pub fn manual_update(
    query: &Arc<QueryState>,
    updater: &ManualUpdater,
    current: &[Document],
    mutation: &MutationResult,
    now: DateTime<Utc>,
) -> QueryState {
    let documents = updater(current, mutation);
    let data: Vec<String> = documents
        .iter()
        .filter_map(|doc| doc.id().map(str::to_string))
        .collect();

    let mut next = QueryState::clone(query);
    next.count = data.len();
    next.data = data;
    next.last_update = Some(now);
    next.remember(&documents);
    next
}
