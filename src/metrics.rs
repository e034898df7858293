// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Replication cycles and per-doctype replication
//! - Bulk load pages
//! - Warm-up and compaction
//! - Query cache reconciliation
//! - Flag store retries
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `docsync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed by this crate; without one every call is a
//! no-op.

use metrics::{counter, histogram};
use std::time::Duration;

/// Record the outcome of a replication iteration
/// (`completed`, `failed`, `offline`).
pub fn record_replication_cycle(outcome: &'static str) {
    counter!("docsync_replication_cycles_total", "outcome" => outcome).increment(1);
}

/// Record the duration of a whole replication iteration.
pub fn record_replication_cycle_duration(duration: Duration) {
    histogram!("docsync_replication_cycle_duration_seconds").record(duration.as_secs_f64());
}

/// Record one doctype's replication (`bulk` or `incremental`).
pub fn record_doctype_replication(doctype: &str, mode: &'static str, docs: usize, duration: Duration) {
    counter!("docsync_docs_replicated_total", "doctype" => doctype.to_string(), "mode" => mode)
        .increment(docs as u64);
    histogram!("docsync_replication_duration_seconds", "doctype" => doctype.to_string(), "mode" => mode)
        .record(duration.as_secs_f64());
}

/// Record a doctype replication failure.
pub fn record_replication_failure(doctype: &str) {
    counter!("docsync_replication_failures_total", "doctype" => doctype.to_string()).increment(1);
}

/// Record a page of the bulk initial load.
pub fn record_bulk_page(doctype: &str, docs: usize) {
    counter!("docsync_bulk_pages_total", "doctype" => doctype.to_string()).increment(1);
    histogram!("docsync_bulk_page_docs", "doctype" => doctype.to_string()).record(docs as f64);
}

/// Record a warm-up run.
pub fn record_warmup(doctype: &str, success: bool, queries: usize) {
    let status = if success { "success" } else { "failure" };
    counter!("docsync_warmups_total", "doctype" => doctype.to_string(), "status" => status).increment(1);
    if success {
        counter!("docsync_warmup_queries_total", "doctype" => doctype.to_string())
            .increment(queries as u64);
    }
}

/// Record a compaction.
pub fn record_compaction(doctype: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("docsync_compactions_total", "doctype" => doctype.to_string(), "status" => status).increment(1);
    histogram!("docsync_compaction_duration_seconds").record(duration.as_secs_f64());
}

/// Record queries changed by a reconciliation (`documents` or `manual`).
pub fn record_queries_reconciled(source: &'static str, queries: usize) {
    counter!("docsync_query_reconciliations_total", "source" => source).increment(1);
    counter!("docsync_queries_updated_total", "source" => source).increment(queries as u64);
}

/// Record a periodic task run.
pub fn record_periodic_run(task: &str, duration: Duration) {
    counter!("docsync_periodic_runs_total", "task" => task.to_string()).increment(1);
    histogram!("docsync_periodic_run_duration_seconds", "task" => task.to_string())
        .record(duration.as_secs_f64());
}

/// Record a flag store SQLite busy retry.
pub fn record_flag_store_retry(operation: &str) {
    counter!("docsync_flag_store_retries_total", "operation" => operation.to_string()).increment(1);
}
