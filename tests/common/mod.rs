//! Shared test utilities for the scheduler and client suites.
//!
//! This module provides:
//! - A recording in-memory remote serving `_all_docs` listings
//! - Recording hooks, warm-up executor, diagnostics and flag store
//! - Scheduler construction helpers

pub mod mock_remote;
pub mod recorders;

pub use mock_remote::*;
pub use recorders::*;

use docsync_engine::config::DoctypeReplicationOptions;
use docsync_engine::replica::ReplicationStrategy;
use docsync_engine::{Document, QueryDefinition, SchedulerConfig};

pub const FILES: &str = "io.cozy.files";
pub const NOTES: &str = "io.cozy.notes";

/// Config replicating `doctypes` with the default sync strategy.
pub fn config_for(doctypes: &[&str]) -> SchedulerConfig {
    let mut config = SchedulerConfig::for_testing("test");
    for doctype in doctypes {
        config
            .doctypes
            .insert(doctype.to_string(), DoctypeReplicationOptions::default());
    }
    config
}

/// Set a doctype's strategy.
pub fn with_strategy(mut config: SchedulerConfig, doctype: &str, strategy: ReplicationStrategy) -> SchedulerConfig {
    config.doctypes.entry(doctype.to_string()).or_default().strategy = strategy;
    config
}

/// Set a doctype's warm-up queries, one per alias.
pub fn with_warmup(mut config: SchedulerConfig, doctype: &str, aliases: &[&str]) -> SchedulerConfig {
    config.doctypes.entry(doctype.to_string()).or_default().warmup_queries = aliases
        .iter()
        .map(|alias| QueryDefinition::new(doctype).with_alias(*alias))
        .collect();
    config
}

/// `n` revisioned documents with sortable ids.
pub fn documents(doctype: &str, n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| Document::with_id(doctype, &format!("doc-{:05}", i)).set("_rev", "1-a"))
        .collect()
}

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
