// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scheduler state and collaborator traits.
//!
//! # State Transitions
//!
//! ```text
//!              start_loop()
//! Idle ─────────────────────────→ Running
//!  ↑  ↑                             │  │
//!  │  │ stop_loop() / failure       │  │ Offline / Pause signal
//!  │  └─────────────────────────────┘  ↓
//!  │                               Suspended
//!  │          stop_loop()              │
//!  └───────────────────────────────────┘
//!             (Online / Resume → start_loop() → Running)
//! ```
//!
//! # State Descriptions
//!
//! - **Idle**: No replication loop. Initial state, and the state after a
//!   replication failure (restart is the owner's decision).
//! - **Running**: The loop replicates every doctype, then waits.
//! - **Suspended**: The loop was stopped by a lifecycle signal and will be
//!   restarted by the matching one.

use crate::document::Document;
use crate::error::{BoxFuture, SyncError};
use crate::query::QueryDefinition;
use std::collections::BTreeMap;

/// Replication scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Suspended,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "Idle"),
            SchedulerState::Running => write!(f, "Running"),
            SchedulerState::Suspended => write!(f, "Suspended"),
        }
    }
}

/// Documents changed by a replication iteration, per doctype.
pub type DoctypeUpdates = BTreeMap<String, Vec<Document>>;

/// Result of one replication iteration.
#[derive(Debug)]
pub enum ReplicationOutcome {
    /// The device is offline; nothing was done.
    Offline,
    /// Every doctype replicated.
    Completed(DoctypeUpdates),
    /// A doctype failed; the loop was stopped.
    Failed(SyncError),
}

impl ReplicationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ReplicationOutcome::Completed(_))
    }

    /// Label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ReplicationOutcome::Offline => "offline",
            ReplicationOutcome::Completed(_) => "completed",
            ReplicationOutcome::Failed(_) => "failed",
        }
    }
}

/// Host lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// Network came back: start the loop.
    Online,
    /// Network lost: suspend the loop.
    Offline,
    /// App sent to background (mobile only): suspend the loop.
    Pause,
    /// App back to foreground (mobile only): start the loop.
    Resume,
}

/// Callbacks fired at the end of each replication iteration.
pub trait SchedulerHooks: Send + Sync + 'static {
    /// Every doctype replicated.
    fn on_sync(&self, _updates: &DoctypeUpdates) {}

    /// A doctype failed; the loop is already stopped.
    fn on_error(&self, _error: &SyncError) {}
}

/// Executes a warm-up query (typically: fetch it into the query cache).
pub trait QueryExecutor: Send + Sync + 'static {
    fn execute(&self, query: &QueryDefinition) -> BoxFuture<'_, ()>;
}

/// Network availability probe.
pub trait Connectivity: Send + Sync + 'static {
    fn is_online(&self) -> bool;
}

/// Replication progress observer, for debugging tools.
///
/// All methods default to no-ops.
pub trait Diagnostics: Send + Sync + 'static {
    fn replication_started(&self, _doctype: &str, _initial: bool) {}

    fn replication_finished(&self, _doctype: &str, _docs: usize) {}

    fn bulk_page_loaded(&self, _doctype: &str, _page: usize, _docs: usize) {}
}

/// Hooks that ignore everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SchedulerHooks for NoopHooks {}

/// Executor that does nothing and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExecutor;

impl QueryExecutor for NoopExecutor {
    fn execute(&self, _query: &QueryDefinition) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Connectivity probe that always reports online.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiagnostics;

impl Diagnostics for NoopDiagnostics {}
