// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the query cache and replication scheduler.
//!
//! Errors are categorized by what they stop. Some only fail the call that
//! produced them, some are recorded on a query and the query stays usable,
//! and replication errors stop the replication loop until its owner
//! restarts it.
//!
//! # Error Categories
//!
//! | Error Type | Stops loop | Description |
//! |------------|------------|-------------|
//! | `InvalidDefinition` | No | Query registered without a doctype |
//! | `UnknownQuery` | No | Result or error delivered for an unregistered query |
//! | `FetchFailure` | No | Fetch failed, recorded on the query (stale data kept) |
//! | `Replication` | Yes | Local replica reported a replication error |
//! | `Remote` | Yes | Remote listing / changes feed unreachable or malformed |
//! | `Warmup` | No | Warm-up query failed (progress cleared, retried later) |
//! | `FlagStore` | No | SQLite flag persistence failed |
//! | `Serialization` | No | Persisted flag could not be encoded/decoded |
//! | `Config` | No | Configuration invalid |
//! | `Cancelled` | Yes | Replication cancelled cooperatively |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Restart Behavior
//!
//! There is no automatic retry for replication failures. Use
//! [`SyncError::is_loop_fatal()`] to check whether an error stopped the
//! loop; restarting it with `start_loop()` is the owner's decision.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Boxed async result, used by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors raised by the query cache, the document store facade and the
/// replication scheduler.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Query definition is missing required fields.
    ///
    /// Fatal to the `init_query` call only.
    #[error("Invalid query definition: {0}")]
    InvalidDefinition(String),

    /// No query is registered under this id.
    #[error("Unknown query: {0}")]
    UnknownQuery(String),

    /// A fetch for a query failed.
    ///
    /// The query keeps its previous `data` and is marked failed.
    #[error("Fetch failed for query {query_id}: {message}")]
    FetchFailure { query_id: String, message: String },

    /// Replication of a doctype failed.
    ///
    /// Stops the replication loop; surfaced through `SchedulerHooks::on_error`.
    #[error("Replication error ({doctype}): {message}")]
    Replication { doctype: String, message: String },

    /// Remote source request failed.
    #[error("Remote error ({operation}): {message}")]
    Remote {
        operation: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Warm-up of a doctype's queries failed.
    ///
    /// Never propagated out of the scheduler; the doctype's warm-up
    /// progress is cleared so it runs again on the next replication.
    #[error("Warm-up error ({doctype}): {message}")]
    Warmup { doctype: String, message: String },

    /// SQLite error during flag persistence.
    #[error("Flag store error: {0}")]
    FlagStore(#[from] sqlx::Error),

    /// Persisted flag could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Replication was cancelled before it completed.
    #[error("Replication cancelled")]
    Cancelled,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a remote error from a reqwest::Error
    pub fn remote(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Remote {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a remote error without source
    pub fn remote_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a replication error for a doctype
    pub fn replication(doctype: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Replication {
            doctype: doctype.into(),
            message: message.into(),
        }
    }

    /// Check if this error stops the replication loop
    pub fn is_loop_fatal(&self) -> bool {
        match self {
            Self::Replication { .. } => true,
            Self::Remote { .. } => true,
            Self::Cancelled => true,
            Self::InvalidDefinition(_) => false,
            Self::UnknownQuery(_) => false,
            Self::FetchFailure { .. } => false, // Recorded on the query
            Self::Warmup { .. } => false,       // Swallowed by the scheduler
            Self::FlagStore(_) => false,
            Self::Serialization(_) => false,
            Self::Config(_) => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        Self::remote("unknown", e)
    }
}
