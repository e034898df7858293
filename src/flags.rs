// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Small key-value flag store.
//!
//! The scheduler persists its replication state (synced doctypes, warmed-up
//! queries, replication sequences) as JSON strings under a handful of keys.
//! Two implementations are provided:
//!
//! - [`MemoryFlagStore`]: process-local, for tests and ephemeral clients
//! - [`SqliteFlagStore`]: SQLite in WAL mode, survives restarts
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when another connection
//! holds the write lock. Writes are retried with exponential backoff (up to
//! 5 attempts). Reads are served from an in-memory cache that only ever
//! holds persisted values.

use crate::config::FlagStoreConfig;
use crate::error::{BoxFuture, Result, SyncError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Key-value persistence consumed by the scheduler.
pub trait FlagStore: Send + Sync + 'static {
    /// Read a value. `None` when unset.
    fn get_item(&self, key: &str) -> BoxFuture<'_, Option<String>>;

    /// Write a value.
    fn set_item(&self, key: &str, value: String) -> BoxFuture<'_, ()>;

    /// Delete a value. Deleting an unset key is not an error.
    fn remove_item(&self, key: &str) -> BoxFuture<'_, ()>;
}

/// Open the flag store described by the configuration.
///
/// SQLite when a path is configured, memory otherwise.
pub async fn open(config: &FlagStoreConfig) -> Result<Arc<dyn FlagStore>> {
    match &config.sqlite_path {
        Some(path) => Ok(Arc::new(SqliteFlagStore::open(path).await?)),
        None => Ok(Arc::new(MemoryFlagStore::new())),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Memory
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local flag store.
#[derive(Debug, Default)]
pub struct MemoryFlagStore {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlagStore for MemoryFlagStore {
    fn get_item(&self, key: &str) -> BoxFuture<'_, Option<String>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.items.read().await.get(&key).cloned()) })
    }

    fn set_item(&self, key: &str, value: String) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            self.items.write().await.insert(key, value);
            Ok(())
        })
    }

    fn remove_item(&self, key: &str) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            self.items.write().await.remove(&key);
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQLite
// ═══════════════════════════════════════════════════════════════════════════════

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_flag_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Flag store backed by SQLite.
///
/// All rows are loaded into memory at open. Writes go to disk first and
/// reach the cache only once persisted.
pub struct SqliteFlagStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<String, String>>,
    path: String,
}

impl SqliteFlagStore {
    /// Open (or create) the flag database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening flag store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flags (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM flags")
            .fetch_all(&pool)
            .await?;
        let cache: HashMap<String, String> = rows.into_iter().collect();

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored flags from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            path: path_str,
        })
    }

    /// Database path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        let pool = &self.pool;
        let checkpoint = execute_with_retry("flags_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await;
        if let Err(e) = checkpoint {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Flag store closed");
    }
}

impl FlagStore for SqliteFlagStore {
    fn get_item(&self, key: &str) -> BoxFuture<'_, Option<String>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.cache.read().await.get(&key).cloned()) })
    }

    fn set_item(&self, key: &str, value: String) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            // Held across the write so the cache follows the disk order
            let mut cache = self.cache.write().await;

            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;
            execute_with_retry("flags_set", || async {
                sqlx::query(
                    r#"
                    INSERT INTO flags (key, value, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&key)
                .bind(&value)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;

            debug!(key = %key, "Flag persisted");
            cache.insert(key, value);
            Ok(())
        })
    }

    fn remove_item(&self, key: &str) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let mut cache = self.cache.write().await;

            let pool = &self.pool;
            execute_with_retry("flags_remove", || async {
                sqlx::query("DELETE FROM flags WHERE key = ?")
                    .bind(&key)
                    .execute(pool)
                    .await
            })
            .await?;

            debug!(key = %key, "Flag removed");
            cache.remove(&key);
            Ok(())
        })
    }
}
