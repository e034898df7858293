// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication scheduler.
//!
//! Owns one [`LocalReplica`] per doctype and keeps them in sync with the
//! remote on a periodic loop:
//!
//! 1. Skip the iteration when the device is offline
//! 2. Replicate every doctype concurrently: bulk load on first sync,
//!    native incremental replication afterwards
//! 3. Mark each doctype synced, then warm up its queries
//! 4. Report the changed documents through [`SchedulerHooks::on_sync`]
//!
//! Any doctype failure stops the loop and is reported through
//! [`SchedulerHooks::on_error`]. Restarting is the owner's decision.
//!
//! # Lifecycle Signals
//!
//! When built with a [`LifecycleSignal`] broadcast channel, the scheduler
//! listens to it from the first `start_loop()` until `destroy()`:
//!
//! | Signal | Effect |
//! |--------|--------|
//! | `Online` | `start_loop()` |
//! | `Offline` | loop suspended |
//! | `Pause` | loop suspended (mobile apps only) |
//! | `Resume` | `start_loop()` (mobile apps only) |

mod types;
mod warmup;

pub use types::*;

use crate::config::SchedulerConfig;
use crate::document::Document;
use crate::error::{Result, SyncError};
use crate::flags::{self, FlagStore};
use crate::metrics;
use crate::periodic::PeriodicTask;
use crate::remote::{HttpRemote, RemoteSource};
use crate::replica::{LocalReplica, MemoryReplica, ReplicationRequest, ReplicationStrategy};
use crate::replication::{replicate_all_docs, start_replication};
use crate::state::ReplicationStateStore;
use futures::future::join_all;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The replication scheduler. Cheap to clone.
#[derive(Clone)]
pub struct ReplicationScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    replicas: BTreeMap<String, Arc<dyn LocalReplica>>,
    remote: Arc<dyn RemoteSource>,
    state: ReplicationStateStore,

    hooks: Arc<dyn SchedulerHooks>,
    executor: Arc<dyn QueryExecutor>,
    connectivity: Arc<dyn Connectivity>,
    diagnostics: Arc<dyn Diagnostics>,
    signals: Option<broadcast::Sender<LifecycleSignal>>,

    /// Set once every replica answered `info()`
    databases_ready: AtomicBool,

    replication_loop: Mutex<Option<PeriodicTask>>,
    listener: Mutex<Option<JoinHandle<()>>>,

    /// Cancel trigger of the in-flight iteration
    cancel: Mutex<Option<watch::Sender<bool>>>,
    /// Held for the whole of an iteration
    in_flight: tokio::sync::Mutex<()>,

    state_tx: watch::Sender<SchedulerState>,
    state_rx: watch::Receiver<SchedulerState>,
}

/// Builder for [`ReplicationScheduler`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    replicas: BTreeMap<String, Arc<dyn LocalReplica>>,
    remote: Option<Arc<dyn RemoteSource>>,
    flags: Option<Arc<dyn FlagStore>>,
    hooks: Arc<dyn SchedulerHooks>,
    executor: Arc<dyn QueryExecutor>,
    connectivity: Arc<dyn Connectivity>,
    diagnostics: Arc<dyn Diagnostics>,
    signals: Option<broadcast::Sender<LifecycleSignal>>,
}

impl SchedulerBuilder {
    fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            replicas: BTreeMap::new(),
            remote: None,
            flags: None,
            hooks: Arc::new(NoopHooks),
            executor: Arc::new(NoopExecutor),
            connectivity: Arc::new(AlwaysOnline),
            diagnostics: Arc::new(NoopDiagnostics),
            signals: None,
        }
    }

    /// Register the local replica of a doctype.
    ///
    /// It should be opened under [`SchedulerConfig::database_name`].
    pub fn replica(mut self, doctype: impl Into<String>, replica: Arc<dyn LocalReplica>) -> Self {
        self.replicas.insert(doctype.into(), replica);
        self
    }

    /// Register an in-memory replica for every configured doctype that
    /// has none yet.
    pub fn memory_replicas(mut self) -> Self {
        for doctype in self.config.doctypes.keys() {
            if !self.replicas.contains_key(doctype) {
                let name = self.config.database_name(doctype);
                self.replicas
                    .insert(doctype.clone(), Arc::new(MemoryReplica::new(name)));
            }
        }
        self
    }

    /// Remote source. Defaults to an [`HttpRemote`] built from
    /// `config.remote`.
    pub fn remote(mut self, remote: Arc<dyn RemoteSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Flag store. Defaults to the one described by `config.flags`.
    pub fn flags(mut self, flags: Arc<dyn FlagStore>) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn SchedulerHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Executor of warm-up queries.
    pub fn executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Lifecycle signal channel.
    pub fn signals(mut self, signals: broadcast::Sender<LifecycleSignal>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Validate the configuration, open the flag store and load the
    /// persisted replication state.
    pub async fn build(self) -> Result<ReplicationScheduler> {
        self.config.validate()?;
        if self.replicas.is_empty() {
            return Err(SyncError::Config("no doctype to replicate".to_string()));
        }

        let remote = match self.remote {
            Some(remote) => remote,
            None => Arc::new(HttpRemote::from_config(&self.config.remote)?),
        };
        let flags = match self.flags {
            Some(flags) => flags,
            None => flags::open(&self.config.flags).await?,
        };
        let state = ReplicationStateStore::load(flags).await?;
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);

        info!(
            prefix = %self.config.prefix,
            doctypes = self.replicas.len(),
            "Replication scheduler created"
        );

        Ok(ReplicationScheduler {
            inner: Arc::new(Inner {
                config: self.config,
                replicas: self.replicas,
                remote,
                state,
                hooks: self.hooks,
                executor: self.executor,
                connectivity: self.connectivity,
                diagnostics: self.diagnostics,
                signals: self.signals,
                databases_ready: AtomicBool::new(false),
                replication_loop: Mutex::new(None),
                listener: Mutex::new(None),
                cancel: Mutex::new(None),
                in_flight: tokio::sync::Mutex::new(()),
                state_tx,
                state_rx,
            }),
        })
    }
}

impl ReplicationScheduler {
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    /// Check every local database exists. Memoized after the first
    /// success; failures are logged and retried on the next call.
    pub async fn ensure_databases_exist(&self) -> bool {
        self.inner.ensure_databases_exist().await
    }

    /// Start the replication loop: an iteration now, then one `delay`
    /// (default `config.replication_delay`) after each completion.
    ///
    /// Returns `false` if a loop is already running.
    pub async fn start_loop(&self, delay: Option<Duration>) -> bool {
        Inner::start(&self.inner, delay).await
    }

    /// Stop the replication loop. An in-flight iteration finishes.
    pub fn stop_loop(&self) {
        self.inner.stop_loop(SchedulerState::Idle);
    }

    /// Run an iteration right after the current one, or now if the loop
    /// is waiting.
    pub fn sync_immediately(&self) {
        match lock(&self.inner.replication_loop).as_ref() {
            Some(task) if task.is_running() => task.schedule_immediate_task(),
            _ => warn!("No replication loop running, cannot sync immediately"),
        }
    }

    /// Run one replication iteration over every doctype.
    pub async fn replicate_once(&self) -> ReplicationOutcome {
        self.inner.replicate_once().await
    }

    /// Ask the in-flight iteration to stop. Bulk loads stop between pages,
    /// native replications are cancelled.
    pub fn cancel_current_replications(&self) {
        if let Some(cancel) = lock(&self.inner.cancel).as_ref() {
            let _ = cancel.send(true);
            info!("Cancelling current replications");
        }
    }

    /// Wait for the in-flight iteration, if any, to end.
    pub async fn wait_for_current_replications(&self) {
        let _guard = self.inner.in_flight.lock().await;
    }

    /// Stop everything, forget the persisted replication state and destroy
    /// every local database.
    #[instrument(skip(self))]
    pub async fn destroy(&self) -> Result<()> {
        self.stop_loop();
        if let Some(listener) = lock(&self.inner.listener).take() {
            listener.abort();
        }
        self.cancel_current_replications();
        self.wait_for_current_replications().await;

        let mut first_error = None;
        if let Err(e) = self.inner.state.clear_all().await {
            warn!(error = %e, "Failed to clear replication state");
            first_error = Some(e);
        }
        self.inner.databases_ready.store(false, Ordering::Release);

        let results = join_all(self.inner.replicas.iter().map(|(doctype, replica)| async move {
            (doctype, replica.destroy().await)
        }))
        .await;

        for (doctype, result) in results {
            if let Err(e) = result {
                warn!(doctype = %doctype, error = %e, "Failed to destroy local database");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Local databases destroyed");
                Ok(())
            }
        }
    }

    /// Local replica of a doctype.
    pub fn replica(&self, doctype: &str) -> Option<Arc<dyn LocalReplica>> {
        self.inner.replicas.get(doctype).cloned()
    }

    pub async fn is_synced(&self, doctype: &str) -> bool {
        self.inner.state.is_synced(doctype).await
    }

    /// Whether every query's alias has been warmed up for the doctype.
    pub async fn are_queries_warmed_up(&self, doctype: &str, queries: &[crate::query::QueryDefinition]) -> bool {
        let done = self.inner.state.warmed_up(doctype).await;
        queries
            .iter()
            .all(|q| q.alias.as_ref().is_some_and(|alias| done.contains(alias)))
    }

    /// Compact a doctype's local database. Never fails.
    #[instrument(skip(self))]
    pub async fn compact(&self, doctype: &str) {
        let Some(replica) = self.inner.replicas.get(doctype) else {
            warn!("Unknown doctype, nothing to compact");
            return;
        };
        let start = Instant::now();
        let result = replica.compact().await;
        let elapsed = start.elapsed();
        metrics::record_compaction(doctype, result.is_ok(), elapsed);
        match result {
            Ok(()) => info!(duration_ms = elapsed.as_millis() as u64, "Compaction done"),
            Err(e) => warn!(error = %e, "Compaction failed"),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state_rx.borrow()
    }

    /// Receiver for state changes.
    pub fn state_receiver(&self) -> watch::Receiver<SchedulerState> {
        self.inner.state_rx.clone()
    }

    pub fn is_loop_running(&self) -> bool {
        lock(&self.inner.replication_loop)
            .as_ref()
            .is_some_and(PeriodicTask::is_running)
    }

    /// Replicated doctypes, sorted.
    pub fn doctypes(&self) -> Vec<String> {
        self.inner.replicas.keys().cloned().collect()
    }
}

impl Inner {
    async fn ensure_databases_exist(&self) -> bool {
        if self.databases_ready.load(Ordering::Acquire) {
            return true;
        }

        let results = join_all(self.replicas.iter().map(|(doctype, replica)| async move {
            (doctype, replica.info().await)
        }))
        .await;

        let mut ready = true;
        for (doctype, result) in results {
            match result {
                Ok(info) => debug!(
                    doctype = %doctype,
                    db = %info.db_name,
                    docs = info.doc_count,
                    "Local database ready"
                ),
                Err(e) => {
                    warn!(doctype = %doctype, error = %e, "Local database check failed");
                    ready = false;
                }
            }
        }

        if ready {
            self.databases_ready.store(true, Ordering::Release);
        }
        ready
    }

    async fn start(self: &Arc<Self>, delay: Option<Duration>) -> bool {
        self.ensure_databases_exist().await;
        self.start_loop(delay)
    }

    fn start_loop(self: &Arc<Self>, delay: Option<Duration>) -> bool {
        let mut slot = lock(&self.replication_loop);
        if slot.as_ref().is_some_and(PeriodicTask::is_running) {
            warn!("Replication loop already running");
            return false;
        }

        let delay = delay.unwrap_or_else(|| self.config.replication_delay());
        let weak = Arc::downgrade(self);
        let task = PeriodicTask::new("replication", delay, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.replicate_once().await;
                }
            }
            .boxed()
        });
        task.start();
        *slot = Some(task);
        drop(slot);

        self.listen_to_signals();
        self.state_tx.send_replace(SchedulerState::Running);
        info!(delay_ms = delay.as_millis() as u64, "Replication loop started");
        true
    }

    fn stop_loop(&self, next: SchedulerState) {
        if let Some(task) = lock(&self.replication_loop).take() {
            task.stop();
            info!(state = %next, "Replication loop stopped");
        }
        self.state_tx.send_replace(next);
    }

    fn suspend(&self) {
        if lock(&self.replication_loop).is_some() {
            self.stop_loop(SchedulerState::Suspended);
        }
    }

    fn listen_to_signals(self: &Arc<Self>) {
        let Some(signals) = &self.signals else {
            return;
        };
        let mut listener = lock(&self.listener);
        if listener.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let receiver = signals.subscribe();
        let span = tracing::info_span!("lifecycle");
        *listener = Some(tokio::spawn(
            listen(Arc::downgrade(self), receiver).instrument(span),
        ));
        debug!("Lifecycle listener registered");
    }

    async fn handle_signal(self: &Arc<Self>, signal: LifecycleSignal) {
        let mobile = self.config.mobile_app;
        debug!(?signal, "Lifecycle signal");
        match signal {
            LifecycleSignal::Online => {
                self.start(None).await;
            }
            LifecycleSignal::Offline => self.suspend(),
            LifecycleSignal::Resume if mobile => {
                self.start(None).await;
            }
            LifecycleSignal::Pause if mobile => self.suspend(),
            LifecycleSignal::Pause | LifecycleSignal::Resume => {}
        }
    }

    #[instrument(skip(self))]
    async fn replicate_once(&self) -> ReplicationOutcome {
        let _guard = self.in_flight.lock().await;
        let start = Instant::now();

        if !self.connectivity.is_online() {
            info!("Offline, skipping replication");
            metrics::record_replication_cycle(ReplicationOutcome::Offline.label());
            return ReplicationOutcome::Offline;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *lock(&self.cancel) = Some(cancel_tx);

        let results = join_all(self.replicas.iter().map(|(doctype, replica)| {
            let cancel = cancel_rx.clone();
            async move {
                let result = self.replicate_doctype(doctype, replica.as_ref(), &cancel).await;
                (doctype.clone(), result)
            }
        }))
        .await;
        lock(&self.cancel).take();

        let mut updates = DoctypeUpdates::new();
        let mut failure = None;
        for (doctype, result) in results {
            match result {
                Ok(docs) => {
                    updates.insert(doctype, docs);
                }
                Err(e) => {
                    let e = if e.is_loop_fatal() {
                        e
                    } else {
                        SyncError::replication(&doctype, e.to_string())
                    };
                    metrics::record_replication_failure(&doctype);
                    warn!(doctype = %doctype, error = %e, "Doctype replication failed");
                    failure.get_or_insert(e);
                }
            }
        }

        let outcome = match failure {
            Some(err) => {
                error!(error = %err, "Replication failed, stopping loop");
                self.stop_loop(SchedulerState::Idle);
                self.hooks.on_error(&err);
                ReplicationOutcome::Failed(err)
            }
            None => {
                self.hooks.on_sync(&updates);
                ReplicationOutcome::Completed(updates)
            }
        };

        metrics::record_replication_cycle(outcome.label());
        metrics::record_replication_cycle_duration(start.elapsed());
        info!(
            outcome = outcome.label(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Replication iteration done"
        );
        outcome
    }

    #[instrument(skip(self, replica, cancel))]
    async fn replicate_doctype(
        &self,
        doctype: &str,
        replica: &dyn LocalReplica,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Vec<Document>> {
        let options = self.config.doctype_options(doctype);
        let initial = !self.state.is_synced(doctype).await;
        self.diagnostics.replication_started(doctype, initial);
        let start = Instant::now();

        let (mode, docs) = if initial && options.strategy != ReplicationStrategy::ToRemote {
            let docs = replicate_all_docs(
                doctype,
                replica,
                self.remote.as_ref(),
                self.config.batch_size,
                cancel,
                self.diagnostics.as_ref(),
            )
            .await?;
            match self.remote.last_sequence(doctype).await {
                Ok(Some(seq)) => self.persist_sequence(doctype, seq).await,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Could not read remote sequence after bulk load"),
            }
            ("bulk", docs)
        } else {
            let request = ReplicationRequest {
                strategy: options.strategy,
                batch_size: self.config.batch_size,
                since: self.state.sequence(doctype).await,
                exclude_design_docs: true,
            };
            let url = self.remote.replication_url(doctype);
            let outcome = start_replication(doctype, replica, &url, request, cancel).await?;
            if let Some(seq) = outcome.summary.last_seq {
                self.persist_sequence(doctype, seq).await;
            }
            ("incremental", outcome.documents)
        };

        match self.state.add_synced(doctype).await {
            Ok(true) => info!("Doctype marked as synced"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to persist synced doctype"),
        }

        warmup::warmup_doctype(
            doctype,
            &options.warmup_queries,
            self.executor.as_ref(),
            &self.state,
        )
        .await;

        let elapsed = start.elapsed();
        metrics::record_doctype_replication(doctype, mode, docs.len(), elapsed);
        self.diagnostics.replication_finished(doctype, docs.len());
        info!(
            mode,
            docs = docs.len(),
            duration_ms = elapsed.as_millis() as u64,
            "Doctype replicated"
        );
        Ok(docs)
    }

    async fn persist_sequence(&self, doctype: &str, sequence: String) {
        if let Err(e) = self.state.set_sequence(doctype, sequence).await {
            warn!(doctype = %doctype, error = %e, "Failed to persist replication sequence");
        }
    }
}

async fn listen(inner: Weak<Inner>, mut signals: broadcast::Receiver<LifecycleSignal>) {
    loop {
        let signal = match signals.recv().await {
            Ok(signal) => signal,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Lifecycle listener lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_signal(signal).await;
    }
    debug!("Lifecycle listener stopped");
}
