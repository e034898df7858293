// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic task loop.
//!
//! Runs an async task immediately on start, then again `delay` after each
//! completion. Runs never overlap.
//!
//! ```text
//! start() ──▶ run ──▶ wait(delay) ──▶ run ──▶ wait(delay) ──▶ ...
//!                       │    ▲
//!                       │    └── schedule_immediate_task() cuts the wait
//!                       └─────── stop() ends the loop (in-flight run finishes)
//! ```

use crate::metrics;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

/// The repeated unit of work.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    /// Fresh per start: a pending immediate run never survives a stop
    trigger: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// A cooperative, non-overlapping periodic runner.
pub struct PeriodicTask {
    name: String,
    delay: Duration,
    task: TaskFn,
    running: Mutex<Option<RunningLoop>>,
}

impl PeriodicTask {
    pub fn new<F>(name: impl Into<String>, delay: Duration, task: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            delay,
            task: Arc::new(task),
            running: Mutex::new(None),
        }
    }

    /// Start the loop. The first run begins immediately.
    ///
    /// Returns `false` if the loop is already running. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let trigger = Arc::new(Notify::new());
        let span = tracing::info_span!("periodic", task = %self.name);
        let handle = tokio::spawn(
            run_loop(
                self.name.clone(),
                self.delay,
                Arc::clone(&self.task),
                Arc::clone(&trigger),
                shutdown_rx,
            )
            .instrument(span),
        );

        *running = Some(RunningLoop {
            shutdown_tx,
            trigger,
            handle,
        });
        true
    }

    /// Stop the loop. An in-flight run is allowed to finish.
    ///
    /// Safe to call from within the task itself.
    pub fn stop(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = running.take() {
            let _ = running.shutdown_tx.send(true);
            debug!(task = %self.name, "Periodic task stop requested");
        }
    }

    /// Make the next run start right after the current one, or now if
    /// the loop is waiting. Requests made while a run is in flight
    /// collapse into one extra run. No-op when the loop is stopped.
    pub fn schedule_immediate_task(&self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = running.as_ref() {
            running.trigger.notify_one();
        }
    }

    /// Whether the loop is running.
    pub fn is_running(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.as_ref().is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    name: String,
    delay: Duration,
    task: TaskFn,
    trigger: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Mark initial value as seen so changed() only fires on stop()
    let _ = shutdown_rx.borrow_and_update();

    info!(delay_ms = delay.as_millis() as u64, "Periodic task started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let start = Instant::now();
        task().await;
        metrics::record_periodic_run(&name, start.elapsed());

        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break,

            _ = trigger.notified() => {
                debug!("Immediate run requested");
            }

            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("Periodic task stopped");
}
