//! Replay engine: drains the buffer store once the upstream is READY.
//!
//! Runs on a fixed timer and immediately when the health prober reaches
//! READY. Entries replay strictly in creation order; the upstream models a
//! stateful conversation, so out-of-order delivery would corrupt its context.
//! A pass therefore stops on the first rejection instead of skipping ahead,
//! and aborts entirely if the phase flaps away from READY mid-pass.
//!
//! Escape hatch for a permanently-poisoned head entry: 5xx rejections are
//! counted per file, and a file that exhausts its budget is moved to the
//! dead-letter directory so the next pass can reach newer traffic. Transport
//! errors mean the whole upstream is unreachable and never count.

use crate::buffer::BufferStore;
use crate::forward::Forwarder;
use crate::upstream::UpstreamMonitor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::sleep;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// What one replay pass accomplished.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Entries delivered and deleted.
    pub replayed: usize,
    /// Corrupt entries deleted without delivery.
    pub dropped: usize,
    /// Entries moved to the dead-letter directory.
    pub quarantined: usize,
    /// True when the pass ended early (rejection, transport error, or flap).
    pub stopped: bool,
}

// ---------------------------------------------------------------------------
// ReplayEngine
// ---------------------------------------------------------------------------

pub struct ReplayEngine {
    store: Arc<BufferStore>,
    forwarder: Arc<Forwarder>,
    monitor: Arc<UpstreamMonitor>,
    /// `0` disables dead-lettering (a rejected head entry blocks forever).
    max_attempts: u32,
    /// In-memory 5xx counts per filename; reset by gateway restart.
    attempts: HashMap<String, u32>,
}

impl ReplayEngine {
    pub fn new(
        store: Arc<BufferStore>,
        forwarder: Arc<Forwarder>,
        monitor: Arc<UpstreamMonitor>,
        max_attempts: u32,
    ) -> Self {
        ReplayEngine {
            store,
            forwarder,
            monitor,
            max_attempts,
            attempts: HashMap::new(),
        }
    }

    /// Run one ordered pass over the buffer. No-op unless the phase is READY.
    pub async fn run_pass(&mut self) -> PassSummary {
        let mut summary = PassSummary::default();

        if !self.monitor.is_ready().await {
            return summary;
        }

        let files = match self.store.list() {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "could not list buffer directory");
                return summary;
            }
        };
        if files.is_empty() {
            return summary;
        }

        info!(count = files.len(), "replaying buffered requests");

        for file in files {
            // Upstream may have flapped mid-pass; abort rather than deliver
            // into a dying process.
            if !self.monitor.is_ready().await {
                warn!("upstream no longer READY, stopping replay");
                summary.stopped = true;
                break;
            }

            let entry = match self.store.load(&file) {
                Ok(entry) => entry,
                Err(e) => {
                    self.drop_corrupt(&file, &e.to_string(), &mut summary);
                    continue;
                }
            };
            let body = match entry.body() {
                Ok(body) => body,
                Err(e) => {
                    self.drop_corrupt(&file, &e.to_string(), &mut summary);
                    continue;
                }
            };

            let result = self
                .forwarder
                .forward(&entry.method, &entry.url, &entry.headers, body.as_deref())
                .await;

            match result {
                Ok(response) if !response.requires_buffering() => {
                    if let Err(e) = self.store.remove(&file) {
                        warn!(file = %file, error = %e, "replayed but could not delete; will re-deliver");
                    }
                    self.attempts.remove(&file);
                    summary.replayed += 1;
                    info!(file = %file, status = response.status, "replayed buffered request");
                }
                Ok(response) => {
                    self.reject(&file, response.status, &mut summary);
                    summary.stopped = true;
                    break;
                }
                Err(e) => {
                    warn!(file = %file, error = %e, "replay failed, upstream unreachable; will retry");
                    summary.stopped = true;
                    break;
                }
            }
        }

        summary
    }

    /// Handle a 5xx rejection of the pass head: count it against the budget
    /// and quarantine on exhaustion.
    fn reject(&mut self, file: &str, status: u16, summary: &mut PassSummary) {
        let count = self.attempts.entry(file.to_owned()).or_insert(0);
        *count += 1;
        let count = *count;

        if self.max_attempts > 0 && count >= self.max_attempts {
            warn!(
                file = %file,
                status,
                attempts = count,
                "replay budget exhausted, moving to dead-letter"
            );
            match self.store.quarantine(file) {
                Ok(()) => {
                    self.attempts.remove(file);
                    summary.quarantined += 1;
                }
                Err(e) => {
                    warn!(file = %file, error = %e, "dead-letter move failed, keeping in buffer");
                }
            }
        } else {
            warn!(file = %file, status, "replay rejected, keeping in buffer");
        }
    }

    fn drop_corrupt(&mut self, file: &str, error: &str, summary: &mut PassSummary) {
        warn!(file = %file, error = %error, "dropping corrupt buffer file");
        if let Err(e) = self.store.remove(file) {
            warn!(file = %file, error = %e, "could not delete corrupt buffer file");
            return;
        }
        self.attempts.remove(file);
        summary.dropped += 1;
    }
}

// ---------------------------------------------------------------------------
// Replay task
// ---------------------------------------------------------------------------

/// Drive the engine from the fixed timer plus the prober's READY trigger.
pub async fn run_replay(
    mut engine: ReplayEngine,
    interval: Duration,
    trigger: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            () = sleep(interval) => {}
            () = trigger.notified() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("replay task stopping (shutdown)");
                    return;
                }
                continue;
            }
        }
        engine.run_pass().await;
    }
}
