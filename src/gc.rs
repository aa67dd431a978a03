//! Background attachment garbage collection.

use crate::error::Result;
use crate::hub::BroadcastHub;
use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Thread that sweeps unreferenced attachments on an interval.
///
/// Stops when [`stop`](GcWorker::stop) is called or the worker is dropped.
pub struct GcWorker {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl GcWorker {
    /// Start sweeping `hub` every `interval`.
    pub fn spawn(hub: Arc<BroadcastHub>, interval: Duration) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let handle = thread::Builder::new()
            .name("murmur-gc".into())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => run_once(&hub),
                    recv(shutdown_rx) -> _ => {
                        debug!("GC worker stopping");
                        break;
                    }
                }
            })?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Start with the interval from the hub's configuration.
    pub fn from_config(hub: Arc<BroadcastHub>) -> Result<Self> {
        let interval = hub.config().gc_interval();
        Self::spawn(hub, interval)
    }

    /// Signal the worker and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        // Dropping the sender disconnects the channel, which wakes the select.
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("GC worker panicked");
            }
        }
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn run_once(hub: &BroadcastHub) {
    match hub.gc_attachments() {
        Ok(report) => {
            if !report.removed.is_empty() {
                info!(
                    removed = report.removed.len(),
                    freed_bytes = report.freed_bytes,
                    "GC pruned unreferenced attachments"
                );
            }
        }
        Err(e) => {
            warn!(error = %e, "GC error");
        }
    }
}
