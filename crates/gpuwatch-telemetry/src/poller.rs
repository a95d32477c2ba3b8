//! [`Poller`] – poll-to-stream adapter.
//!
//! Drives a [`SnapshotSource`] from a dedicated tokio task and hands every
//! present snapshot to a bounded channel.  Absent snapshots leave a gap in
//! the stream and nothing else.  The task runs until the receiving side is
//! dropped or [`PollerHandle::shutdown`] is called; shutdown also invokes the
//! source's `stop` hook.

use std::sync::Arc;
use std::time::Duration;

use gpuwatch_types::{GpuWatchError, TelemetrySnapshot};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::source::SnapshotSource;

/// Poll intervals shorter than this are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Snapshots buffered between the poll task and its consumer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Configured, not yet running, poll loop.
pub struct Poller {
    source: Arc<dyn SnapshotSource>,
    interval: Duration,
    capacity: usize,
}

impl Poller {
    /// Poll `source` every `interval_ms` milliseconds (floored at
    /// [`MIN_POLL_INTERVAL`]).
    pub fn new(source: Arc<dyn SnapshotSource>, interval_ms: u64) -> Self {
        Self {
            source,
            interval: Duration::from_millis(interval_ms).max(MIN_POLL_INTERVAL),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Override the handoff channel capacity (builder-style).
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Effective poll interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the source and spawn the poll task.
    ///
    /// The first poll happens immediately; later polls follow every
    /// interval.  Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Propagates a failure of the source's `start` hook.
    pub async fn spawn(
        self,
    ) -> Result<(PollerHandle, mpsc::Receiver<TelemetrySnapshot>), GpuWatchError> {
        self.source.start().await?;

        let (tx, rx) = mpsc::channel(self.capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.source),
            self.interval,
            tx,
            shutdown_rx,
        ));

        info!(
            provider = %self.source.kind(),
            interval_ms = self.interval.as_millis() as u64,
            "telemetry poller started"
        );

        Ok((
            PollerHandle {
                source: self.source,
                shutdown: shutdown_tx,
                task,
            },
            rx,
        ))
    }
}

/// Owner of a running poll task.
pub struct PollerHandle {
    source: Arc<dyn SnapshotSource>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Whether the poll task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop polling, wait for the task to exit, then stop the source.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            debug!(error = %e, "poll task ended abnormally");
        }
        self.source.stop().await;
        info!(provider = %self.source.kind(), "telemetry poller stopped");
    }
}

async fn poll_loop(
    source: Arc<dyn SnapshotSource>,
    interval: Duration,
    tx: mpsc::Sender<TelemetrySnapshot>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let Some(snapshot) = source.snapshot().await else {
            debug!(provider = %source.kind(), "no telemetry this cycle");
            continue;
        };

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            sent = tx.send(snapshot) => {
                if sent.is_err() {
                    debug!("snapshot consumer dropped; stopping poller");
                    break;
                }
            }
        }
    }
}
