//! The capability shared by every telemetry backend.
//!
//! gpuwatch never talks to a vendor tool directly outside this crate.  Each
//! backend wraps its acquisition mechanism (native library, CLI text output,
//! CLI JSON document) behind [`SnapshotSource`] and the rest of the system
//! only ever sees [`TelemetrySnapshot`] values or their absence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpuwatch_types::{GpuWatchError, ProviderKind, TelemetrySnapshot};

use crate::system::SystemCollector;

/// Default upper bound on a single CLI backend invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Every telemetry backend must implement this trait.
///
/// # Contract
///
/// * `snapshot` – returns one point-in-time reading, or `None` when the
///   backend could not produce one this cycle (missing binary, non-zero exit,
///   malformed output, library call failure).  It never returns an error and
///   never blocks beyond a single backend invocation.
///
/// * `start` / `stop` – optional lifecycle hooks.  Both are idempotent and
///   called at most once each per process.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Which backend this source reads from.
    fn kind(&self) -> ProviderKind;

    /// Acquire any long-lived backend resources.
    async fn start(&self) -> Result<(), GpuWatchError> {
        Ok(())
    }

    /// Release backend resources.  Later snapshots may return `None`.
    async fn stop(&self) {}

    /// Take one reading.
    async fn snapshot(&self) -> Option<TelemetrySnapshot>;
}

/// Construction-time options shared by all backends.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Merge a host [`SystemReading`](gpuwatch_types::SystemReading) into
    /// every snapshot.
    pub include_system: bool,
    /// Upper bound on one CLI invocation; a timeout counts as absence.
    pub command_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            include_system: true,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl SourceOptions {
    pub fn with_system_metrics(mut self, include_system: bool) -> Self {
        self.include_system = include_system;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Build the host metrics collector a source should hold, if any.
    pub(crate) fn system_collector(&self) -> Option<Arc<SystemCollector>> {
        self.include_system.then(|| Arc::new(SystemCollector::new()))
    }
}

/// Round to two decimal places, matching the precision clients display.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
