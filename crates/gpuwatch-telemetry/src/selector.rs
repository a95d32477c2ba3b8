//! [`ProviderSelector`] – priority-ordered backend fallback chain.
//!
//! The selector stores one constructor per [`ProviderKind`].  At startup it
//! builds a priority order (forced kind first, then
//! [`ProviderKind::DEFAULT_ORDER`]) and tries each constructor exactly once.
//! A constructor failure is logged and the next candidate is tried; the first
//! source that constructs wins and stays fixed for the process lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use gpuwatch_types::{GpuWatchError, ProviderKind};
use tracing::{info, warn};

use crate::nvidia_smi::NvidiaSmiSource;
use crate::nvml::NvmlSource;
use crate::nvtop::NvtopSource;
use crate::source::{SnapshotSource, SourceOptions};

/// Constructor for one backend.
pub type SourceFactory = Box<
    dyn Fn(&SourceOptions) -> Result<Arc<dyn SnapshotSource>, GpuWatchError> + Send + Sync,
>;

/// Registry of backend constructors and the fallback chain over them.
#[derive(Default)]
pub struct ProviderSelector {
    factories: HashMap<ProviderKind, SourceFactory>,
}

impl ProviderSelector {
    /// Create a selector with no registered backends.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector wired to the three real backends.
    pub fn with_default_backends() -> Self {
        Self::new()
            .register(ProviderKind::Nvml, |opts| {
                Ok(Arc::new(NvmlSource::new(opts)?) as Arc<dyn SnapshotSource>)
            })
            .register(ProviderKind::NvidiaSmi, |opts| {
                Ok(Arc::new(NvidiaSmiSource::new(opts)?) as Arc<dyn SnapshotSource>)
            })
            .register(ProviderKind::Nvtop, |opts| {
                Ok(Arc::new(NvtopSource::new(opts)?) as Arc<dyn SnapshotSource>)
            })
    }

    /// Register a constructor for `kind` (builder-style).  A previously
    /// registered constructor for the same kind is replaced.
    pub fn register<F>(mut self, kind: ProviderKind, factory: F) -> Self
    where
        F: Fn(&SourceOptions) -> Result<Arc<dyn SnapshotSource>, GpuWatchError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
        self
    }

    /// The order in which candidates would be tried.
    ///
    /// `preferred` goes first, followed by the remaining kinds of
    /// [`ProviderKind::DEFAULT_ORDER`].  Kinds with no registered constructor
    /// are left out.
    pub fn priority_order(&self, preferred: Option<ProviderKind>) -> Vec<ProviderKind> {
        preferred
            .into_iter()
            .chain(
                ProviderKind::DEFAULT_ORDER
                    .into_iter()
                    .filter(|kind| Some(*kind) != preferred),
            )
            .filter(|kind| self.factories.contains_key(kind))
            .collect()
    }

    /// Construct the first backend in priority order that succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`GpuWatchError::NoProviderAvailable`] when every candidate
    /// fails (or none is registered).  This is fatal for the service.
    pub fn select(
        &self,
        preferred: Option<ProviderKind>,
        options: &SourceOptions,
    ) -> Result<Arc<dyn SnapshotSource>, GpuWatchError> {
        for kind in self.priority_order(preferred) {
            let Some(factory) = self.factories.get(&kind) else {
                continue;
            };
            match factory(options) {
                Ok(source) => {
                    info!(provider = %kind, "using telemetry provider");
                    return Ok(source);
                }
                Err(e) => {
                    warn!(provider = %kind, error = %e, "failed to initialize provider");
                }
            }
        }
        Err(GpuWatchError::NoProviderAvailable)
    }
}
