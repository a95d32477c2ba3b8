//! `gpuwatch-telemetry` – GPU telemetry acquisition.
//!
//! Turns one of several vendor backends into a steady stream of
//! [`TelemetrySnapshot`] values.
//!
//! # Modules
//!
//! - [`source`] – the [`SnapshotSource`] capability every backend implements.
//! - [`nvml`] – in-process NVML backend (richest field coverage).
//! - [`nvidia_smi`] – `nvidia-smi --query-gpu` CSV backend.
//! - [`nvtop`] – `nvtop --json` backend.
//! - [`system`] – host CPU / memory / load metrics via `sysinfo`.
//! - [`selector`] – priority-ordered provider fallback chain.
//! - [`poller`] – poll-to-stream adapter feeding a bounded channel.
//!
//! [`TelemetrySnapshot`]: gpuwatch_types::TelemetrySnapshot

mod command;
pub mod nvidia_smi;
pub mod nvml;
pub mod nvtop;
pub mod poller;
pub mod selector;
pub mod source;
pub mod system;

pub use nvidia_smi::NvidiaSmiSource;
pub use nvml::NvmlSource;
pub use nvtop::NvtopSource;
pub use poller::{Poller, PollerHandle, MIN_POLL_INTERVAL};
pub use selector::{ProviderSelector, SourceFactory};
pub use source::{SnapshotSource, SourceOptions};
pub use system::SystemCollector;
