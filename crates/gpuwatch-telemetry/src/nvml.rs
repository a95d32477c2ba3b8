//! [`NvmlSource`] – in-process NVML backend.
//!
//! Queries the NVIDIA Management Library through `nvml-wrapper`.  This is the
//! richest backend: it reports per-process memory, encoder/decoder
//! utilization, and the CUDA driver version.  Construction loads the library
//! and fails immediately when it cannot, which lets the provider selector fall
//! through to a CLI backend.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gpuwatch_types::{GpuReading, GpuWatchError, ProcessReading, ProviderKind, TelemetrySnapshot};
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml, cuda_driver_version_major, cuda_driver_version_minor};
use tracing::{debug, error, info, warn};

use crate::source::{SnapshotSource, SourceOptions, round2};
use crate::system::SystemCollector;

const MIB: f64 = 1024.0 * 1024.0;

/// Maximum process-name length requested from NVML.
const PROCESS_NAME_LEN: usize = 64;

/// Snapshot source backed by NVML.
///
/// The library handle lives behind a mutex so [`SnapshotSource::stop`] can
/// shut it down; snapshots taken after that report `None`.  NVML calls block,
/// so each snapshot runs them on the blocking thread pool.
pub struct NvmlSource {
    nvml: Arc<Mutex<Option<Nvml>>>,
    system: Option<Arc<SystemCollector>>,
}

impl NvmlSource {
    /// Load NVML and build a source.
    ///
    /// # Errors
    ///
    /// Returns [`GpuWatchError::BackendUnavailable`] when the shared library
    /// is missing or refuses to initialise.
    pub fn new(options: &SourceOptions) -> Result<Self, GpuWatchError> {
        let nvml = Nvml::init().map_err(|e| GpuWatchError::BackendUnavailable {
            provider: ProviderKind::Nvml,
            reason: e.to_string(),
        })?;
        Ok(Self {
            nvml: Arc::new(Mutex::new(Some(nvml))),
            system: options.system_collector(),
        })
    }
}

fn read_gpus(handle: &Mutex<Option<Nvml>>) -> Option<Vec<GpuReading>> {
    let guard = match handle.lock() {
        Ok(guard) => guard,
        Err(e) => {
            error!(provider = %ProviderKind::Nvml, error = %e, "NVML handle poisoned");
            return None;
        }
    };
    let nvml = guard.as_ref()?;
    match read_devices(nvml) {
        Ok(gpus) => Some(gpus),
        Err(e) => {
            error!(provider = %ProviderKind::Nvml, error = %e, "failed to query GPU count");
            None
        }
    }
}

#[async_trait]
impl SnapshotSource for NvmlSource {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Nvml
    }

    async fn start(&self) -> Result<(), GpuWatchError> {
        if let Ok(guard) = self.nvml.lock() {
            if let Some(nvml) = guard.as_ref() {
                let count = nvml.device_count().unwrap_or(0);
                info!(provider = %ProviderKind::Nvml, devices = count, "NVML ready");
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        let handle = match self.nvml.lock() {
            Ok(mut guard) => guard.take(),
            Err(e) => {
                warn!(error = %e, "NVML handle poisoned during shutdown");
                return;
            }
        };
        if let Some(nvml) = handle {
            if let Err(e) = nvml.shutdown() {
                debug!(error = %e, "NVML shutdown failed");
            }
        }
    }

    async fn snapshot(&self) -> Option<TelemetrySnapshot> {
        let handle = Arc::clone(&self.nvml);
        let gpus = match tokio::task::spawn_blocking(move || read_gpus(&handle)).await {
            Ok(gpus) => gpus?,
            Err(e) => {
                error!(provider = %ProviderKind::Nvml, error = %e, "NVML query task failed");
                return None;
            }
        };
        let system = self.system.as_ref().and_then(|s| s.collect());
        Some(TelemetrySnapshot::now(gpus).with_system(system))
    }
}

/// Enumerate every device.  Only the device count is mandatory; every other
/// query degrades to `None` on failure.
fn read_devices(nvml: &Nvml) -> Result<Vec<GpuReading>, NvmlError> {
    let count = nvml.device_count()?;
    let driver_version = optional(nvml.sys_driver_version());
    let cuda_version = optional(nvml.sys_cuda_driver_version()).map(|v| {
        format!(
            "{}.{}",
            cuda_driver_version_major(v),
            cuda_driver_version_minor(v)
        )
    });

    let mut gpus = Vec::with_capacity(count as usize);
    for index in 0..count {
        let device = match nvml.device_by_index(index) {
            Ok(device) => device,
            Err(e) => {
                warn!(index, error = %e, "skipping unreadable GPU");
                continue;
            }
        };
        let mut reading = read_device(nvml, &device, index);
        reading.driver_version = driver_version.clone();
        reading.cuda_version = cuda_version.clone();
        gpus.push(reading);
    }
    Ok(gpus)
}

fn read_device(nvml: &Nvml, device: &Device<'_>, index: u32) -> GpuReading {
    let memory = optional(device.memory_info());
    let utilization = optional(device.utilization_rates());

    GpuReading {
        id: index,
        uuid: optional(device.uuid()),
        name: optional(device.name()),
        utilization: utilization.map(|u| f64::from(u.gpu)),
        memory_used: memory.as_ref().map(|m| bytes_to_mib(m.used)),
        memory_free: memory.as_ref().map(|m| bytes_to_mib(m.free)),
        memory_total: memory.as_ref().map(|m| bytes_to_mib(m.total)),
        temperature: optional(device.temperature(TemperatureSensor::Gpu)).map(f64::from),
        power_usage: optional(device.power_usage()).map(milli_to_unit),
        power_limit: optional(device.enforced_power_limit()).map(milli_to_unit),
        fan_speed: optional(device.fan_speed(0)).map(f64::from),
        encoder_utilization: optional(device.encoder_utilization())
            .map(|u| f64::from(u.utilization)),
        decoder_utilization: optional(device.decoder_utilization())
            .map(|u| f64::from(u.utilization)),
        processes: optional(device.running_compute_processes())
            .unwrap_or_default()
            .into_iter()
            .map(|p| ProcessReading {
                pid: p.pid,
                name: optional(nvml.sys_process_name(p.pid, PROCESS_NAME_LEN)),
                used_memory_mib: match p.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => bytes / (1024 * 1024),
                    UsedGpuMemory::Unavailable => 0,
                },
            })
            .collect(),
        ..Default::default()
    }
}

fn optional<T>(result: Result<T, NvmlError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(error = %e, "NVML query failed");
            None
        }
    }
}

fn bytes_to_mib(bytes: u64) -> f64 {
    round2(bytes as f64 / MIB)
}

/// NVML reports power in milliwatts.
fn milli_to_unit(milli: u32) -> f64 {
    round2(f64::from(milli) / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conversions() {
        assert_eq!(bytes_to_mib(1024 * 1024 * 512), 512.0);
        assert_eq!(bytes_to_mib(1536 * 1024), 1.5);
        assert_eq!(milli_to_unit(61_234), 61.23);
        assert_eq!(milli_to_unit(450_000), 450.0);
    }

    #[test]
    fn optional_discards_errors() {
        assert_eq!(optional::<u32>(Ok(7)), Some(7));
        assert_eq!(optional::<u32>(Err(NvmlError::NotSupported)), None);
    }

    #[tokio::test]
    async fn construction_either_succeeds_or_reports_unavailable() {
        // Hosts without an NVIDIA driver exercise the failure path; GPU hosts
        // exercise a real snapshot followed by shutdown.
        match NvmlSource::new(&SourceOptions::default().with_system_metrics(false)) {
            Ok(source) => {
                source.start().await.unwrap();
                assert!(source.snapshot().await.is_some());
                source.stop().await;
                source.stop().await;
                assert!(source.snapshot().await.is_none(), "stopped source reports absence");
            }
            Err(e) => assert!(matches!(
                e,
                GpuWatchError::BackendUnavailable { provider: ProviderKind::Nvml, .. }
            )),
        }
    }

    #[tokio::test]
    async fn released_handle_reports_absence() {
        let source = NvmlSource {
            nvml: Arc::new(Mutex::new(None)),
            system: None,
        };
        assert!(source.snapshot().await.is_none());
        source.stop().await;
        assert!(source.snapshot().await.is_none());
    }
}
