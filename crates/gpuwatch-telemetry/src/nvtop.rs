//! [`NvtopSource`] – `nvtop --json` backend.
//!
//! Parses the nested document `nvtop` prints.  Numeric fields are accepted
//! either as JSON numbers or as strings carrying a unit suffix (`"45C"`,
//! `"37%"`), since nvtop builds differ on this.  A document that does not
//! parse at all is logged and reported as absent.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpuwatch_types::{
    GpuReading, GpuWatchError, ProcessReading, ProviderKind, TelemetrySnapshot,
};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{error, warn};

use crate::command;
use crate::source::{SnapshotSource, SourceOptions};
use crate::system::SystemCollector;

/// Default program name looked up on `PATH`.
pub const PROGRAM: &str = "nvtop";

/// Snapshot source backed by `nvtop --json`.
pub struct NvtopSource {
    program: PathBuf,
    timeout: Duration,
    system: Option<Arc<SystemCollector>>,
}

impl NvtopSource {
    /// Build a source using `nvtop` from `PATH`.
    pub fn new(options: &SourceOptions) -> Result<Self, GpuWatchError> {
        Self::with_program(PROGRAM, options)
    }

    /// Build a source invoking a specific executable.
    pub fn with_program(
        program: impl AsRef<Path>,
        options: &SourceOptions,
    ) -> Result<Self, GpuWatchError> {
        let program = command::require_program(ProviderKind::Nvtop, program.as_ref())?;
        Ok(Self {
            program,
            timeout: options.command_timeout,
            system: options.system_collector(),
        })
    }
}

#[async_trait]
impl SnapshotSource for NvtopSource {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Nvtop
    }

    async fn snapshot(&self) -> Option<TelemetrySnapshot> {
        let stdout = match command::run(&self.program, &["--json"], self.timeout).await {
            Ok(stdout) => stdout,
            Err(e) => {
                error!(provider = %self.kind(), error = %e, "failed to execute nvtop");
                return None;
            }
        };

        let gpus = match parse_document(&stdout) {
            Ok(gpus) => gpus,
            Err(e) => {
                warn!(provider = %self.kind(), error = %e, "invalid nvtop JSON");
                return None;
            }
        };

        let system = self.system.as_ref().and_then(|s| s.collect());
        Some(TelemetrySnapshot::now(gpus).with_system(system))
    }
}

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    gpus: Vec<DeviceEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceEntry {
    #[serde(default, deserialize_with = "lenient_u32")]
    index: Option<u32>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default, rename = "product_name")]
    product_name: Option<String>,
    #[serde(default, rename = "driver_version")]
    driver_version: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    utilization: Option<f64>,
    #[serde(default)]
    memory: Option<MemoryEntry>,
    #[serde(default, rename = "temperatureC", deserialize_with = "lenient_f64")]
    temperature_c: Option<f64>,
    #[serde(default, rename = "powerW", deserialize_with = "lenient_f64")]
    power_w: Option<f64>,
    #[serde(default, rename = "powerLimitW", deserialize_with = "lenient_f64")]
    power_limit_w: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    fan_speed_pct: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    encoder_utilization: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    decoder_utilization: Option<f64>,
    #[serde(default)]
    processes: Vec<ProcessEntry>,
}

#[derive(Deserialize)]
struct MemoryEntry {
    #[serde(default, rename = "usedMiB", deserialize_with = "lenient_f64")]
    used_mib: Option<f64>,
    #[serde(default, rename = "totalMiB", deserialize_with = "lenient_f64")]
    total_mib: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessEntry {
    #[serde(default, deserialize_with = "lenient_u32")]
    pid: Option<u32>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "usedMemoryMiB", deserialize_with = "lenient_f64")]
    used_memory_mib: Option<f64>,
}

/// Parse an `nvtop --json` document into readings.
///
/// Devices without an `index` take their position in the list.  Processes
/// without a `pid` are dropped.
pub fn parse_document(stdout: &str) -> Result<Vec<GpuReading>, GpuWatchError> {
    let document: Document = serde_json::from_str(stdout)?;

    Ok(document
        .gpus
        .into_iter()
        .enumerate()
        .map(|(position, gpu)| {
            let (memory_used, memory_total) = gpu
                .memory
                .map(|m| (m.used_mib, m.total_mib))
                .unwrap_or_default();
            GpuReading {
                id: gpu.index.unwrap_or(position as u32),
                uuid: gpu.uuid,
                name: gpu.product_name,
                driver_version: gpu.driver_version,
                utilization: gpu.utilization,
                memory_used,
                memory_total,
                memory_free: memory_total.zip(memory_used).map(|(t, u)| (t - u).max(0.0)),
                temperature: gpu.temperature_c,
                power_usage: gpu.power_w,
                power_limit: gpu.power_limit_w,
                fan_speed: gpu.fan_speed_pct,
                encoder_utilization: gpu.encoder_utilization,
                decoder_utilization: gpu.decoder_utilization,
                processes: gpu
                    .processes
                    .into_iter()
                    .filter_map(|p| {
                        Some(ProcessReading {
                            pid: p.pid?,
                            name: p.name,
                            used_memory_mib: p.used_memory_mib.unwrap_or(0.0).max(0.0).round()
                                as u64,
                        })
                    })
                    .collect(),
                ..Default::default()
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Lenient numeric fields
// ---------------------------------------------------------------------------

fn number_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let digits: String = s
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            digits.parse::<f64>().ok()
        }
        _ => None,
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(number_from_value))
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(number_from_value)
        .filter(|v| *v >= 0.0 && v.fract() == 0.0 && *v <= f64::from(u32::MAX))
        .map(|v| v as u32))
}
