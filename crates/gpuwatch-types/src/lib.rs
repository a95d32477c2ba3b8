use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The telemetry backends a snapshot source can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// In-process NVIDIA Management Library.
    Nvml,
    /// `nvidia-smi --query-gpu` CSV output.
    NvidiaSmi,
    /// `nvtop --json` document.
    Nvtop,
}

impl ProviderKind {
    /// Fallback order used when no provider is forced.
    pub const DEFAULT_ORDER: [ProviderKind; 3] =
        [ProviderKind::Nvml, ProviderKind::NvidiaSmi, ProviderKind::Nvtop];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Nvml => "nvml",
            ProviderKind::NvidiaSmi => "nvidia_smi",
            ProviderKind::Nvtop => "nvtop",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = GpuWatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            // "pynvml" is accepted so older deployment configs keep working.
            "nvml" | "pynvml" => Ok(ProviderKind::Nvml),
            "nvidia_smi" | "nvidia-smi" => Ok(ProviderKind::NvidiaSmi),
            "nvtop" => Ok(ProviderKind::Nvtop),
            other => Err(GpuWatchError::Config(format!("unknown telemetry provider '{other}'"))),
        }
    }
}

/// A single point-in-time telemetry reading across every visible GPU.
///
/// Produced by a snapshot source once per poll and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub timestamp: DateTime<Utc>,
    /// Ordered as the backend enumerated the devices at poll time.
    pub gpus: Vec<GpuReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemReading>,
}

impl TelemetrySnapshot {
    /// Snapshot stamped with the current UTC time and no host metrics.
    pub fn now(gpus: Vec<GpuReading>) -> Self {
        Self {
            timestamp: Utc::now(),
            gpus,
            system: None,
        }
    }

    /// Attach host metrics (builder-style).
    pub fn with_system(mut self, system: Option<SystemReading>) -> Self {
        self.system = system;
        self
    }
}

/// Per-device metrics. Every metric is optional because no backend exposes
/// all of them. Memory figures are MiB, power figures are watts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuReading {
    /// Device index, unique within one snapshot.
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuda_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utilization: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_free: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoder_utilization: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoder_utilization: Option<f64>,
    #[serde(default)]
    pub processes: Vec<ProcessReading>,
}

/// A process holding memory on a GPU.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReading {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "usedMemoryMiB")]
    pub used_memory_mib: u64,
}

/// Host-level metrics gathered independently of the GPU backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemReading {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    /// Bytes.
    pub memory_used: u64,
    /// Bytes.
    pub memory_total: u64,
    /// 1, 5 and 15 minute load averages.
    pub load_average: [f64; 3],
    pub uptime_seconds: u64,
    pub hostname: String,
}

/// Out-of-band notification sent to subscribers without rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Notice {
    Error { message: String },
}

/// Error type shared by every gpuwatch crate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GpuWatchError {
    #[error("Telemetry provider {provider} unavailable: {reason}")]
    BackendUnavailable { provider: ProviderKind, reason: String },

    #[error("No telemetry provider available")]
    NoProviderAvailable,

    #[error("Backend Error: {0}")]
    Backend(String),

    #[error("Subscriber Error: {0}")]
    Subscriber(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("I/O Error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for GpuWatchError {
    fn from(e: serde_json::Error) -> Self {
        GpuWatchError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_parses_aliases() {
        assert_eq!("NVML".parse::<ProviderKind>().unwrap(), ProviderKind::Nvml);
        assert_eq!("pynvml".parse::<ProviderKind>().unwrap(), ProviderKind::Nvml);
        assert_eq!("nvidia-smi".parse::<ProviderKind>().unwrap(), ProviderKind::NvidiaSmi);
        assert_eq!(" nvtop ".parse::<ProviderKind>().unwrap(), ProviderKind::Nvtop);
        assert!(matches!(
            "rocm".parse::<ProviderKind>(),
            Err(GpuWatchError::Config(_))
        ));
    }

    #[test]
    fn provider_kind_display_matches_wire_name() {
        for kind in ProviderKind::DEFAULT_ORDER {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn snapshot_serializes_camel_case_and_omits_missing_fields() {
        let snapshot = TelemetrySnapshot::now(vec![GpuReading {
            id: 0,
            name: Some("RTX 4090".to_string()),
            memory_used: Some(1024.0),
            processes: vec![ProcessReading {
                pid: 42,
                name: None,
                used_memory_mib: 512,
            }],
            ..Default::default()
        }]);
        let value = serde_json::to_value(&snapshot).unwrap();

        let gpu = &value["gpus"][0];
        assert_eq!(gpu["memoryUsed"], 1024.0);
        assert_eq!(gpu["processes"][0]["usedMemoryMiB"], 512);
        assert!(gpu.get("uuid").is_none());
        assert!(gpu.get("powerUsage").is_none());
        assert!(value.get("system").is_none());
    }

    #[test]
    fn system_reading_uses_wire_names() {
        let system = SystemReading {
            cpu_usage: 12.5,
            memory_usage: 40.0,
            memory_used: 4,
            memory_total: 10,
            load_average: [0.5, 0.25, 0.1],
            uptime_seconds: 3600,
            hostname: "node-1".to_string(),
        };
        let value = serde_json::to_value(&system).unwrap();
        assert_eq!(value["cpuUsage"], 12.5);
        assert_eq!(value["loadAverage"][2], 0.1);
        assert_eq!(value["uptimeSeconds"], 3600);
    }

    #[test]
    fn notice_error_wire_form() {
        let notice = Notice::Error {
            message: "backend lost".to_string(),
        };
        let json = serde_json::to_string(&notice).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"backend lost"}"#);
    }

    #[test]
    fn error_display() {
        let err = GpuWatchError::BackendUnavailable {
            provider: ProviderKind::Nvtop,
            reason: "binary not found".to_string(),
        };
        assert!(err.to_string().contains("nvtop"));
        assert!(GpuWatchError::NoProviderAvailable.to_string().contains("No telemetry provider"));
    }
}
