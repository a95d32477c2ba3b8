//! [`NvidiaSmiSource`] – `nvidia-smi --query-gpu` backend.
//!
//! Invokes `nvidia-smi` with a fixed field list and the
//! `csv,noheader,nounits` format, then maps each line positionally onto a
//! [`GpuReading`].  Lower fidelity than NVML (no process detail) but only
//! needs the driver utilities to be installed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpuwatch_types::{GpuReading, GpuWatchError, ProviderKind, TelemetrySnapshot};
use tracing::{debug, error};

use crate::command;
use crate::source::{SnapshotSource, SourceOptions};
use crate::system::SystemCollector;

/// Default program name looked up on `PATH`.
pub const PROGRAM: &str = "nvidia-smi";

/// Fields requested from `nvidia-smi`, in output column order.
pub const QUERY_FIELDS: [&str; 12] = [
    "index",
    "uuid",
    "name",
    "driver_version",
    "memory.used",
    "memory.free",
    "memory.total",
    "utilization.gpu",
    "utilization.memory",
    "temperature.gpu",
    "power.draw",
    "power.limit",
];

/// Snapshot source backed by the `nvidia-smi` query interface.
pub struct NvidiaSmiSource {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    system: Option<Arc<SystemCollector>>,
}

impl NvidiaSmiSource {
    /// Build a source using `nvidia-smi` from `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`GpuWatchError::BackendUnavailable`] when the binary cannot be
    /// found.
    pub fn new(options: &SourceOptions) -> Result<Self, GpuWatchError> {
        Self::with_program(PROGRAM, options)
    }

    /// Build a source invoking a specific executable.
    pub fn with_program(
        program: impl AsRef<Path>,
        options: &SourceOptions,
    ) -> Result<Self, GpuWatchError> {
        let program = command::require_program(ProviderKind::NvidiaSmi, program.as_ref())?;
        Ok(Self {
            program,
            args: vec![
                format!("--query-gpu={}", QUERY_FIELDS.join(",")),
                "--format=csv,noheader,nounits".to_string(),
            ],
            timeout: options.command_timeout,
            system: options.system_collector(),
        })
    }
}

#[async_trait]
impl SnapshotSource for NvidiaSmiSource {
    fn kind(&self) -> ProviderKind {
        ProviderKind::NvidiaSmi
    }

    async fn snapshot(&self) -> Option<TelemetrySnapshot> {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        let stdout = match command::run(&self.program, &args, self.timeout).await {
            Ok(stdout) => stdout,
            Err(e) => {
                error!(provider = %self.kind(), error = %e, "failed to execute nvidia-smi");
                return None;
            }
        };

        let gpus = parse_query_output(&stdout);
        let system = self.system.as_ref().and_then(|s| s.collect());
        Some(TelemetrySnapshot::now(gpus).with_system(system))
    }
}

/// Map `csv,noheader,nounits` output onto readings.
///
/// Blank lines are ignored and a line whose index column does not parse is
/// skipped.  Numeric columns reported as `[N/A]` (or otherwise unparsable)
/// become `None`.
pub fn parse_query_output(stdout: &str) -> Vec<GpuReading> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Option<GpuReading> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    let column = |field: &str| {
        QUERY_FIELDS
            .iter()
            .position(|f| *f == field)
            .and_then(|i| parts.get(i).copied())
    };

    let id = match column("index").map(str::parse::<u32>) {
        Some(Ok(id)) => id,
        _ => {
            debug!(line, "skipping nvidia-smi line without a valid index");
            return None;
        }
    };

    Some(GpuReading {
        id,
        uuid: column("uuid").and_then(text),
        name: column("name").and_then(text),
        driver_version: column("driver_version").and_then(text),
        utilization: column("utilization.gpu").and_then(number),
        memory_used: column("memory.used").and_then(number),
        memory_free: column("memory.free").and_then(number),
        memory_total: column("memory.total").and_then(number),
        temperature: column("temperature.gpu").and_then(number),
        power_usage: column("power.draw").and_then(number),
        power_limit: column("power.limit").and_then(number),
        ..Default::default()
    })
}

fn text(value: &str) -> Option<String> {
    (!value.is_empty() && !is_not_available(value)).then(|| value.to_string())
}

fn number(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn is_not_available(value: &str) -> bool {
    value.eq_ignore_ascii_case("[N/A]") || value.eq_ignore_ascii_case("N/A")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_GPUS: &str = "\
0, GPU-1111, NVIDIA GeForce RTX 4090, 550.54, 1024, 23540, 24564, 37, 4, 45, 61.20, 450.00
1, GPU-2222, NVIDIA A100-SXM4-40GB, 550.54, 0, 40326, 40960, 0, 0, 31, [N/A], [N/A]

";

    #[test]
    fn parses_each_line_positionally() {
        let gpus = parse_query_output(TWO_GPUS);
        assert_eq!(gpus.len(), 2);

        let first = &gpus[0];
        assert_eq!(first.id, 0);
        assert_eq!(first.uuid.as_deref(), Some("GPU-1111"));
        assert_eq!(first.name.as_deref(), Some("NVIDIA GeForce RTX 4090"));
        assert_eq!(first.driver_version.as_deref(), Some("550.54"));
        assert_eq!(first.memory_used, Some(1024.0));
        assert_eq!(first.memory_free, Some(23540.0));
        assert_eq!(first.memory_total, Some(24564.0));
        assert_eq!(first.utilization, Some(37.0));
        assert_eq!(first.temperature, Some(45.0));
        assert_eq!(first.power_usage, Some(61.2));
        assert_eq!(first.power_limit, Some(450.0));
        assert!(first.processes.is_empty());
    }

    #[test]
    fn not_available_columns_become_none() {
        let gpus = parse_query_output(TWO_GPUS);
        assert_eq!(gpus[1].id, 1);
        assert_eq!(gpus[1].power_usage, None);
        assert_eq!(gpus[1].power_limit, None);
        assert_eq!(gpus[1].temperature, Some(31.0));
    }

    #[test]
    fn short_line_leaves_trailing_fields_empty() {
        let gpus = parse_query_output("3, GPU-3333, Tesla T4");
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].id, 3);
        assert_eq!(gpus[0].name.as_deref(), Some("Tesla T4"));
        assert_eq!(gpus[0].memory_used, None);
    }

    #[test]
    fn line_without_index_is_skipped() {
        let gpus = parse_query_output("garbage line\n0, GPU-1, Tesla T4");
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].id, 0);
    }

    #[test]
    fn empty_output_yields_no_gpus() {
        assert!(parse_query_output("").is_empty());
        assert!(parse_query_output("\n\n").is_empty());
    }

    #[test]
    fn missing_binary_fails_construction() {
        let result = NvidiaSmiSource::with_program(
            "/nonexistent/bin/nvidia-smi",
            &SourceOptions::default(),
        );
        assert!(matches!(
            result,
            Err(GpuWatchError::BackendUnavailable { provider: ProviderKind::NvidiaSmi, .. })
        ));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::command::testing::script;

        fn options() -> SourceOptions {
            SourceOptions::default().with_system_metrics(false)
        }

        #[tokio::test]
        async fn snapshot_from_fake_binary() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(
                dir.path(),
                "nvidia-smi",
                "echo '0, GPU-1111, Tesla T4, 535.1, 100, 15000, 15100, 12, 1, 40, 30.5, 70.0'",
            );
            let source = NvidiaSmiSource::with_program(&program, &options()).unwrap();

            let snapshot = source.snapshot().await.expect("snapshot");
            assert_eq!(snapshot.gpus.len(), 1);
            assert_eq!(snapshot.gpus[0].utilization, Some(12.0));
            assert!(snapshot.system.is_none());
        }

        #[tokio::test]
        async fn non_zero_exit_yields_none() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(dir.path(), "nvidia-smi", "echo 'NVML: driver not loaded' >&2\nexit 9");
            let source = NvidiaSmiSource::with_program(&program, &options()).unwrap();

            assert!(source.snapshot().await.is_none());
        }

        #[tokio::test]
        async fn fake_binary_receives_query_arguments() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(
                dir.path(),
                "nvidia-smi",
                r#"case "$1" in --query-gpu=index,uuid,name,*) ;; *) exit 1 ;; esac
[ "$2" = "--format=csv,noheader,nounits" ] || exit 1
echo '0, GPU-1, args-ok'"#,
            );
            let source = NvidiaSmiSource::with_program(&program, &options()).unwrap();

            let snapshot = source.snapshot().await.expect("snapshot");
            assert_eq!(snapshot.gpus[0].name.as_deref(), Some("args-ok"));
        }
    }
}
