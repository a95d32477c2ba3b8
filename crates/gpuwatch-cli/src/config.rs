//! Service configuration: defaults, an optional TOML file, then
//! `GPU_MONITOR_*` environment overrides.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use gpuwatch_broadcast::MAX_BROADCAST_HZ;
use gpuwatch_server::DEFAULT_PORT;
use gpuwatch_telemetry::MIN_POLL_INTERVAL;
use gpuwatch_types::{GpuWatchError, ProviderKind};
use serde::Deserialize;

/// Resolved service settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Milliseconds between hardware polls.
    pub poll_interval_ms: u64,
    /// Broadcast rate ceiling, in messages per second.
    pub max_broadcast_hz: u32,
    /// Attach host CPU/memory metrics to each snapshot.
    pub enable_system_metrics: bool,
    /// Forced telemetry provider.  `None` walks the default order.
    pub provider: Option<String>,
    pub host: String,
    pub port: u16,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_broadcast_hz: 5,
            enable_system_metrics: true,
            provider: None,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Build the configuration for this process.
    ///
    /// `path` comes from `--config` or `$GPUWATCH_CONFIG`.  A named file that
    /// cannot be read is an error.
    pub fn resolve(path: Option<&Path>) -> Result<Config, GpuWatchError> {
        let mut cfg = match path {
            Some(p) => load_from(p)?,
            None => Config::default(),
        };
        apply_env_overrides(&mut cfg)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check ranges and the provider name.
    pub fn validate(&self) -> Result<(), GpuWatchError> {
        let min_ms = MIN_POLL_INTERVAL.as_millis() as u64;
        if self.poll_interval_ms < min_ms {
            return Err(GpuWatchError::Config(format!(
                "poll_interval_ms must be at least {min_ms}, got {}",
                self.poll_interval_ms
            )));
        }
        if !(1..=MAX_BROADCAST_HZ).contains(&self.max_broadcast_hz) {
            return Err(GpuWatchError::Config(format!(
                "max_broadcast_hz must be between 1 and {MAX_BROADCAST_HZ}, got {}",
                self.max_broadcast_hz
            )));
        }
        if self.host.trim().is_empty() {
            return Err(GpuWatchError::Config("host must not be empty".to_string()));
        }
        self.preferred_provider()?;
        Ok(())
    }

    /// The forced provider, if any.  Blank strings mean "auto".
    pub fn preferred_provider(&self) -> Result<Option<ProviderKind>, GpuWatchError> {
        match self.provider.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(name) => name.parse().map(Some),
        }
    }

    /// Resolve `host:port` to a listening address.
    pub async fn listen_addr(&self) -> Result<SocketAddr, GpuWatchError> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| GpuWatchError::Config(format!("cannot resolve host '{}': {e}", self.host)))?
            .next()
            .ok_or_else(|| GpuWatchError::Config(format!("host '{}' has no address", self.host)))
    }
}

/// Load a TOML file on top of the defaults.
pub(crate) fn load_from(path: &Path) -> Result<Config, GpuWatchError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        GpuWatchError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    toml::from_str(&raw).map_err(|e| {
        GpuWatchError::Config(format!("failed to parse config at {}: {e}", path.display()))
    })
}

/// Apply `GPU_MONITOR_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `GPU_MONITOR_POLL_INTERVAL_MS` | `poll_interval_ms` |
/// | `GPU_MONITOR_WS_MAX_RATE_HZ` | `max_broadcast_hz` |
/// | `GPU_MONITOR_ENABLE_SYSTEM_METRICS` | `enable_system_metrics` |
/// | `GPU_MONITOR_TELEMETRY_PROVIDER` | `provider` |
/// | `GPU_MONITOR_HOST` | `host` |
/// | `GPU_MONITOR_PORT` | `port` |
/// | `GPU_MONITOR_LOG_LEVEL` | `log_level` |
pub fn apply_env_overrides(cfg: &mut Config) -> Result<(), GpuWatchError> {
    apply_overrides(cfg, |key| std::env::var(key).ok())
}

pub(crate) fn apply_overrides<F>(cfg: &mut Config, lookup: F) -> Result<(), GpuWatchError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("GPU_MONITOR_POLL_INTERVAL_MS") {
        cfg.poll_interval_ms = parse_number("GPU_MONITOR_POLL_INTERVAL_MS", &v)?;
    }
    if let Some(v) = lookup("GPU_MONITOR_WS_MAX_RATE_HZ") {
        cfg.max_broadcast_hz = parse_number("GPU_MONITOR_WS_MAX_RATE_HZ", &v)?;
    }
    if let Some(v) = lookup("GPU_MONITOR_ENABLE_SYSTEM_METRICS") {
        cfg.enable_system_metrics = parse_flag("GPU_MONITOR_ENABLE_SYSTEM_METRICS", &v)?;
    }
    if let Some(v) = lookup("GPU_MONITOR_TELEMETRY_PROVIDER") {
        cfg.provider = Some(v);
    }
    if let Some(v) = lookup("GPU_MONITOR_HOST") {
        cfg.host = v;
    }
    if let Some(v) = lookup("GPU_MONITOR_PORT") {
        cfg.port = parse_number("GPU_MONITOR_PORT", &v)?;
    }
    if let Some(v) = lookup("GPU_MONITOR_LOG_LEVEL") {
        cfg.log_level = v;
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, GpuWatchError> {
    value
        .trim()
        .parse()
        .map_err(|_| GpuWatchError::Config(format!("{key}: '{value}' is not a valid number")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, GpuWatchError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(GpuWatchError::Config(format!("{key}: '{value}' is not a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.poll_interval_ms, 1000);
        assert_eq!(cfg.max_broadcast_hz, 5);
        assert!(cfg.enable_system_metrics);
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.host, "0.0.0.0");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.preferred_provider().unwrap(), None);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("gpuwatch.toml");
        std::fs::write(&path, "poll_interval_ms = 250\nprovider = \"nvtop\"\n").unwrap();

        let cfg = load_from(&path).expect("load ok");
        assert_eq!(cfg.poll_interval_ms, 250);
        assert_eq!(cfg.preferred_provider().unwrap(), Some(ProviderKind::Nvtop));
        assert_eq!(cfg.max_broadcast_hz, 5);
        assert_eq!(cfg.port, 5000);
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("gpuwatch.toml");
        std::fs::write(&path, "poll_interval = 250\n").unwrap();
        assert!(matches!(load_from(&path), Err(GpuWatchError::Config(_))));
    }

    #[test]
    fn missing_named_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let err = load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, GpuWatchError::Config(_)));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut cfg = Config { poll_interval_ms: 250, ..Config::default() };
        apply_overrides(
            &mut cfg,
            env(&[
                ("GPU_MONITOR_POLL_INTERVAL_MS", "500"),
                ("GPU_MONITOR_WS_MAX_RATE_HZ", "10"),
                ("GPU_MONITOR_ENABLE_SYSTEM_METRICS", "false"),
                ("GPU_MONITOR_TELEMETRY_PROVIDER", "nvidia-smi"),
                ("GPU_MONITOR_HOST", "127.0.0.1"),
                ("GPU_MONITOR_PORT", "8080"),
                ("GPU_MONITOR_LOG_LEVEL", "debug"),
            ]),
        )
        .expect("overrides ok");

        assert_eq!(cfg.poll_interval_ms, 500);
        assert_eq!(cfg.max_broadcast_hz, 10);
        assert!(!cfg.enable_system_metrics);
        assert_eq!(cfg.preferred_provider().unwrap(), Some(ProviderKind::NvidiaSmi));
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn unparseable_env_value_is_an_error() {
        let mut cfg = Config::default();
        let err = apply_overrides(&mut cfg, env(&[("GPU_MONITOR_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, GpuWatchError::Config(_)));
        assert_eq!(cfg.port, 5000);

        let err = apply_overrides(&mut cfg, env(&[("GPU_MONITOR_ENABLE_SYSTEM_METRICS", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, GpuWatchError::Config(_)));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let fast = Config { poll_interval_ms: 50, ..Config::default() };
        assert!(fast.validate().is_err());

        let silent = Config { max_broadcast_hz: 0, ..Config::default() };
        assert!(silent.validate().is_err());

        let flood = Config { max_broadcast_hz: 31, ..Config::default() };
        assert!(flood.validate().is_err());

        let edge = Config { poll_interval_ms: 100, max_broadcast_hz: 30, ..Config::default() };
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_provider() {
        let cfg = Config { provider: Some("rocm".to_string()), ..Config::default() };
        assert!(matches!(cfg.validate(), Err(GpuWatchError::Config(_))));
    }

    #[test]
    fn blank_provider_means_auto() {
        let cfg = Config { provider: Some("  ".to_string()), ..Config::default() };
        assert_eq!(cfg.preferred_provider().unwrap(), None);
    }

    #[tokio::test]
    async fn listen_addr_resolves_literal_ip() {
        let cfg = Config { host: "127.0.0.1".to_string(), port: 5123, ..Config::default() };
        let addr = cfg.listen_addr().await.expect("resolves");
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 5123)));
    }
}
