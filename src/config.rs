use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HLS output parameters.
    #[serde(default)]
    pub hls: HlsConfig,
    /// Admission and worker-pool limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Supervisor reconnect backoff.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Health scanner and memory governor.
    #[serde(default)]
    pub health: HealthConfig,
    /// Periodic CSV metrics.
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// HTTP API configuration (optional).
    #[serde(default)]
    pub api: ApiConfig,
}

/// HLS output parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct HlsConfig {
    /// Root directory under which per-stream segment directories are created.
    #[serde(default = "default_hls_root")]
    pub root: PathBuf,
    /// Output frame rate of the encoded stream.
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    /// Duration of one .ts segment in seconds.
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,
    /// Number of segments kept in the sliding-window playlist.
    #[serde(default = "default_playlist_window")]
    pub playlist_window: u32,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            root: default_hls_root(),
            target_fps: default_target_fps(),
            segment_seconds: default_segment_seconds(),
            playlist_window: default_playlist_window(),
        }
    }
}

/// Admission and worker-pool limits.
#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Hard cap on registered streams.
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
    /// Fixed size of the pipeline worker pool.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Minimum spacing between two first-grab attempts behind the gate.
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_streams: default_max_streams(),
            worker_threads: default_worker_threads(),
            startup_delay_ms: default_startup_delay_ms(),
        }
    }
}

/// Supervisor reconnect backoff: delay = min(base × attempt, max).
#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_reconnect_base_ms(),
            max_delay_ms: default_reconnect_max_ms(),
        }
    }
}

/// Health scanner and memory governor cadences and thresholds.
#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// A stream with no frame for this long is recycled.
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,
    /// Recycles before the stream is finalized as dead.
    #[serde(default = "default_max_recycles")]
    pub max_recycles: u32,
    /// Health scan cadence.
    #[serde(default = "default_health_interval_ms")]
    pub check_interval_ms: u64,
    /// Memory scan cadence.
    #[serde(default = "default_memory_interval_ms")]
    pub memory_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stream_timeout_ms: default_stream_timeout_ms(),
            max_recycles: default_max_recycles(),
            check_interval_ms: default_health_interval_ms(),
            memory_interval_ms: default_memory_interval_ms(),
        }
    }
}

/// Periodic CSV metrics append.
#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_csv_path")]
    pub csv_path: PathBuf,
    #[serde(default = "default_csv_interval_ms")]
    pub csv_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            csv_path: default_csv_path(),
            csv_interval_ms: default_csv_interval_ms(),
        }
    }
}

/// HTTP API configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Whether to enable the HTTP API.
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    /// Port to listen on.
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: default_api_enabled(), port: default_api_port() }
    }
}

fn default_hls_root() -> PathBuf { PathBuf::from("./hls") }
fn default_target_fps() -> u32 { 10 }
fn default_segment_seconds() -> u32 { 4 }
fn default_playlist_window() -> u32 { 3 }
fn default_max_streams() -> usize { 100 }
fn default_worker_threads() -> usize { 64 }
fn default_startup_delay_ms() -> u64 { 800 }
fn default_reconnect_base_ms() -> u64 { 5_000 }
fn default_reconnect_max_ms() -> u64 { 60_000 }
fn default_stream_timeout_ms() -> u64 { 600_000 }
fn default_max_recycles() -> u32 { 10 }
fn default_health_interval_ms() -> u64 { 120_000 }
fn default_memory_interval_ms() -> u64 { 60_000 }
fn default_csv_path() -> PathBuf { PathBuf::from("./vidgate-metrics.csv") }
fn default_csv_interval_ms() -> u64 { 180_000 }
fn default_api_enabled() -> bool { true }
fn default_api_port() -> u16 { 8080 }

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hls.target_fps == 0 || self.hls.target_fps > 60 {
            return Err(GatewayError::Config("target_fps must be in 1..=60".into()));
        }
        if self.hls.segment_seconds == 0 {
            return Err(GatewayError::Config("segment_seconds must be > 0".into()));
        }
        if self.hls.playlist_window == 0 {
            return Err(GatewayError::Config("playlist_window must be > 0".into()));
        }
        if self.limits.max_streams == 0 {
            return Err(GatewayError::Config("max_streams must be > 0".into()));
        }
        if self.limits.worker_threads == 0 {
            return Err(GatewayError::Config("worker_threads must be > 0".into()));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(GatewayError::Config("base_delay_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect.base_delay_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect.max_delay_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.health.stream_timeout_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.limits.startup_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().expect("default config validates");
        assert_eq!(cfg.hls.target_fps, 10);
        assert_eq!(cfg.limits.max_streams, 100);
        assert_eq!(cfg.health.max_recycles, 10);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [hls]
            target_fps = 8

            [limits]
            max_streams = 10
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.hls.target_fps, 8);
        assert_eq!(cfg.hls.segment_seconds, 4);
        assert_eq!(cfg.limits.max_streams, 10);
        assert_eq!(cfg.limits.worker_threads, 64);
        assert_eq!(cfg.reconnect.max_delay_ms, 60_000);
    }

    #[test]
    fn zero_fps_rejected() {
        let cfg: Config = toml::from_str("[hls]\ntarget_fps = 0\n").expect("parse");
        assert!(cfg.validate().is_err());
    }
}
