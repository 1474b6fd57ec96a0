//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::{debug, warn};

use crate::logging::LogFormat;

pub const PORT_RANGE: (i64, i64) = (1, 65_535);
pub const TIMEOUT_MS_RANGE: (i64, i64) = (500, 600_000);
pub const MAX_UPDATE_INTERVAL: Duration = Duration::from_secs(3_600);
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);

fn default_port() -> i64 {
    8_000
}

fn default_timeout_ms() -> i64 {
    2_000
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_watchdog_floor() -> Duration {
    Duration::from_secs(60)
}

fn default_watchdog_margin() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(60)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9_899))
}

/// Primary configuration object for the link daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "BK215_CONFIG";

    /// Load configuration from disk, respecting the `BK215_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        let loaded = Self::load_unvalidated(candidates)?;
        loaded
            .config
            .validate()
            .with_context(|| format!("invalid config file {}", loaded.source.display()))?;
        Ok(loaded)
    }

    /// Parse and clamp without checking structural invariants, for callers
    /// that apply overrides first. Call [`AppConfig::validate`] afterwards.
    pub fn load_unvalidated<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        Self::parse_unvalidated(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    fn parse_unvalidated(content: &str) -> Result<Self> {
        let mut config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        for adjustment in config.sanitize() {
            warn!("{adjustment}");
        }
        Ok(config)
    }

    /// Clamp numeric settings into their supported ranges. Returns one
    /// message per adjusted value.
    pub fn sanitize(&mut self) -> Vec<String> {
        self.device.sanitize()
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.device.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config = Self::parse_unvalidated(content)?;
        config.validate()?;
        Ok(config)
    }
}

/// Device endpoint and link behaviour.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: i64,
    /// Connect budget and command acknowledgement deadline.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i64,
    /// Zero projects every report immediately.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "update_interval_secs", default)]
    pub update_interval: Duration,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub debug_raw: bool,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            update_interval: Duration::ZERO,
            read_only: false,
            debug_raw: false,
            watchdog: WatchdogConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) -> Vec<String> {
        let mut adjustments = Vec::new();
        let host = self.host.trim();
        if host.len() != self.host.len() {
            self.host = host.to_owned();
        }
        if let Some(clamped) = clamp(self.port, PORT_RANGE) {
            adjustments.push(format!("device.port {} clamped to {}", self.port, clamped));
            self.port = clamped;
        }
        if let Some(clamped) = clamp(self.timeout_ms, TIMEOUT_MS_RANGE) {
            adjustments.push(format!(
                "device.timeout_ms {} clamped to {}",
                self.timeout_ms, clamped
            ));
            self.timeout_ms = clamped;
        }
        if self.update_interval > MAX_UPDATE_INTERVAL {
            adjustments.push(format!(
                "device.update_interval_secs {} clamped to {}",
                self.update_interval.as_secs(),
                MAX_UPDATE_INTERVAL.as_secs()
            ));
            self.update_interval = MAX_UPDATE_INTERVAL;
        }
        adjustments.extend(self.backoff.sanitize());
        adjustments
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("device.host must be set to the inverter's address"));
        }
        if self.watchdog.enabled && self.watchdog.check_interval.is_zero() {
            return Err(anyhow!("device.watchdog.check_interval_secs must be positive"));
        }
        Ok(())
    }

    /// Port after clamping.
    pub fn port(&self) -> u16 {
        self.port.clamp(PORT_RANGE.0, PORT_RANGE.1) as u16
    }

    /// Timeout budget after clamping.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.clamp(TIMEOUT_MS_RANGE.0, TIMEOUT_MS_RANGE.1) as u64)
    }
}

fn clamp(value: i64, (min, max): (i64, i64)) -> Option<i64> {
    let clamped = value.clamp(min, max);
    (clamped != value).then_some(clamped)
}

/// Idle watchdog settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "check_interval_secs", default = "default_check_interval")]
    pub check_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "floor_secs", default = "default_watchdog_floor")]
    pub floor: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "margin_secs", default = "default_watchdog_margin")]
    pub margin: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: default_check_interval(),
            floor: default_watchdog_floor(),
            margin: default_watchdog_margin(),
        }
    }
}

/// Reconnect backoff settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "base_secs", default = "default_backoff_base")]
    pub base: Duration,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "cap_secs", default = "default_backoff_cap")]
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: default_backoff_base(),
            factor: default_backoff_factor(),
            cap: default_backoff_cap(),
        }
    }
}

impl BackoffConfig {
    fn sanitize(&mut self) -> Vec<String> {
        let mut adjustments = Vec::new();
        if !(1.5..=1.6).contains(&self.factor) {
            let clamped = if self.factor.is_nan() {
                default_backoff_factor()
            } else {
                self.factor.clamp(1.5, 1.6)
            };
            adjustments.push(format!(
                "device.backoff.factor {} clamped to {}",
                self.factor, clamped
            ));
            self.factor = clamped;
        }
        if self.cap < MIN_BACKOFF {
            adjustments.push(format!(
                "device.backoff.cap_secs {} clamped to {}",
                self.cap.as_secs(),
                MIN_BACKOFF.as_secs()
            ));
            self.cap = MIN_BACKOFF;
        }
        if self.base < MIN_BACKOFF {
            adjustments.push(format!(
                "device.backoff.base_secs {} clamped to {}",
                self.base.as_secs(),
                MIN_BACKOFF.as_secs()
            ));
            self.base = MIN_BACKOFF;
        }
        if self.cap > default_backoff_cap() {
            adjustments.push(format!(
                "device.backoff.cap_secs {} clamped to {}",
                self.cap.as_secs(),
                default_backoff_cap().as_secs()
            ));
            self.cap = default_backoff_cap();
        }
        if self.base > self.cap {
            adjustments.push(format!(
                "device.backoff.base_secs {} clamped to {}",
                self.base.as_secs(),
                self.cap.as_secs()
            ));
            self.base = self.cap;
        }
        adjustments
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: LogFormat::default(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
