use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;
use tracing::trace;

use crate::Device;

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Retention period in days (history older than this is deleted)
        #[serde(default = "default_retention_days")]
        retention_days: u32,

        /// How often the retention cleanup runs
        #[serde(default = "default_cleanup_interval_hours")]
        cleanup_interval_hours: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: default_retention_days(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./dvr-monitoring.db")
}

fn default_retention_days() -> u32 {
    30
}

fn default_cleanup_interval_hours() -> u32 {
    24
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// Devices seeded into the registry at start-up
    #[serde(default)]
    pub devices: Vec<Device>,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    /// Storage configuration (optional - defaults to SQLite)
    pub storage: Option<StorageConfig>,

    #[serde(default)]
    pub api: ApiSettings,
}

/// Cadence and fan-out of monitoring cycles
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MonitoringConfig {
    /// Minimum time between two cycle starts
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// How often the scheduler loop checks whether a cycle is due
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// Expected duration of one cycle
    #[serde(default = "default_expected_cycle_secs")]
    pub expected_cycle_secs: u64,

    /// A cycle running longer than `stale_factor * expected_cycle_secs` is aborted
    #[serde(default = "default_stale_factor")]
    pub stale_factor: u32,

    /// Simultaneous probes per cycle
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound applied to any requested concurrency
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Only poll devices of this group (all groups if unset)
    pub group: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            tick_secs: default_tick_secs(),
            expected_cycle_secs: default_expected_cycle_secs(),
            stale_factor: default_stale_factor(),
            concurrency: default_concurrency(),
            max_concurrency: default_max_concurrency(),
            group: None,
        }
    }
}

impl MonitoringConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    /// Running time after which a cycle counts as stuck
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(
            self.expected_cycle_secs.saturating_mul(u64::from(self.stale_factor.max(1))),
        )
    }
}

fn default_interval_secs() -> u64 {
    300
}

fn default_tick_secs() -> u64 {
    30
}

fn default_expected_cycle_secs() -> u64 {
    300
}

fn default_stale_factor() -> u32 {
    2
}

fn default_concurrency() -> usize {
    50
}

fn default_max_concurrency() -> usize {
    200
}

/// Strategy for the reachability phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReachabilityMode {
    /// One ICMP echo request through the system `ping` utility
    #[default]
    Icmp,
    /// TCP connect to the device's management port
    Tcp,
}

/// Per-device probe settings
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub reachability: ReachabilityMode,

    #[serde(default = "default_reachability_timeout_ms")]
    pub reachability_timeout_ms: u64,

    #[serde(default = "default_protocol_timeout_ms")]
    pub protocol_timeout_ms: u64,

    /// Hard ceiling for a whole device probe, enforced by the worker pool
    #[serde(default = "default_device_timeout_ms")]
    pub device_timeout_ms: u64,

    /// Offset assumed for device clocks that report no offset, e.g. "+05:30"
    #[serde(default = "default_device_utc_offset")]
    pub device_utc_offset: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            reachability: ReachabilityMode::default(),
            reachability_timeout_ms: default_reachability_timeout_ms(),
            protocol_timeout_ms: default_protocol_timeout_ms(),
            device_timeout_ms: default_device_timeout_ms(),
            device_utc_offset: default_device_utc_offset(),
        }
    }
}

impl ProbeConfig {
    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_millis(self.reachability_timeout_ms)
    }

    pub fn protocol_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol_timeout_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    pub fn utc_offset(&self) -> anyhow::Result<FixedOffset> {
        parse_utc_offset(&self.device_utc_offset)
    }
}

fn default_reachability_timeout_ms() -> u64 {
    1_000
}

fn default_protocol_timeout_ms() -> u64 {
    3_000
}

fn default_device_timeout_ms() -> u64 {
    10_000
}

fn default_device_utc_offset() -> String {
    "+00:00".to_string()
}

/// Parse offsets of the form `+05:30`, `-0300` or `Z`
pub fn parse_utc_offset(raw: &str) -> anyhow::Result<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| anyhow::anyhow!("invalid offset"));
    }

    let (sign, rest) = match raw.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => anyhow::bail!("offset must start with '+' or '-': {raw}"),
    };

    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        anyhow::bail!("offset must look like +HH:MM: {raw}");
    }

    let hours: i32 = digits[..2].parse()?;
    let minutes: i32 = digits[2..].parse()?;

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| anyhow::anyhow!("offset out of range: {raw}"))
}

/// Hub HTTP API settings
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    pub token: Option<String>,

    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            enable_cors: default_enable_cors(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_enable_cors() -> bool {
    true
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    parse_config(&file_content)
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    serde_json::from_str(content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided! ({e})"))
        .inspect(|config: &Config| trace!("loaded config with {} devices", config.devices.len()))
}
