pub mod actors;
#[cfg(feature = "api")]
pub mod api;
pub mod config;
pub mod cycle;
pub mod pool;
pub mod probe;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod util;

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a device in the registry
pub type DeviceId = i64;

/// Identifier of a monitoring cycle
pub type CycleId = i64;

/// Firmware family of a DVR, which decides the status endpoint and payload format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ProtocolType {
    CpPlus,
    Dahua,
    Hikvision,
}

impl ProtocolType {
    /// Resolve a vendor name as it appears in device inventories
    ///
    /// Inventories spell vendors in many ways (`CPPLUS_ORANGE`, `cp-plus`, `hik`,
    /// `DS-7600`, `dh-nvr`, ...), so matching is by substring on the lowercased name.
    pub fn from_vendor(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();

        if ["cpplus", "cp-plus", "cp_plus"]
            .iter()
            .any(|v| name.contains(v))
        {
            return Some(ProtocolType::CpPlus);
        }

        if name.contains("hik") || name.contains("ds-") {
            return Some(ProtocolType::Hikvision);
        }

        if name == "dh" || ["dahua", "dahuva", "dh-"].iter().any(|v| name.contains(v)) {
            return Some(ProtocolType::Dahua);
        }

        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::CpPlus => "cpplus",
            ProtocolType::Dahua => "dahua",
            ProtocolType::Hikvision => "hikvision",
        }
    }
}

impl std::fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ProtocolType {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::str::FromStr for ProtocolType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProtocolType::from_vendor(s).ok_or_else(|| anyhow::anyhow!("unsupported DVR type: {s}"))
    }
}

/// A pollable recording device as supplied by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub protocol: ProtocolType,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

fn default_active() -> bool {
    true
}

impl Device {
    /// Base URL of the device's management endpoint
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

/// Terminal classification of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeStatus {
    Success,
    Unreachable,
    Timeout,
    AuthFailed,
    ProtocolError,
    InternalError,
}

impl ProbeStatus {
    pub const ALL: [ProbeStatus; 6] = [
        ProbeStatus::Success,
        ProbeStatus::Unreachable,
        ProbeStatus::Timeout,
        ProbeStatus::AuthFailed,
        ProbeStatus::ProtocolError,
        ProbeStatus::InternalError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Success => "SUCCESS",
            ProbeStatus::Unreachable => "UNREACHABLE",
            ProbeStatus::Timeout => "TIMEOUT",
            ProbeStatus::AuthFailed => "AUTH_FAILED",
            ProbeStatus::ProtocolError => "PROTOCOL_ERROR",
            ProbeStatus::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeStatus::Success)
    }
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProbeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProbeStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown probe status: {s}"))
    }
}

/// Outcome of probing one device
///
/// Created once by the prober (or by the pool for timeouts and faults) and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub device_id: DeviceId,
    pub status: ProbeStatus,

    /// Whether the reachability phase succeeded
    pub reachable: bool,

    /// Duration of the reachability phase
    pub reachability_latency_ms: Option<u64>,

    /// Duration of the protocol phase (absent if it never ran)
    pub protocol_latency_ms: Option<u64>,

    /// Raw diagnostic: device error text, HTTP status, or the payload excerpt
    pub diagnostic: String,

    /// Clock reported by the device (SUCCESS only)
    pub device_time: Option<DateTime<FixedOffset>>,

    pub checked_at: DateTime<Utc>,
}

impl ProbeResult {
    /// Result for a device whose probe never produced its own result
    pub fn failed(
        device_id: DeviceId,
        status: ProbeStatus,
        diagnostic: impl Into<String>,
        checked_at: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            status,
            reachable: false,
            reachability_latency_ms: None,
            protocol_latency_ms: None,
            diagnostic: diagnostic.into(),
            device_time: None,
            checked_at,
        }
    }

    /// Device clock minus check time, in seconds
    pub fn clock_skew_secs(&self) -> Option<i64> {
        self.device_time
            .map(|device_time| (device_time.with_timezone(&Utc) - self.checked_at).num_seconds())
    }

    /// Total latency across both phases
    pub fn latency_ms(&self) -> Option<u64> {
        match (self.reachability_latency_ms, self.protocol_latency_ms) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        }
    }
}

/// Lifecycle state of a monitoring cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    Running,
    Completed,
    Aborted,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Running => "RUNNING",
            CycleStatus::Completed => "COMPLETED",
            CycleStatus::Aborted => "ABORTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(CycleStatus::Running),
            "COMPLETED" => Some(CycleStatus::Completed),
            "ABORTED" => Some(CycleStatus::Aborted),
            _ => None,
        }
    }
}

/// What caused a cycle to be admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    /// First invocation with no recorded cycle
    AutoStart,
    /// Regular cadence
    Scheduled,
    /// Operator request, bypasses cadence
    Manual,
}

impl CycleTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleTrigger::AutoStart => "auto_start",
            CycleTrigger::Scheduled => "scheduled",
            CycleTrigger::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_start" => Some(CycleTrigger::AutoStart),
            "scheduled" => Some(CycleTrigger::Scheduled),
            "manual" => Some(CycleTrigger::Manual),
            _ => None,
        }
    }
}

/// Per-classification counts of a finished cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub total: usize,
    pub counts: BTreeMap<ProbeStatus, usize>,
}

impl CycleSummary {
    pub fn from_results(results: &[ProbeResult]) -> Self {
        let mut counts = BTreeMap::new();
        for result in results {
            *counts.entry(result.status).or_insert(0) += 1;
        }

        Self {
            total: results.len(),
            counts,
        }
    }

    pub fn count(&self, status: ProbeStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

/// One polling pass over the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringCycle {
    pub id: CycleId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub trigger: CycleTrigger,
    pub status: CycleStatus,
    pub summary: Option<CycleSummary>,
    pub error: Option<String>,
}
