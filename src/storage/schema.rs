//! Stored row shapes for history, snapshots and history queries
//!
//! ## Tables
//!
//! - `devices` - the registry, seeded from configuration
//! - `monitoring_cycles` - one row per polling pass
//! - `monitoring_history` - append-only probe results, unique per (device, cycle)
//! - `status_snapshot` - latest result per device, overwritten each cycle
//!
//! Timestamps are stored as Unix milliseconds (UTC). Device times keep the offset
//! the device reported, so they are stored as RFC 3339 text.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CycleId, DeviceId, ProbeResult, ProbeStatus};

/// One row of the append-only probe history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub cycle_id: CycleId,

    #[serde(flatten)]
    pub result: ProbeResult,
}

/// Latest known state of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Cycle that produced `result`
    pub cycle_id: CycleId,

    /// Non-SUCCESS results in a row, reset by a SUCCESS
    pub consecutive_failures: u32,

    #[serde(flatten)]
    pub result: ProbeResult,
}

impl StatusSnapshot {
    /// Snapshot following `previous` after `result` arrived in `cycle_id`
    pub fn advance(
        previous: Option<&StatusSnapshot>,
        cycle_id: CycleId,
        result: ProbeResult,
    ) -> Self {
        let consecutive_failures = if result.status.is_success() {
            0
        } else {
            previous.map_or(0, |p| p.consecutive_failures).saturating_add(1)
        };

        Self {
            cycle_id,
            consecutive_failures,
            result,
        }
    }
}

/// What happened to an ingested result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First delivery: history row written, snapshot and counter updated
    Recorded { consecutive_failures: u32 },

    /// (device, cycle) was already recorded; nothing changed
    Duplicate,
}

/// History lookup for one device, newest first
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub device_id: DeviceId,

    /// Inclusive lower bound on `checked_at`
    pub start: Option<DateTime<Utc>>,

    /// Inclusive upper bound on `checked_at`
    pub end: Option<DateTime<Utc>>,

    pub limit: usize,
}

impl HistoryQuery {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 1_000;

    pub fn latest(device_id: DeviceId, limit: usize) -> Self {
        Self {
            device_id,
            start: None,
            end: None,
            limit,
        }
    }

    pub fn includes(&self, checked_at: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| checked_at >= start)
            && self.end.is_none_or(|end| checked_at <= end)
    }
}

/// Checks and distinct devices seen with one status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusTally {
    pub checks: u64,
    pub devices: u64,
}

/// Fleet-wide totals over the history recorded since `since`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetStats {
    pub since: DateTime<Utc>,
    pub total_checks: u64,

    /// Checks whose reachability phase passed
    pub reachable_checks: u64,

    /// Distinct devices with at least one check
    pub devices_checked: u64,

    /// Every status is present, with zeros where nothing was seen
    pub by_status: BTreeMap<ProbeStatus, StatusTally>,
}

impl FleetStats {
    pub fn empty(since: DateTime<Utc>) -> Self {
        Self {
            since,
            total_checks: 0,
            reachable_checks: 0,
            devices_checked: 0,
            by_status: ProbeStatus::ALL
                .iter()
                .map(|status| (*status, StatusTally::default()))
                .collect(),
        }
    }

    /// Tally the results checked at or after `since`
    pub fn from_results<'a>(
        since: DateTime<Utc>,
        results: impl IntoIterator<Item = &'a ProbeResult>,
    ) -> Self {
        let mut stats = Self::empty(since);
        let mut devices = HashSet::new();
        let mut per_status: HashSet<(ProbeStatus, DeviceId)> = HashSet::new();

        for result in results.into_iter().filter(|r| r.checked_at >= since) {
            stats.total_checks += 1;
            if result.reachable {
                stats.reachable_checks += 1;
            }
            devices.insert(result.device_id);

            let tally = stats.by_status.entry(result.status).or_default();
            tally.checks += 1;
            if per_status.insert((result.status, result.device_id)) {
                tally.devices += 1;
            }
        }

        stats.devices_checked = devices.len() as u64;
        stats
    }
}
