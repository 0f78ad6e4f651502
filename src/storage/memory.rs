//! In-memory storage backend (no persistence)
//!
//! Used by tests and by the `none` storage mode. Same semantics as the SQLite
//! backend, including (device, cycle) idempotency; everything is lost on restart.
//!
//! History is capped per device (oldest rows go first) and retention cleanup also
//! drops finished cycles, so a long-running hub without a database stays bounded.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{FleetStats, HistoryEntry, HistoryQuery, IngestOutcome, StatusSnapshot};
use crate::registry::DeviceFilter;
use crate::{
    CycleId, CycleStatus, CycleSummary, CycleTrigger, Device, DeviceId, MonitoringCycle,
    ProbeResult,
};

/// History rows kept per device, matching the largest page a query can return
pub const DEFAULT_HISTORY_CAP: usize = HistoryQuery::MAX_LIMIT;

#[derive(Default)]
struct State {
    devices: BTreeMap<DeviceId, Device>,
    cycles: BTreeMap<CycleId, MonitoringCycle>,
    /// Per device, oldest first
    history: BTreeMap<DeviceId, VecDeque<HistoryEntry>>,
    recorded: HashSet<(DeviceId, CycleId)>,
    snapshots: BTreeMap<DeviceId, StatusSnapshot>,
}

impl State {
    fn history_rows(&self) -> usize {
        self.history.values().map(VecDeque::len).sum()
    }
}

pub struct MemoryBackend {
    state: RwLock<State>,
    history_cap: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::with_history_cap(DEFAULT_HISTORY_CAP)
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `cap` history rows per device (at least one)
    pub fn with_history_cap(cap: usize) -> Self {
        Self {
            state: RwLock::new(State::default()),
            history_cap: cap.max(1),
        }
    }

    /// Number of (device, cycle) pairs still remembered for deduplication
    pub async fn tracked_results(&self) -> usize {
        self.state.read().await.recorded.len()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn upsert_device(&self, device: &Device) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let consecutive_failures = state
            .devices
            .get(&device.id)
            .map_or(device.consecutive_failures, |d| d.consecutive_failures);

        state.devices.insert(
            device.id,
            Device {
                consecutive_failures,
                ..device.clone()
            },
        );
        Ok(())
    }

    async fn list_devices(&self, filter: &DeviceFilter) -> StorageResult<Vec<Device>> {
        let state = self.state.read().await;
        Ok(state
            .devices
            .values()
            .filter(|device| filter.matches(device))
            .cloned()
            .collect())
    }

    async fn begin_cycle(
        &self,
        trigger: CycleTrigger,
        started_at: DateTime<Utc>,
    ) -> StorageResult<MonitoringCycle> {
        let mut state = self.state.write().await;
        let id = state.cycles.keys().next_back().map_or(1, |last| last + 1);

        let cycle = MonitoringCycle {
            id,
            started_at,
            completed_at: None,
            trigger,
            status: CycleStatus::Running,
            summary: None,
            error: None,
        };
        state.cycles.insert(id, cycle.clone());

        debug!("in-memory backend: began cycle {id}");
        Ok(cycle)
    }

    async fn complete_cycle(
        &self,
        cycle_id: CycleId,
        completed_at: DateTime<Utc>,
        summary: &CycleSummary,
    ) -> StorageResult<bool> {
        let mut state = self.state.write().await;
        match state.cycles.get_mut(&cycle_id) {
            Some(cycle) if cycle.status == CycleStatus::Running => {
                cycle.status = CycleStatus::Completed;
                cycle.completed_at = Some(completed_at);
                cycle.summary = Some(summary.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn abort_cycle(
        &self,
        cycle_id: CycleId,
        aborted_at: DateTime<Utc>,
        reason: &str,
    ) -> StorageResult<bool> {
        let mut state = self.state.write().await;
        match state.cycles.get_mut(&cycle_id) {
            Some(cycle) if cycle.status == CycleStatus::Running => {
                cycle.status = CycleStatus::Aborted;
                cycle.completed_at = Some(aborted_at);
                cycle.error = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_cycle(&self, cycle_id: CycleId) -> StorageResult<Option<MonitoringCycle>> {
        Ok(self.state.read().await.cycles.get(&cycle_id).cloned())
    }

    async fn latest_cycle(&self) -> StorageResult<Option<MonitoringCycle>> {
        let state = self.state.read().await;
        Ok(state
            .cycles
            .values()
            .max_by_key(|cycle| (cycle.started_at, cycle.id))
            .cloned())
    }

    async fn record_result(
        &self,
        cycle_id: CycleId,
        result: &ProbeResult,
    ) -> StorageResult<IngestOutcome> {
        let mut state = self.state.write().await;

        if !state.devices.contains_key(&result.device_id) {
            return Err(StorageError::UnknownDevice(result.device_id));
        }
        if !state.recorded.insert((result.device_id, cycle_id)) {
            return Ok(IngestOutcome::Duplicate);
        }

        let cap = self.history_cap;
        let mut evicted = Vec::new();
        let rows = state.history.entry(result.device_id).or_default();
        rows.push_back(HistoryEntry {
            cycle_id,
            result: result.clone(),
        });
        while rows.len() > cap {
            if let Some(old) = rows.pop_front() {
                evicted.push((old.result.device_id, old.cycle_id));
            }
        }
        for key in evicted {
            state.recorded.remove(&key);
        }

        let snapshot = StatusSnapshot::advance(
            state.snapshots.get(&result.device_id),
            cycle_id,
            result.clone(),
        );
        let consecutive_failures = snapshot.consecutive_failures;
        state.snapshots.insert(result.device_id, snapshot);

        if let Some(device) = state.devices.get_mut(&result.device_id) {
            device.consecutive_failures = consecutive_failures;
        }

        Ok(IngestOutcome::Recorded {
            consecutive_failures,
        })
    }

    async fn query_history(&self, query: HistoryQuery) -> StorageResult<Vec<HistoryEntry>> {
        let state = self.state.read().await;

        let mut rows: Vec<HistoryEntry> = state
            .history
            .get(&query.device_id)
            .into_iter()
            .flatten()
            .filter(|entry| query.includes(entry.result.checked_at))
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            b.result
                .checked_at
                .cmp(&a.result.checked_at)
                .then(b.cycle_id.cmp(&a.cycle_id))
        });
        rows.truncate(query.limit);

        Ok(rows)
    }

    async fn snapshot(&self, device_id: DeviceId) -> StorageResult<Option<StatusSnapshot>> {
        Ok(self.state.read().await.snapshots.get(&device_id).cloned())
    }

    async fn snapshots(&self) -> StorageResult<Vec<StatusSnapshot>> {
        Ok(self.state.read().await.snapshots.values().cloned().collect())
    }

    async fn history_stats(&self, since: DateTime<Utc>) -> StorageResult<FleetStats> {
        let state = self.state.read().await;
        let results = state.history.values().flatten().map(|entry| &entry.result);
        Ok(FleetStats::from_results(since, results))
    }

    async fn cleanup_old_history(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut state = self.state.write().await;
        let State {
            cycles,
            history,
            recorded,
            ..
        } = &mut *state;

        let mut deleted = 0;
        for rows in history.values_mut() {
            rows.retain(|entry| {
                let keep = entry.result.checked_at >= before;
                if !keep {
                    recorded.remove(&(entry.result.device_id, entry.cycle_id));
                    deleted += 1;
                }
                keep
            });
        }
        history.retain(|_, rows| !rows.is_empty());

        // the newest cycle stays so ids keep increasing and the cadence survives
        let newest = cycles.keys().next_back().copied();
        cycles.retain(|id, cycle| {
            Some(*id) == newest
                || cycle.status == CycleStatus::Running
                || cycle.started_at >= before
        });

        Ok(deleted)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let state = self.state.read().await;
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("history_rows".to_string(), state.history_rows().to_string()),
            ]),
        })
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let state = self.state.read().await;
        Ok(format!(
            "In-Memory: {} devices, {} cycles, {} history rows",
            state.devices.len(),
            state.cycles.len(),
            state.history_rows()
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
