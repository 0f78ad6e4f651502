//! Storage backend trait definition

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use super::schema::{FleetStats, HistoryEntry, HistoryQuery, IngestOutcome, StatusSnapshot};
use crate::registry::DeviceFilter;
use crate::{CycleId, CycleSummary, CycleTrigger, Device, DeviceId, MonitoringCycle, ProbeResult};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Persistent store for devices, cycles, probe history and snapshots
///
/// Implementations must be `Send + Sync`; the aggregator actor, the scheduler and
/// the API share one instance.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert or replace a device record (the failure counter is kept)
    async fn upsert_device(&self, device: &Device) -> StorageResult<()>;

    /// Devices matching `filter`, ordered by id
    async fn list_devices(&self, filter: &DeviceFilter) -> StorageResult<Vec<Device>>;

    /// Record a new RUNNING cycle and return it with its assigned id
    async fn begin_cycle(
        &self,
        trigger: CycleTrigger,
        started_at: DateTime<Utc>,
    ) -> StorageResult<MonitoringCycle>;

    /// RUNNING → COMPLETED with a summary
    ///
    /// Returns `false` if the cycle was not RUNNING (already closed or unknown).
    async fn complete_cycle(
        &self,
        cycle_id: CycleId,
        completed_at: DateTime<Utc>,
        summary: &CycleSummary,
    ) -> StorageResult<bool>;

    /// RUNNING → ABORTED with a reason
    ///
    /// Returns `false` if the cycle was not RUNNING.
    async fn abort_cycle(
        &self,
        cycle_id: CycleId,
        aborted_at: DateTime<Utc>,
        reason: &str,
    ) -> StorageResult<bool>;

    async fn get_cycle(&self, cycle_id: CycleId) -> StorageResult<Option<MonitoringCycle>>;

    /// Cycle with the most recent start
    async fn latest_cycle(&self) -> StorageResult<Option<MonitoringCycle>>;

    /// Append a result to history and, on first delivery, advance the snapshot
    ///
    /// Keyed by (device, cycle): a redelivered result changes nothing and reports
    /// [`IngestOutcome::Duplicate`]. History, snapshot and failure counter change
    /// together or not at all.
    async fn record_result(
        &self,
        cycle_id: CycleId,
        result: &ProbeResult,
    ) -> StorageResult<IngestOutcome>;

    /// History rows for one device, newest first
    async fn query_history(&self, query: HistoryQuery) -> StorageResult<Vec<HistoryEntry>>;

    async fn snapshot(&self, device_id: DeviceId) -> StorageResult<Option<StatusSnapshot>>;

    /// Snapshot of every device that has one, ordered by device id
    async fn snapshots(&self) -> StorageResult<Vec<StatusSnapshot>>;

    /// Per-status check and device counts over history checked at or after `since`
    async fn history_stats(&self, since: DateTime<Utc>) -> StorageResult<FleetStats>;

    /// Delete history older than `before`; returns the number of rows removed
    async fn cleanup_old_history(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    /// Lightweight check that the backend is operational
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Human-readable statistics about the backend
    async fn get_stats(&self) -> StorageResult<String>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
