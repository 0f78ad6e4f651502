//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Status reads proceed while a cycle is being written
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! History writes go through a transaction that inserts the history row with
//! `ON CONFLICT DO NOTHING` and only touches the snapshot and the failure
//! counter when that insert actually added a row.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{
    FleetStats, HistoryEntry, HistoryQuery, IngestOutcome, StatusSnapshot, StatusTally,
};
use crate::registry::DeviceFilter;
use crate::{
    CycleId, CycleStatus, CycleSummary, CycleTrigger, Device, DeviceId, MonitoringCycle,
    ProbeResult, ProbeStatus, ProtocolType,
};

const RESULT_COLUMNS: &str = "device_id, status, reachable, reachability_latency_ms, \
     protocol_latency_ms, diagnostic, device_time, checked_at";

pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database file and run migrations
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> StorageResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| StorageError::CorruptRow(format!("timestamp out of range: {millis}")))
    }

    fn device_from_row(row: &SqliteRow) -> StorageResult<Device> {
        let port: i64 = row.try_get("port")?;
        let protocol: String = row.try_get("protocol")?;

        Ok(Device {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            address: row.try_get("address")?,
            port: u16::try_from(port)
                .map_err(|_| StorageError::CorruptRow(format!("invalid port {port}")))?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            protocol: protocol
                .parse::<ProtocolType>()
                .map_err(|e| StorageError::CorruptRow(e.to_string()))?,
            active: row.try_get("active")?,
            group: row.try_get("group_name")?,
            consecutive_failures: row.try_get::<i64, _>("consecutive_failures")? as u32,
        })
    }

    fn result_from_row(row: &SqliteRow) -> StorageResult<ProbeResult> {
        let status: String = row.try_get("status")?;
        let device_time: Option<String> = row.try_get("device_time")?;

        Ok(ProbeResult {
            device_id: row.try_get("device_id")?,
            status: status
                .parse::<ProbeStatus>()
                .map_err(|e| StorageError::CorruptRow(e.to_string()))?,
            reachable: row.try_get("reachable")?,
            reachability_latency_ms: row
                .try_get::<Option<i64>, _>("reachability_latency_ms")?
                .map(|v| v as u64),
            protocol_latency_ms: row
                .try_get::<Option<i64>, _>("protocol_latency_ms")?
                .map(|v| v as u64),
            diagnostic: row.try_get("diagnostic")?,
            device_time: device_time
                .map(|raw| DateTime::parse_from_rfc3339(&raw))
                .transpose()
                .map_err(|e| StorageError::CorruptRow(format!("device_time: {e}")))?,
            checked_at: Self::millis_to_timestamp(row.try_get("checked_at")?)?,
        })
    }

    fn cycle_from_row(row: &SqliteRow) -> StorageResult<MonitoringCycle> {
        let trigger: String = row.try_get("trigger_source")?;
        let status: String = row.try_get("status")?;
        let summary: Option<String> = row.try_get("summary")?;
        let completed_at: Option<i64> = row.try_get("completed_at")?;

        Ok(MonitoringCycle {
            id: row.try_get("id")?,
            started_at: Self::millis_to_timestamp(row.try_get("started_at")?)?,
            completed_at: completed_at.map(Self::millis_to_timestamp).transpose()?,
            trigger: CycleTrigger::parse(&trigger)
                .ok_or_else(|| StorageError::CorruptRow(format!("unknown trigger {trigger}")))?,
            status: CycleStatus::parse(&status)
                .ok_or_else(|| StorageError::CorruptRow(format!("unknown cycle status {status}")))?,
            summary: summary
                .map(|json| serde_json::from_str::<CycleSummary>(&json))
                .transpose()?,
            error: row.try_get("error")?,
        })
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, device), fields(device = device.id))]
    async fn upsert_device(&self, device: &Device) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (id, name, address, port, username, password, protocol, active, group_name)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                address = excluded.address,
                port = excluded.port,
                username = excluded.username,
                password = excluded.password,
                protocol = excluded.protocol,
                active = excluded.active,
                group_name = excluded.group_name
            "#,
        )
        .bind(device.id)
        .bind(&device.name)
        .bind(&device.address)
        .bind(i64::from(device.port))
        .bind(&device.username)
        .bind(&device.password)
        .bind(device.protocol.as_str())
        .bind(device.active)
        .bind(&device.group)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_devices(&self, filter: &DeviceFilter) -> StorageResult<Vec<Device>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, address, port, username, password, protocol, active,
                   group_name, consecutive_failures
            FROM devices
            WHERE (? = 0 OR active = 1)
              AND (? IS NULL OR group_name = ?)
            ORDER BY id ASC
            "#,
        )
        .bind(filter.active_only)
        .bind(&filter.group)
        .bind(&filter.group)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::device_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn begin_cycle(
        &self,
        trigger: CycleTrigger,
        started_at: DateTime<Utc>,
    ) -> StorageResult<MonitoringCycle> {
        let result = sqlx::query(
            r#"
            INSERT INTO monitoring_cycles (started_at, trigger_source, status)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(Self::timestamp_to_millis(&started_at))
        .bind(trigger.as_str())
        .bind(CycleStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("began cycle {id}");

        Ok(MonitoringCycle {
            id,
            started_at: Self::millis_to_timestamp(Self::timestamp_to_millis(&started_at))?,
            completed_at: None,
            trigger,
            status: CycleStatus::Running,
            summary: None,
            error: None,
        })
    }

    #[instrument(skip(self, summary))]
    async fn complete_cycle(
        &self,
        cycle_id: CycleId,
        completed_at: DateTime<Utc>,
        summary: &CycleSummary,
    ) -> StorageResult<bool> {
        let summary_json = serde_json::to_string(summary)?;

        let result = sqlx::query(
            r#"
            UPDATE monitoring_cycles
            SET status = ?, completed_at = ?, summary = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(CycleStatus::Completed.as_str())
        .bind(Self::timestamp_to_millis(&completed_at))
        .bind(summary_json)
        .bind(cycle_id)
        .bind(CycleStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn abort_cycle(
        &self,
        cycle_id: CycleId,
        aborted_at: DateTime<Utc>,
        reason: &str,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE monitoring_cycles
            SET status = ?, completed_at = ?, error = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(CycleStatus::Aborted.as_str())
        .bind(Self::timestamp_to_millis(&aborted_at))
        .bind(reason)
        .bind(cycle_id)
        .bind(CycleStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_cycle(&self, cycle_id: CycleId) -> StorageResult<Option<MonitoringCycle>> {
        let row = sqlx::query(
            r#"
            SELECT id, started_at, completed_at, trigger_source, status, summary, error
            FROM monitoring_cycles
            WHERE id = ?
            "#,
        )
        .bind(cycle_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::cycle_from_row).transpose()
    }

    async fn latest_cycle(&self) -> StorageResult<Option<MonitoringCycle>> {
        let row = sqlx::query(
            r#"
            SELECT id, started_at, completed_at, trigger_source, status, summary, error
            FROM monitoring_cycles
            ORDER BY started_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::cycle_from_row).transpose()
    }

    #[instrument(skip(self, result), fields(device = result.device_id, status = %result.status))]
    async fn record_result(
        &self,
        cycle_id: CycleId,
        result: &ProbeResult,
    ) -> StorageResult<IngestOutcome> {
        let checked_at = Self::timestamp_to_millis(&result.checked_at);
        let device_time = result.device_time.map(|t| t.to_rfc3339());
        let reachability_latency = result.reachability_latency_ms.map(|v| v as i64);
        let protocol_latency = result.protocol_latency_ms.map(|v| v as i64);

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO monitoring_history (cycle_id, {RESULT_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (device_id, cycle_id) DO NOTHING
            "#
        ))
        .bind(cycle_id)
        .bind(result.device_id)
        .bind(result.status.as_str())
        .bind(result.reachable)
        .bind(reachability_latency)
        .bind(protocol_latency)
        .bind(&result.diagnostic)
        .bind(&device_time)
        .bind(checked_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if db.is_foreign_key_violation() => {
                StorageError::UnknownDevice(result.device_id)
            }
            _ => StorageError::from(e),
        })?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("result already recorded for cycle {cycle_id}");
            return Ok(IngestOutcome::Duplicate);
        }

        let previous: Option<i64> = sqlx::query_scalar(
            "SELECT consecutive_failures FROM status_snapshot WHERE device_id = ?",
        )
        .bind(result.device_id)
        .fetch_optional(&mut *tx)
        .await?;

        let consecutive_failures = if result.status.is_success() {
            0
        } else {
            previous.unwrap_or(0) + 1
        };

        sqlx::query(&format!(
            r#"
            INSERT INTO status_snapshot (cycle_id, consecutive_failures, {RESULT_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (device_id) DO UPDATE SET
                cycle_id = excluded.cycle_id,
                consecutive_failures = excluded.consecutive_failures,
                status = excluded.status,
                reachable = excluded.reachable,
                reachability_latency_ms = excluded.reachability_latency_ms,
                protocol_latency_ms = excluded.protocol_latency_ms,
                diagnostic = excluded.diagnostic,
                device_time = excluded.device_time,
                checked_at = excluded.checked_at
            "#
        ))
        .bind(cycle_id)
        .bind(consecutive_failures)
        .bind(result.device_id)
        .bind(result.status.as_str())
        .bind(result.reachable)
        .bind(reachability_latency)
        .bind(protocol_latency)
        .bind(&result.diagnostic)
        .bind(&device_time)
        .bind(checked_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE devices SET consecutive_failures = ? WHERE id = ?")
            .bind(consecutive_failures)
            .bind(result.device_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(IngestOutcome::Recorded {
            consecutive_failures: consecutive_failures as u32,
        })
    }

    #[instrument(skip(self), fields(device = query.device_id))]
    async fn query_history(&self, query: HistoryQuery) -> StorageResult<Vec<HistoryEntry>> {
        let start = query.start.as_ref().map(Self::timestamp_to_millis);
        let end = query.end.as_ref().map(Self::timestamp_to_millis);

        let rows = sqlx::query(&format!(
            r#"
            SELECT cycle_id, {RESULT_COLUMNS}
            FROM monitoring_history
            WHERE device_id = ?
              AND (? IS NULL OR checked_at >= ?)
              AND (? IS NULL OR checked_at <= ?)
            ORDER BY checked_at DESC, cycle_id DESC
            LIMIT ?
            "#
        ))
        .bind(query.device_id)
        .bind(start)
        .bind(start)
        .bind(end)
        .bind(end)
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .iter()
            .map(|row| {
                Ok(HistoryEntry {
                    cycle_id: row.try_get("cycle_id")?,
                    result: Self::result_from_row(row)?,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        debug!("query returned {} history rows", entries.len());
        Ok(entries)
    }

    async fn snapshot(&self, device_id: DeviceId) -> StorageResult<Option<StatusSnapshot>> {
        let row = sqlx::query(&format!(
            "SELECT cycle_id, consecutive_failures, {RESULT_COLUMNS} FROM status_snapshot WHERE device_id = ?"
        ))
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn snapshots(&self) -> StorageResult<Vec<StatusSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT cycle_id, consecutive_failures, {RESULT_COLUMNS} FROM status_snapshot ORDER BY device_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(snapshot_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn history_stats(&self, since: DateTime<Utc>) -> StorageResult<FleetStats> {
        let since_millis = Self::timestamp_to_millis(&since);
        let mut stats = FleetStats::empty(since);

        let (total, reachable, devices): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COALESCE(SUM(reachable), 0), COUNT(DISTINCT device_id)
            FROM monitoring_history
            WHERE checked_at >= ?
            "#,
        )
        .bind(since_millis)
        .fetch_one(&self.pool)
        .await?;

        stats.total_checks = total as u64;
        stats.reachable_checks = reachable as u64;
        stats.devices_checked = devices as u64;

        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*), COUNT(DISTINCT device_id)
            FROM monitoring_history
            WHERE checked_at >= ?
            GROUP BY status
            "#,
        )
        .bind(since_millis)
        .fetch_all(&self.pool)
        .await?;

        for (status, checks, devices) in rows {
            let status = status
                .parse::<ProbeStatus>()
                .map_err(|e| StorageError::CorruptRow(e.to_string()))?;
            stats.by_status.insert(
                status,
                StatusTally {
                    checks: checks as u64,
                    devices: devices as u64,
                },
            );
        }

        Ok(stats)
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_old_history(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        info!("cleaning up history older than {}", before);

        let result = sqlx::query("DELETE FROM monitoring_history WHERE checked_at < ?")
            .bind(Self::timestamp_to_millis(&before))
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        info!("deleted {} old history rows", deleted);

        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: "SQLite backend operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "sqlite".to_string()),
                    ("db_path".to_string(), self.db_path.clone()),
                ]),
            }),
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_stats(&self) -> StorageResult<String> {
        let (devices,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await?;

        let (cycles,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM monitoring_cycles")
            .fetch_one(&self.pool)
            .await?;

        let (history, oldest, newest): (i64, Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(checked_at), MAX(checked_at) FROM monitoring_history",
        )
        .fetch_one(&self.pool)
        .await?;

        let file_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let file_size_mb = file_size as f64 / 1_000_000.0;

        let time_range = match (oldest, newest) {
            (Some(old), Some(new)) => format!(
                "{} to {}",
                Self::millis_to_timestamp(old)?.format("%Y-%m-%d"),
                Self::millis_to_timestamp(new)?.format("%Y-%m-%d")
            ),
            _ => "no data".to_string(),
        };

        Ok(format!(
            "SQLite: {devices} devices, {cycles} cycles, {history} history rows, \
             {file_size_mb:.2} MB on disk, time range: {time_range}"
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}

fn snapshot_from_row(row: &SqliteRow) -> StorageResult<StatusSnapshot> {
    Ok(StatusSnapshot {
        cycle_id: row.try_get("cycle_id")?,
        consecutive_failures: row.try_get::<i64, _>("consecutive_failures")? as u32,
        result: SqliteBackend::result_from_row(row)?,
    })
}
