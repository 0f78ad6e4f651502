//! Message types for the aggregator actor

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::{CycleId, CycleSummary, ProbeResult};

/// Commands that can be sent to the AggregatorActor
#[derive(Debug)]
pub enum AggregatorCommand {
    /// Persist one probe result (fire-and-forget)
    Ingest { cycle_id: CycleId, result: ProbeResult },

    /// Close a cycle with the summary of all its results
    ///
    /// Replies `None` when the cycle was no longer RUNNING (aborted meanwhile).
    Finalize {
        cycle_id: CycleId,
        results: Vec<ProbeResult>,
        respond_to: oneshot::Sender<anyhow::Result<Option<CycleSummary>>>,
    },

    /// Run the retention cleanup now
    Cleanup {
        respond_to: oneshot::Sender<anyhow::Result<usize>>,
    },

    /// Get aggregator statistics
    GetStats {
        respond_to: oneshot::Sender<AggregatorStats>,
    },

    /// Gracefully shut down the aggregator actor
    Shutdown,
}

/// Aggregator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct AggregatorStats {
    /// Results recorded on first delivery
    pub ingested: u64,

    /// Redelivered results that were ignored
    pub duplicates: u64,

    /// Results that could not be persisted
    pub failures: u64,

    /// Cycles moved to COMPLETED
    pub cycles_finalized: u64,

    /// History rows removed by retention cleanup
    pub history_deleted: u64,

    pub last_cleanup: Option<DateTime<Utc>>,
}
