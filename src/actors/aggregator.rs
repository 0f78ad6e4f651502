//! AggregatorActor - Turns probe results into durable state
//!
//! All writes of a running cycle funnel through this actor, so history rows,
//! snapshots and failure counters are written one result at a time while the
//! probes themselves keep running.
//!
//! ## Message Flow
//!
//! ```text
//! cycle runner ── Ingest ──────→ record_result (history + snapshot + counter)
//!              ── Finalize ────→ complete_cycle (summary, COMPLETED)
//! cleanup tick ───────────────→ cleanup_old_history (retention)
//! ```
//!
//! Commands are handled in order, so a `Finalize` sent after the last `Ingest`
//! of a cycle sees all of its results persisted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};

use super::messages::{AggregatorCommand, AggregatorStats};
use crate::storage::{IngestOutcome, StorageBackend};
use crate::{CycleId, CycleSummary, ProbeResult};

/// How long history is kept and how often it is pruned
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub keep: chrono::Duration,
    pub every: Duration,
}

pub struct AggregatorActor {
    store: Arc<dyn StorageBackend>,
    command_rx: mpsc::Receiver<AggregatorCommand>,
    retention: Option<Retention>,
    stats: AggregatorStats,
}

impl AggregatorActor {
    pub fn new(
        store: Arc<dyn StorageBackend>,
        command_rx: mpsc::Receiver<AggregatorCommand>,
        retention: Option<Retention>,
    ) -> Self {
        if let Some(retention) = retention {
            debug!(
                "retention cleanup enabled: keep {} days, every {:?}",
                retention.keep.num_days(),
                retention.every
            );
        }

        Self {
            store,
            command_rx,
            retention,
            stats: AggregatorStats::default(),
        }
    }

    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting aggregator actor");

        let has_retention = self.retention.is_some();
        let every = self
            .retention
            .map_or(Duration::from_secs(24 * 3600), |r| r.every);

        // first tick fires immediately, so history is pruned on start-up
        let mut cleanup_interval = time::interval(every);

        loop {
            tokio::select! {
                _ = cleanup_interval.tick(), if has_retention => {
                    if let Err(e) = self.run_cleanup().await {
                        error!("failed to clean up old history: {e:#}");
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        AggregatorCommand::Ingest { cycle_id, result } => {
                            self.ingest(cycle_id, &result).await;
                        }

                        AggregatorCommand::Finalize { cycle_id, results, respond_to } => {
                            let _ = respond_to.send(self.finalize(cycle_id, &results).await);
                        }

                        AggregatorCommand::Cleanup { respond_to } => {
                            let _ = respond_to.send(self.run_cleanup().await);
                        }

                        AggregatorCommand::GetStats { respond_to } => {
                            let _ = respond_to.send(self.stats.clone());
                        }

                        AggregatorCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("aggregator actor stopped");
    }

    /// Persist one result; a failure is logged and only affects this result
    async fn ingest(&mut self, cycle_id: CycleId, result: &ProbeResult) {
        match self.store.record_result(cycle_id, result).await {
            Ok(IngestOutcome::Recorded {
                consecutive_failures,
            }) => {
                self.stats.ingested += 1;
                trace!(
                    "device {} {} (failures in a row: {consecutive_failures})",
                    result.device_id, result.status
                );
            }
            Ok(IngestOutcome::Duplicate) => {
                self.stats.duplicates += 1;
                debug!(
                    "ignoring redelivered result for device {} in cycle {cycle_id}",
                    result.device_id
                );
            }
            Err(e) => {
                self.stats.failures += 1;
                error!(
                    "failed to persist result for device {} in cycle {cycle_id}: {e}",
                    result.device_id
                );
            }
        }
    }

    async fn finalize(
        &mut self,
        cycle_id: CycleId,
        results: &[ProbeResult],
    ) -> anyhow::Result<Option<CycleSummary>> {
        let summary = CycleSummary::from_results(results);

        if !self.store.complete_cycle(cycle_id, Utc::now(), &summary).await? {
            warn!("cycle {cycle_id} was no longer running, summary dropped");
            return Ok(None);
        }

        self.stats.cycles_finalized += 1;
        info!(
            "cycle {cycle_id} completed: {} devices, {}",
            summary.total,
            summary
                .counts
                .iter()
                .map(|(status, count)| format!("{status}={count}"))
                .collect::<Vec<_>>()
                .join(" ")
        );

        Ok(Some(summary))
    }

    async fn run_cleanup(&mut self) -> anyhow::Result<usize> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };

        let cutoff = Utc::now() - retention.keep;
        debug!("running retention cleanup (deleting history before {cutoff})");

        let deleted = self.store.cleanup_old_history(cutoff).await?;
        self.stats.history_deleted += deleted as u64;
        self.stats.last_cleanup = Some(Utc::now());

        if deleted > 0 {
            info!("retention cleanup complete: deleted {deleted} history rows");
        } else {
            trace!("retention cleanup: no old history to delete");
        }

        Ok(deleted)
    }
}

/// Handle for talking to an AggregatorActor
#[derive(Clone)]
pub struct AggregatorHandle {
    sender: mpsc::Sender<AggregatorCommand>,
}

impl AggregatorHandle {
    /// Spawn a new aggregator actor
    pub fn spawn(store: Arc<dyn StorageBackend>, retention: Option<Retention>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let actor = AggregatorActor::new(store, cmd_rx, retention);

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Queue a result for persistence
    pub async fn ingest(&self, cycle_id: CycleId, result: ProbeResult) -> anyhow::Result<()> {
        self.sender
            .send(AggregatorCommand::Ingest { cycle_id, result })
            .await?;
        Ok(())
    }

    /// Close a cycle once every result has been queued
    pub async fn finalize_cycle(
        &self,
        cycle_id: CycleId,
        results: Vec<ProbeResult>,
    ) -> anyhow::Result<Option<CycleSummary>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AggregatorCommand::Finalize {
                cycle_id,
                results,
                respond_to: tx,
            })
            .await?;

        rx.await?
    }

    pub async fn cleanup(&self) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AggregatorCommand::Cleanup { respond_to: tx })
            .await?;

        rx.await?
    }

    pub async fn stats(&self) -> anyhow::Result<AggregatorStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AggregatorCommand::GetStats { respond_to: tx })
            .await?;

        Ok(rx.await?)
    }

    /// Shut down the aggregator
    pub async fn shutdown(&self) {
        let _ = self.sender.send(AggregatorCommand::Shutdown).await;
    }
}
