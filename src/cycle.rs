//! Execution of one admitted monitoring cycle

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::actors::AggregatorHandle;
use crate::pool::WorkerPool;
use crate::registry::{DeviceFilter, DeviceRegistry};
use crate::storage::StorageBackend;
use crate::{CycleId, CycleSummary};

/// How a cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleSummary),
    Aborted(String),
}

/// Loads the fleet, fans it out over the pool and streams results into the aggregator
pub struct CycleRunner {
    registry: Arc<dyn DeviceRegistry>,
    store: Arc<dyn StorageBackend>,
    pool: WorkerPool,
    aggregator: AggregatorHandle,
    concurrency: usize,
    filter: DeviceFilter,
}

impl CycleRunner {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        store: Arc<dyn StorageBackend>,
        pool: WorkerPool,
        aggregator: AggregatorHandle,
        concurrency: usize,
        filter: DeviceFilter,
    ) -> Self {
        Self {
            registry,
            store,
            pool,
            aggregator,
            concurrency,
            filter,
        }
    }

    /// Run cycle `cycle_id`, which must already be recorded as RUNNING
    #[instrument(skip(self), fields(cycle = cycle_id))]
    pub async fn run(&self, cycle_id: CycleId) -> CycleOutcome {
        let devices = match self.registry.devices(&self.filter).await {
            Ok(devices) => devices,
            Err(e) => {
                return self
                    .abort(cycle_id, format!("device registry unavailable: {e:#}"))
                    .await;
            }
        };

        info!(
            "cycle {cycle_id} polling {} devices at concurrency {}",
            devices.len(),
            self.pool.clamp(self.concurrency)
        );

        let mut results = Vec::with_capacity(devices.len());
        let mut rx = self.pool.dispatch(devices, self.concurrency);

        while let Some(result) = rx.recv().await {
            trace!(
                "device {} -> {} ({})",
                result.device_id, result.status, result.diagnostic
            );

            if let Err(e) = self.aggregator.ingest(cycle_id, result.clone()).await {
                error!(
                    "aggregator unavailable, result for device {} not persisted: {e}",
                    result.device_id
                );
            }
            results.push(result);
        }

        debug!("all {} devices attempted", results.len());

        match self.aggregator.finalize_cycle(cycle_id, results).await {
            Ok(Some(summary)) => CycleOutcome::Completed(summary),
            Ok(None) => CycleOutcome::Aborted("cycle was closed before it finished".to_string()),
            Err(e) => {
                self.abort(cycle_id, format!("failed to finalize cycle: {e:#}"))
                    .await
            }
        }
    }

    async fn abort(&self, cycle_id: CycleId, reason: String) -> CycleOutcome {
        warn!("aborting cycle {cycle_id}: {reason}");

        if let Err(e) = self.store.abort_cycle(cycle_id, Utc::now(), &reason).await {
            error!("failed to record abort of cycle {cycle_id}: {e}");
        }

        CycleOutcome::Aborted(reason)
    }
}
