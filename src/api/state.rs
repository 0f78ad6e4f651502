//! Shared state handed to every API handler

use std::sync::Arc;

use crate::actors::AggregatorHandle;
use crate::pool::WorkerPool;
use crate::registry::DeviceRegistry;
use crate::scheduler::FleetScheduler;
use crate::storage::StorageBackend;

#[derive(Clone)]
pub struct ApiState {
    /// Admission control and cycle state
    pub scheduler: Arc<FleetScheduler>,

    /// Snapshots, history and cycles
    pub store: Arc<dyn StorageBackend>,

    /// Ingest counters and on-demand retention cleanup
    pub aggregator: AggregatorHandle,

    /// Pool used for on-demand batch probes
    pub pool: WorkerPool,

    pub registry: Arc<dyn DeviceRegistry>,

    /// Batch concurrency when the request names none
    pub default_concurrency: usize,
}

impl ApiState {
    pub fn new(
        scheduler: Arc<FleetScheduler>,
        store: Arc<dyn StorageBackend>,
        aggregator: AggregatorHandle,
        pool: WorkerPool,
        registry: Arc<dyn DeviceRegistry>,
        default_concurrency: usize,
    ) -> Self {
        Self {
            scheduler,
            store,
            aggregator,
            pool,
            registry,
            default_concurrency,
        }
    }
}
