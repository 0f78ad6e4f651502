use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dvr_monitoring::{
    actors::AggregatorHandle,
    api::{ApiConfig, ApiState, spawn_api_server},
    config::{Config, read_config_file},
    cycle::CycleRunner,
    pool::WorkerPool,
    probe::DeviceProber,
    registry::{DeviceFilter, DeviceRegistry, StoreRegistry},
    scheduler::{FleetScheduler, SchedulerSettings},
    storage::{self, StorageBackend},
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown waits for a running cycle before giving up on it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("dvr_monitoring", LevelFilter::TRACE),
        ("dvr_hub", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let store = storage::open(config.storage.as_ref())
        .await
        .context("failed to open storage")?;
    seed_devices(&config, store.as_ref()).await?;

    let registry: Arc<dyn DeviceRegistry> = Arc::new(StoreRegistry::new(store.clone()));
    let prober = DeviceProber::from_config(&config.probe)?;
    let pool = WorkerPool::new(
        Arc::new(prober),
        config.probe.device_timeout(),
        config.monitoring.max_concurrency,
    );
    let aggregator = AggregatorHandle::spawn(
        store.clone(),
        storage::retention(config.storage.as_ref()),
    );

    let runner = CycleRunner::new(
        registry.clone(),
        store.clone(),
        pool.clone(),
        aggregator.clone(),
        config.monitoring.concurrency,
        DeviceFilter::active().with_group(config.monitoring.group.clone()),
    );
    let scheduler = FleetScheduler::new(
        SchedulerSettings::from_config(&config.monitoring),
        Arc::new(runner),
        store.clone(),
    );
    scheduler
        .restore()
        .await
        .context("failed to restore scheduler state")?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let scheduler_loop = tokio::spawn(scheduler.clone().run(async move {
        let _ = stop_rx.await;
    }));

    let api_state = ApiState::new(
        scheduler.clone(),
        store.clone(),
        aggregator.clone(),
        pool,
        registry,
        config.monitoring.concurrency,
    );
    let addr = spawn_api_server(ApiConfig::from_settings(&config.api), api_state).await?;
    info!("hub ready, API on {addr}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    let _ = stop_tx.send(());
    if let Err(e) = scheduler_loop.await {
        error!("scheduler loop failed: {e}");
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, scheduler.wait_idle())
        .await
        .is_err()
    {
        warn!("running cycle did not finish within {SHUTDOWN_GRACE:?}");
    }

    aggregator.shutdown().await;
    if let Err(e) = store.close().await {
        error!("failed to close storage: {e}");
    }

    Ok(())
}

/// Write the configured devices into the registry table
async fn seed_devices(config: &Config, store: &dyn StorageBackend) -> anyhow::Result<()> {
    for device in &config.devices {
        store
            .upsert_device(device)
            .await
            .with_context(|| format!("failed to register device {}", device.id))?;
    }
    debug!("registered {} devices from configuration", config.devices.len());
    Ok(())
}
