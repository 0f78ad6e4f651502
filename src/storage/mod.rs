//! Persistence of devices, cycles, probe history and status snapshots
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database with WAL, survives restarts
//! - **In-Memory**: No persistence, for tests and the `none` storage mode
//!
//! ## Usage
//!
//! ```no_run
//! use dvr_monitoring::storage::{StorageBackend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./dvr-monitoring.db").await?;
//!     println!("{}", backend.get_stats().await?);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use tracing::{info, warn};

use crate::actors::Retention;
use crate::config::StorageConfig;

pub use backend::{HealthStatus, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use schema::{
    FleetStats, HistoryEntry, HistoryQuery, IngestOutcome, StatusSnapshot, StatusTally,
};

/// Build the backend selected by configuration
///
/// A missing storage section means SQLite with default settings.
pub async fn open(config: Option<&StorageConfig>) -> StorageResult<Arc<dyn StorageBackend>> {
    match config.cloned().unwrap_or_default() {
        StorageConfig::None => {
            info!("storage disabled, keeping results in memory");
            Ok(Arc::new(memory::MemoryBackend::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path, .. } => Ok(Arc::new(sqlite::SqliteBackend::new(path).await?)),
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => {
            warn!("built without storage-sqlite, falling back to in-memory storage");
            Ok(Arc::new(memory::MemoryBackend::new()))
        }
    }
}

/// History kept when results only live in memory
const MEMORY_RETENTION_HOURS: i64 = 24;

/// Retention settings of the configured backend, if history is pruned at all
///
/// The in-memory backend always gets one, since nothing else bounds it.
pub fn retention(config: Option<&StorageConfig>) -> Option<Retention> {
    match config.cloned().unwrap_or_default() {
        StorageConfig::None => Some(Retention {
            keep: chrono::Duration::hours(MEMORY_RETENTION_HOURS),
            every: std::time::Duration::from_secs(3600),
        }),
        StorageConfig::Sqlite {
            retention_days,
            cleanup_interval_hours,
            ..
        } => {
            if retention_days == 0 {
                warn!("retention_days is 0, history cleanup disabled");
                return None;
            }
            Some(Retention {
                keep: chrono::Duration::days(i64::from(retention_days)),
                every: std::time::Duration::from_secs(
                    u64::from(cleanup_interval_hours.max(1)) * 3600,
                ),
            })
        }
    }
}
