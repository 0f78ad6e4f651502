//! Actor-based persistence of monitoring results
//!
//! Actors run as independent async tasks communicating via Tokio channels.
//!
//! ## Actor Types
//!
//! - **AggregatorActor**: Records probe results, closes cycles, prunes old history
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Request/Response**: oneshot channels for synchronous queries
//! 3. **Handles**: Cloneable handles wrap the command sender

pub mod aggregator;
pub mod messages;

pub use aggregator::{AggregatorHandle, Retention};
pub use messages::AggregatorStats;
