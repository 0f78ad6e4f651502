pub mod batch;
pub mod devices;
pub mod health;
pub mod monitoring;
pub mod stats;
