pub mod auth;
pub mod auto_monitor;
