//! Phase-one network reachability checks

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::trace;

use crate::Device;
use crate::config::ReachabilityMode;

/// Decides whether a device answers on the network at all
///
/// Implementations return a short diagnostic on failure. The prober enforces the
/// deadline, so a check that never returns is still bounded.
#[async_trait]
pub trait ReachabilityCheck: Send + Sync {
    async fn check(&self, device: &Device) -> Result<(), String>;
}

/// One ICMP echo request through the system `ping` utility
#[derive(Debug, Clone)]
pub struct PingReachability {
    timeout: Duration,
}

impl PingReachability {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn command(&self, address: &str) -> Command {
        let mut cmd = Command::new("ping");

        if cfg!(target_os = "windows") {
            cmd.args(["-n", "1", "-w"])
                .arg(self.timeout.as_millis().max(1).to_string());
        } else if cfg!(target_os = "macos") {
            cmd.args(["-c", "1", "-t"]).arg(whole_secs(self.timeout).to_string());
        } else {
            cmd.args(["-c", "1", "-W"]).arg(whole_secs(self.timeout).to_string());
        }

        cmd.arg(address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

fn whole_secs(timeout: Duration) -> u64 {
    timeout.as_secs_f64().ceil().max(1.0) as u64
}

#[async_trait]
impl ReachabilityCheck for PingReachability {
    async fn check(&self, device: &Device) -> Result<(), String> {
        let status = self
            .command(&device.address)
            .status()
            .await
            .map_err(|e| format!("failed to run ping: {e}"))?;

        trace!("ping {} exited with {status}", device.address);

        if status.success() {
            Ok(())
        } else {
            Err(format!("no echo reply from {}", device.address))
        }
    }
}

/// TCP connect to the device's management port
#[derive(Debug, Clone, Default)]
pub struct TcpReachability;

#[async_trait]
impl ReachabilityCheck for TcpReachability {
    async fn check(&self, device: &Device) -> Result<(), String> {
        TcpStream::connect((device.address.as_str(), device.port))
            .await
            .map(drop)
            .map_err(|e| format!("tcp connect to {}:{} failed: {e}", device.address, device.port))
    }
}

pub fn from_mode(mode: ReachabilityMode, timeout: Duration) -> Arc<dyn ReachabilityCheck> {
    match mode {
        ReachabilityMode::Icmp => Arc::new(PingReachability::new(timeout)),
        ReachabilityMode::Tcp => Arc::new(TcpReachability),
    }
}
