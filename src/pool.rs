//! Bounded fan-out of device probes
//!
//! A cycle hands the pool its device list and a concurrency `C`. The devices go
//! into one shared queue, and `min(C, len)` executor tasks pull from it until it
//! is empty. Each probe runs in its own task under a hard deadline, so a stuck
//! or panicking device only affects its own result.
//!
//! ```text
//! [d1 d2 d3 ... dn] ──pop──→ executor 1 ──┐
//!                   ──pop──→ executor 2 ──┼──→ results (mpsc, completion order)
//!                   ──pop──→ executor C ──┘
//! ```

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::probe::Probe;
use crate::util::{clamp_concurrency, millis};
use crate::{Device, ProbeResult, ProbeStatus};

type Pending = Arc<Mutex<VecDeque<Device>>>;

#[derive(Clone)]
pub struct WorkerPool {
    prober: Arc<dyn Probe>,
    device_timeout: Duration,
    max_concurrency: usize,
}

impl WorkerPool {
    pub fn new(prober: Arc<dyn Probe>, device_timeout: Duration, max_concurrency: usize) -> Self {
        Self {
            prober,
            device_timeout,
            max_concurrency,
        }
    }

    /// Effective concurrency for a request
    pub fn clamp(&self, requested: usize) -> usize {
        clamp_concurrency(requested, self.max_concurrency)
    }

    /// Start probing `devices` and stream results back as they complete
    ///
    /// The receiver yields exactly one result per device and closes after the
    /// last one. Dropping it stops the executors after their current probe.
    pub fn dispatch(
        &self,
        devices: Vec<Device>,
        concurrency: usize,
    ) -> mpsc::Receiver<ProbeResult> {
        let (tx, rx) = mpsc::channel(devices.len().max(1));
        let executors = self.clamp(concurrency).min(devices.len());

        debug!(
            "dispatching {} devices across {executors} executors",
            devices.len()
        );

        let pending: Pending = Arc::new(Mutex::new(VecDeque::from(devices)));

        for _ in 0..executors {
            let pending = pending.clone();
            let tx = tx.clone();
            let prober = self.prober.clone();
            let device_timeout = self.device_timeout;

            tokio::spawn(async move {
                while let Some(device) = next_device(&pending) {
                    let result = probe_isolated(prober.clone(), device, device_timeout).await;
                    if tx.send(result).await.is_err() {
                        debug!("result receiver dropped, executor stopping");
                        break;
                    }
                }
            });
        }

        rx
    }

    /// Probe every device and collect the results
    pub async fn process(&self, devices: Vec<Device>, concurrency: usize) -> Vec<ProbeResult> {
        let mut results = Vec::with_capacity(devices.len());
        let mut rx = self.dispatch(devices, concurrency);

        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        results
    }
}

fn next_device(pending: &Mutex<VecDeque<Device>>) -> Option<Device> {
    match pending.lock() {
        Ok(mut queue) => queue.pop_front(),
        Err(poisoned) => poisoned.into_inner().pop_front(),
    }
}

/// Run one probe in its own task under a hard deadline
async fn probe_isolated(prober: Arc<dyn Probe>, device: Device, limit: Duration) -> ProbeResult {
    let device_id = device.id;
    let checked_at = Utc::now();

    let mut task = tokio::spawn(async move { prober.probe(&device).await });

    match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) if e.is_panic() => {
            let reason = panic_message(e.into_panic());
            error!("probe for device {device_id} panicked: {reason}");
            ProbeResult::failed(
                device_id,
                ProbeStatus::InternalError,
                format!("probe panicked: {reason}"),
                checked_at,
            )
        }
        Ok(Err(e)) => ProbeResult::failed(
            device_id,
            ProbeStatus::InternalError,
            format!("probe task failed: {e}"),
            checked_at,
        ),
        Err(_) => {
            task.abort();
            warn!("probe for device {device_id} exceeded {}ms", millis(limit));
            ProbeResult::failed(
                device_id,
                ProbeStatus::Timeout,
                format!("probe exceeded {}ms", millis(limit)),
                checked_at,
            )
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
