//! Two-phase device health probe
//!
//! ```text
//! START → REACHABILITY_CHECK ─┬─ fail / deadline ──→ UNREACHABLE
//!                             └─ ok → PROTOCOL_CHECK ─┬─ deadline ─────────→ TIMEOUT
//!                                                      ├─ connection error ─→ PROTOCOL_ERROR
//!                                                      ├─ non-2xx ──────────→ AUTH_FAILED
//!                                                      ├─ unparsable ───────→ PROTOCOL_ERROR
//!                                                      └─ parsed ───────────→ SUCCESS
//! ```
//!
//! Every probe yields exactly one [`ProbeResult`]. Nothing here touches storage.

pub mod client;
pub mod parser;
pub mod reachability;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use tokio::time::timeout;
use tracing::{instrument, trace};

use crate::config::ProbeConfig;
use crate::util::millis;
use crate::{Device, ProbeResult, ProbeStatus};

use client::{DeviceApi, DeviceResponse, FetchError, HttpDeviceApi};
use parser::ParserRegistry;
use reachability::ReachabilityCheck;

/// Longest payload excerpt kept in a diagnostic
const DIAGNOSTIC_LIMIT: usize = 256;

/// Anything that can turn a device into a classified result
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, device: &Device) -> ProbeResult;
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub reachability_timeout: Duration,
    pub protocol_timeout: Duration,

    /// Offset for device clocks reported without one
    pub default_offset: FixedOffset,
}

impl ProbeSettings {
    pub fn from_config(config: &ProbeConfig) -> anyhow::Result<Self> {
        Ok(Self {
            reachability_timeout: config.reachability_timeout(),
            protocol_timeout: config.protocol_timeout(),
            default_offset: config.utc_offset()?,
        })
    }
}

pub struct DeviceProber {
    reachability: Arc<dyn ReachabilityCheck>,
    api: Arc<dyn DeviceApi>,
    parsers: ParserRegistry,
    settings: ProbeSettings,
}

impl DeviceProber {
    pub fn new(
        reachability: Arc<dyn ReachabilityCheck>,
        api: Arc<dyn DeviceApi>,
        parsers: ParserRegistry,
        settings: ProbeSettings,
    ) -> Self {
        Self {
            reachability,
            api,
            parsers,
            settings,
        }
    }

    /// Prober with the network stack selected by configuration
    pub fn from_config(config: &ProbeConfig) -> anyhow::Result<Self> {
        let settings = ProbeSettings::from_config(config)?;
        let reachability =
            reachability::from_mode(config.reachability, settings.reachability_timeout);
        let api = Arc::new(HttpDeviceApi::new(settings.protocol_timeout)?);

        Ok(Self::new(reachability, api, ParserRegistry::default(), settings))
    }

    fn classify(&self, device: &Device, response: DeviceResponse) -> Classified {
        if !response.is_success() {
            return Classified::failure(
                ProbeStatus::AuthFailed,
                format!("HTTP {}: {}", response.status_code, excerpt(&response.body)),
            );
        }

        let Some(parser) = self.parsers.get(device.protocol) else {
            return Classified::failure(
                ProbeStatus::ProtocolError,
                format!("no payload parser for protocol {}", device.protocol),
            );
        };

        match parser.parse(&response.body, self.settings.default_offset) {
            Ok(device_time) => Classified {
                status: ProbeStatus::Success,
                diagnostic: excerpt(&response.body),
                device_time: Some(device_time),
            },
            Err(e) => Classified::failure(
                ProbeStatus::ProtocolError,
                format!("{e}: {}", excerpt(&response.body)),
            ),
        }
    }
}

struct Classified {
    status: ProbeStatus,
    diagnostic: String,
    device_time: Option<chrono::DateTime<FixedOffset>>,
}

impl Classified {
    fn failure(status: ProbeStatus, diagnostic: String) -> Self {
        Self {
            status,
            diagnostic,
            device_time: None,
        }
    }
}

#[async_trait]
impl Probe for DeviceProber {
    #[instrument(skip_all, fields(device = device.id, address = %device.address))]
    async fn probe(&self, device: &Device) -> ProbeResult {
        let checked_at = Utc::now();

        let started = Instant::now();
        let reached = timeout(
            self.settings.reachability_timeout,
            self.reachability.check(device),
        )
        .await;
        let reachability_latency_ms = Some(millis(started.elapsed()));

        let unreachable = match reached {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(_) => Some(format!(
                "no reachability answer within {}ms",
                millis(self.settings.reachability_timeout)
            )),
        };

        if let Some(diagnostic) = unreachable {
            trace!("unreachable: {diagnostic}");
            return ProbeResult {
                reachability_latency_ms,
                ..ProbeResult::failed(device.id, ProbeStatus::Unreachable, diagnostic, checked_at)
            };
        }

        let started = Instant::now();
        let fetched = timeout(self.settings.protocol_timeout, self.api.fetch_status(device)).await;
        let protocol_latency_ms = Some(millis(started.elapsed()));

        let classified = match fetched {
            Err(_) | Ok(Err(FetchError::Timeout)) => Classified::failure(
                ProbeStatus::Timeout,
                format!(
                    "no status answer within {}ms",
                    millis(self.settings.protocol_timeout)
                ),
            ),
            Ok(Err(FetchError::Connection(msg))) => {
                Classified::failure(ProbeStatus::ProtocolError, msg)
            }
            Ok(Ok(response)) => self.classify(device, response),
        };

        trace!("classified as {}", classified.status);

        ProbeResult {
            device_id: device.id,
            status: classified.status,
            reachable: true,
            reachability_latency_ms,
            protocol_latency_ms,
            diagnostic: classified.diagnostic,
            device_time: classified.device_time,
            checked_at,
        }
    }
}

fn excerpt(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(DIAGNOSTIC_LIMIT) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}
