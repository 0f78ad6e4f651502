//! Authenticated status requests against DVR management endpoints

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use digest_auth::{AuthContext, WwwAuthenticateHeader};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use tracing::{debug, trace};

use crate::{Device, ProtocolType};

/// Raw answer to a status request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceResponse {
    pub status_code: u16,
    pub body: String,
}

impl DeviceResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Transport-level failure of a status request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The request did not complete within its deadline
    Timeout,

    /// Connection refused, reset, or otherwise broken
    Connection(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Timeout => write!(f, "status request timed out"),
            FetchError::Connection(msg) => write!(f, "connection failed: {msg}"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Connection(e.to_string())
        }
    }
}

/// Path of the status endpoint for a firmware family
pub fn status_endpoint(protocol: ProtocolType) -> &'static str {
    match protocol {
        ProtocolType::CpPlus | ProtocolType::Dahua => "/cgi-bin/global.cgi?action=getCurrentTime",
        ProtocolType::Hikvision => "/ISAPI/System/time",
    }
}

/// Issues the protocol-phase request for a device
#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn fetch_status(&self, device: &Device) -> Result<DeviceResponse, FetchError>;
}

/// Scheme a device asked for in its `WWW-Authenticate` challenge
#[derive(Debug)]
enum Challenge {
    Digest(WwwAuthenticateHeader),
    Basic,
}

impl Challenge {
    /// `None` for schemes we cannot answer or a malformed digest challenge
    fn parse(header: &str) -> Option<Self> {
        let scheme = header.split_whitespace().next()?;

        if scheme.eq_ignore_ascii_case("digest") {
            match digest_auth::parse(header) {
                Ok(prompt) => Some(Challenge::Digest(prompt)),
                Err(e) => {
                    debug!("ignoring malformed digest challenge: {e}");
                    None
                }
            }
        } else if scheme.eq_ignore_ascii_case("basic") {
            Some(Challenge::Basic)
        } else {
            None
        }
    }
}

/// [`DeviceApi`] over HTTP, answering the device's digest (or basic) challenge
#[derive(Debug, Clone)]
pub struct HttpDeviceApi {
    client: reqwest::Client,
}

impl HttpDeviceApi {
    /// `timeout` bounds each request end to end
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self { client })
    }

    pub fn url_for(device: &Device) -> String {
        format!("{}{}", device.base_url(), status_endpoint(device.protocol))
    }

    async fn read(response: reqwest::Response) -> Result<DeviceResponse, FetchError> {
        let status_code = response.status().as_u16();
        let body = response.text().await?;

        Ok(DeviceResponse { status_code, body })
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceApi {
    async fn fetch_status(&self, device: &Device) -> Result<DeviceResponse, FetchError> {
        let url = Self::url_for(device);
        trace!("requesting {url}");

        let first = self.client.get(&url).send().await?;
        if first.status() != StatusCode::UNAUTHORIZED {
            return Self::read(first).await;
        }

        let challenge = first
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(Challenge::parse);

        let request = self.client.get(&url);
        let request = match challenge {
            Some(Challenge::Digest(mut prompt)) => {
                let context = AuthContext::new(
                    device.username.as_str(),
                    device.password.as_str(),
                    status_endpoint(device.protocol),
                );
                match prompt.respond(&context) {
                    Ok(answer) => request.header(AUTHORIZATION, answer.to_header_string()),
                    Err(e) => {
                        debug!("cannot answer digest challenge from {url}: {e}");
                        return Self::read(first).await;
                    }
                }
            }
            Some(Challenge::Basic) => request.basic_auth(&device.username, Some(&device.password)),
            None => return Self::read(first).await,
        };

        Self::read(request.send().await?).await
    }
}
