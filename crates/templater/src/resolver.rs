//! Host-address resolvers injected into rendering.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::net::UdpSocket;
use tracing::{info, warn};
use url::Url;

use crate::error::{Error, Result};

/// Default endpoint used to discover the external IP address.
pub const DEFAULT_EXTERNAL_IP_ENDPOINT: &str = "https://api.myip.com";

/// Default time budget for the external IP lookup.
pub const DEFAULT_EXTERNAL_IP_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves the machine's reachable network address.
#[async_trait]
pub trait HostResolver
where
    Self: Send + Sync + 'static,
{
    /// Resolve the host address.
    async fn resolve(&self) -> Result<IpAddr>;
}

/// Always returns the same address.
#[derive(Clone, Copy, Debug)]
pub struct FixedResolver(pub IpAddr);

#[async_trait]
impl HostResolver for FixedResolver {
    async fn resolve(&self) -> Result<IpAddr> {
        Ok(self.0)
    }
}

/// Returns the address of the interface holding the default route.
///
/// Connecting a UDP socket selects a route without sending any packet.
#[derive(Clone, Copy, Debug)]
pub struct LocalInterfaceResolver {
    probe_target: SocketAddr,
}

impl LocalInterfaceResolver {
    /// Creates a resolver that routes towards `probe_target`.
    #[must_use]
    pub const fn new(probe_target: SocketAddr) -> Self {
        Self { probe_target }
    }
}

impl Default for LocalInterfaceResolver {
    fn default() -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 80)))
    }
}

#[async_trait]
impl HostResolver for LocalInterfaceResolver {
    async fn resolve(&self) -> Result<IpAddr> {
        let bind_addr = if self.probe_target.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| Error::Io("failed to bind resolver socket", e))?;

        socket
            .connect(self.probe_target)
            .await
            .map_err(|e| Error::HostResolution(format!("no route to {}: {e}", self.probe_target)))?;

        let ip = socket
            .local_addr()
            .map_err(|e| Error::Io("failed to read local socket address", e))?
            .ip();

        if ip.is_unspecified() {
            return Err(Error::HostResolution(
                "no interface address for default route".to_string(),
            ));
        }

        info!("local interface address detected: {}", ip);
        Ok(ip)
    }
}

/// Fetches the external IP address from an HTTP endpoint returning `{"ip": ...}`.
#[derive(Clone, Debug)]
pub struct ExternalIpResolver {
    client: Client,
    endpoint: Url,
}

impl ExternalIpResolver {
    /// Creates a resolver querying `endpoint` with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: Url) -> Result<Self> {
        Self::with_timeout(endpoint, DEFAULT_EXTERNAL_IP_TIMEOUT)
    }

    /// Creates a resolver whose lookup fails after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_timeout(endpoint: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::HostResolution(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl HostResolver for ExternalIpResolver {
    async fn resolve(&self) -> Result<IpAddr> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::HostResolution(format!("failed to fetch external IP: {e}")))?;

        let json_response = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| Error::HostResolution(format!("failed to parse JSON response: {e}")))?;

        let ip_text = json_response["ip"]
            .as_str()
            .ok_or_else(|| Error::HostResolution("IP field not found in response".to_string()))?;

        let ip_addr = ip_text
            .parse::<IpAddr>()
            .map_err(|e| Error::HostResolution(format!("failed to parse external IP: {e}")))?;

        info!("external IP detected: {}", ip_addr);
        Ok(ip_addr)
    }
}

/// Tries a primary resolver and degrades to a fixed fallback address.
#[derive(Clone)]
pub struct FallbackResolver {
    primary: Arc<dyn HostResolver>,
    fallback: Option<IpAddr>,
}

impl FallbackResolver {
    /// Creates a resolver. Without a fallback, primary failures propagate.
    #[must_use]
    pub fn new(primary: Arc<dyn HostResolver>, fallback: Option<IpAddr>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl HostResolver for FallbackResolver {
    async fn resolve(&self) -> Result<IpAddr> {
        match self.primary.resolve().await {
            Ok(ip) => Ok(ip),
            Err(e) => match self.fallback {
                Some(fallback) => {
                    warn!("host resolution failed ({}), using fallback {}", e, fallback);
                    Ok(fallback)
                }
                None => Err(e),
            },
        }
    }
}
