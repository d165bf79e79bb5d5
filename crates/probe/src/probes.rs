//! Built-in readiness probes.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::trace;
use url::Url;

use crate::error::{Error, Result};

/// Upper bound for a single HTTP request; polling bounds it further.
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a single readiness check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProbeStatus {
    /// The service accepts the operations its dependents require.
    Ready,

    /// The service is not ready yet.
    NotReady(String),
}

/// A single readiness check against one service.
#[async_trait]
pub trait Probe
where
    Self: Send + Sync + 'static,
{
    /// Short name of the probe type, used in logs.
    fn kind(&self) -> &'static str;

    /// Checks readiness once.
    async fn check(&self) -> ProbeStatus;
}

/// Ready when a GET returns the expected status, or any 2xx when unset.
#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: Client,
    url: Url,
    expect_status: Option<StatusCode>,
}

impl HttpProbe {
    /// Creates an HTTP probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: Url, expect_status: Option<StatusCode>) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(Error::Client)?;

        Ok(Self {
            client,
            url,
            expect_status,
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn check(&self) -> ProbeStatus {
        let response = match self.client.get(self.url.clone()).send().await {
            Ok(response) => response,
            Err(e) => return ProbeStatus::NotReady(format!("GET {} failed: {e}", self.url)),
        };

        let status = response.status();
        trace!("GET {} returned {}", self.url, status);

        let ready = self
            .expect_status
            .map_or_else(|| status.is_success(), |expected| status == expected);

        if ready {
            ProbeStatus::Ready
        } else {
            ProbeStatus::NotReady(format!("GET {} returned {status}", self.url))
        }
    }
}

/// Ready when a TCP connection can be established.
#[derive(Clone, Debug)]
pub struct TcpProbe {
    address: String,
}

impl TcpProbe {
    /// Creates a TCP probe for a `host:port` address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn check(&self) -> ProbeStatus {
        match TcpStream::connect(&self.address).await {
            Ok(_) => ProbeStatus::Ready,
            Err(e) => ProbeStatus::NotReady(format!("connect to {} failed: {e}", self.address)),
        }
    }
}

/// Ready when a command exits with code 0.
#[derive(Clone, Debug)]
pub struct ExecProbe {
    program: String,
    args: Vec<String>,
}

impl ExecProbe {
    /// Creates a command probe, e.g. `pg_isready -h 127.0.0.1`.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Probe for ExecProbe {
    fn kind(&self) -> &'static str {
        "exec"
    }

    async fn check(&self) -> ProbeStatus {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => ProbeStatus::Ready,
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                ProbeStatus::NotReady(format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    stderr.trim()
                ))
            }
            Err(e) => ProbeStatus::NotReady(format!("failed to run {}: {e}", self.program)),
        }
    }
}
