//! Serde descriptors for probes and the factory that builds them.

use std::sync::Arc;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::probes::{ExecProbe, HttpProbe, Probe, TcpProbe};

/// Declarative probe description as written in the stack file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// HTTP GET against `url`.
    Http {
        /// Endpoint to query.
        url: String,

        /// Required status code. Any 2xx when unset.
        #[serde(default)]
        expect_status: Option<u16>,
    },

    /// TCP connect to `address`.
    Tcp {
        /// `host:port` address.
        address: String,
    },

    /// Command exiting with code 0.
    Exec {
        /// Executable name or path.
        program: String,

        /// Arguments passed to the executable.
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Builds probes from descriptors.
pub trait ProbeFactory
where
    Self: Send + Sync + 'static,
{
    /// Builds the probe for `service`.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be turned into a probe.
    fn build(&self, service: &str, spec: &ProbeSpec) -> Result<Arc<dyn Probe>>;
}

/// Factory for the built-in HTTP, TCP and exec probes.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultProbeFactory;

impl ProbeFactory for DefaultProbeFactory {
    fn build(&self, service: &str, spec: &ProbeSpec) -> Result<Arc<dyn Probe>> {
        match spec {
            ProbeSpec::Http { url, expect_status } => {
                let parsed = Url::parse(url).map_err(|e| Error::Url(url.clone(), e))?;

                let expect_status = expect_status
                    .map(|code| {
                        StatusCode::from_u16(code).map_err(|_| Error::InvalidSpec {
                            service: service.to_string(),
                            reason: format!("{code} is not a valid HTTP status"),
                        })
                    })
                    .transpose()?;

                Ok(Arc::new(HttpProbe::new(parsed, expect_status)?))
            }
            ProbeSpec::Tcp { address } => {
                if !address.contains(':') {
                    return Err(Error::InvalidSpec {
                        service: service.to_string(),
                        reason: format!("tcp address `{address}` has no port"),
                    });
                }

                Ok(Arc::new(TcpProbe::new(address.clone())))
            }
            ProbeSpec::Exec { program, args } => {
                if program.is_empty() {
                    return Err(Error::InvalidSpec {
                        service: service.to_string(),
                        reason: "exec probe has an empty program".to_string(),
                    });
                }

                Ok(Arc::new(ExecProbe::new(program.clone(), args.clone())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        probe: ProbeSpec,
    }

    #[test]
    fn test_probe_specs_parse_from_toml() {
        let http: Wrapper =
            toml::from_str("probe = { kind = \"http\", url = \"http://127.0.0.1:8030/\" }")
                .unwrap();
        assert_eq!(
            http.probe,
            ProbeSpec::Http {
                url: "http://127.0.0.1:8030/".to_string(),
                expect_status: None,
            }
        );

        let exec: Wrapper = toml::from_str(
            "probe = { kind = \"exec\", program = \"pg_isready\", args = [\"-h\", \"127.0.0.1\"] }",
        )
        .unwrap();
        assert_eq!(
            exec.probe,
            ProbeSpec::Exec {
                program: "pg_isready".to_string(),
                args: vec!["-h".to_string(), "127.0.0.1".to_string()],
            }
        );
    }

    #[test]
    fn test_factory_builds_each_kind() {
        let factory = DefaultProbeFactory;

        let http = factory
            .build(
                "ipfs",
                &ProbeSpec::Http {
                    url: "http://127.0.0.1:5001/api/v0/version".to_string(),
                    expect_status: Some(405),
                },
            )
            .unwrap();
        assert_eq!(http.kind(), "http");

        let tcp = factory
            .build(
                "anvil",
                &ProbeSpec::Tcp {
                    address: "127.0.0.1:8545".to_string(),
                },
            )
            .unwrap();
        assert_eq!(tcp.kind(), "tcp");
    }

    #[test]
    fn test_factory_rejects_bad_descriptors() {
        let factory = DefaultProbeFactory;

        assert!(matches!(
            factory.build(
                "ipfs",
                &ProbeSpec::Http {
                    url: "not a url".to_string(),
                    expect_status: None,
                }
            ),
            Err(Error::Url(..))
        ));

        assert!(matches!(
            factory.build(
                "anvil",
                &ProbeSpec::Tcp {
                    address: "localhost".to_string(),
                }
            ),
            Err(Error::InvalidSpec { .. })
        ));
    }
}
