//! Serde descriptors for observers and the factory that builds them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::observers::{ExecObserver, HttpJsonObserver, MetricsObserver, Observer};

/// Declarative observer description as written in the stack file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObserverSpec {
    /// Command whose trimmed stdout is the observed value.
    Exec {
        /// Executable name or path.
        program: String,

        /// Arguments, which may reference `{{ query }}`.
        #[serde(default)]
        args: Vec<String>,
    },

    /// JSON document selected by pointer or dotted path.
    HttpJson {
        /// Document URL.
        url: String,
    },

    /// Prometheus text exposition.
    Metrics {
        /// Metrics endpoint URL.
        url: String,
    },
}

/// Builds observers from descriptors.
pub trait ObserverFactory
where
    Self: Send + Sync + 'static,
{
    /// Builds the observer for `service`.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be turned into an observer.
    fn build(&self, service: &str, spec: &ObserverSpec) -> Result<Arc<dyn Observer>>;
}

/// Factory for the built-in observers.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultObserverFactory;

impl ObserverFactory for DefaultObserverFactory {
    fn build(&self, service: &str, spec: &ObserverSpec) -> Result<Arc<dyn Observer>> {
        match spec {
            ObserverSpec::Exec { program, args } => {
                if program.is_empty() {
                    return Err(Error::InvalidSpec {
                        service: service.to_string(),
                        reason: "exec observer has an empty program".to_string(),
                    });
                }

                Ok(Arc::new(ExecObserver::new(program.clone(), args)))
            }
            ObserverSpec::HttpJson { url } => Ok(Arc::new(HttpJsonObserver::new(parse_url(url)?)?)),
            ObserverSpec::Metrics { url } => Ok(Arc::new(MetricsObserver::new(parse_url(url)?)?)),
        }
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| Error::Url(url.to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_specs_parse_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            observer: ObserverSpec,
        }

        let exec: Wrapper = toml::from_str(
            r#"observer = { kind = "exec", program = "psql", args = ["-tAc", "SHOW {{ query }}"] }"#,
        )
        .unwrap();
        assert_eq!(
            exec.observer,
            ObserverSpec::Exec {
                program: "psql".to_string(),
                args: vec!["-tAc".to_string(), "SHOW {{ query }}".to_string()],
            }
        );

        let metrics: Wrapper =
            toml::from_str(r#"observer = { kind = "metrics", url = "http://127.0.0.1:8040/metrics" }"#)
                .unwrap();
        assert_eq!(
            metrics.observer,
            ObserverSpec::Metrics {
                url: "http://127.0.0.1:8040/metrics".to_string(),
            }
        );
    }

    #[test]
    fn test_factory_rejects_bad_url() {
        let result = DefaultObserverFactory.build(
            "graph-node",
            &ObserverSpec::HttpJson {
                url: "::".to_string(),
            },
        );

        assert!(matches!(result, Err(Error::Url(..))));
    }
}
