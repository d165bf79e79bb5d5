use std::io;
use std::process::ExitStatus;

use thiserror::Error;

/// Result type for observers.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while observing service attributes.
#[derive(Debug, Error)]
pub enum Error {
    /// Observer command exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        /// Program that was run.
        program: String,

        /// Exit status.
        status: ExitStatus,

        /// Captured standard error.
        stderr: String,
    },

    /// HTTP request failed.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Observer descriptor is not usable.
    #[error("invalid observer for service `{service}`: {reason}")]
    InvalidSpec {
        /// Service the observer belongs to.
        service: String,

        /// What is wrong with the descriptor.
        reason: String,
    },

    /// IO error.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] io::Error),

    /// Response body was not valid JSON.
    #[error("response is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    /// Metrics exposition line could not be parsed.
    #[error("malformed metrics line `{0}`")]
    MalformedMetric(String),

    /// Query did not match anything in the observed document.
    #[error("query `{0}` matched nothing")]
    NotFound(String),

    /// Query could not be substituted into the observer command.
    #[error(transparent)]
    Template(#[from] devstack_templater::Error),

    /// URL could not be parsed.
    #[error("invalid observer URL `{0}`: {1}")]
    Url(String, #[source] url::ParseError),
}
