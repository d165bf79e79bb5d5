use thiserror::Error;

/// Result type for probe construction.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building probes.
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// Probe descriptor is not usable.
    #[error("invalid probe for service `{service}`: {reason}")]
    InvalidSpec {
        /// Service the probe belongs to.
        service: String,

        /// What is wrong with the descriptor.
        reason: String,
    },

    /// URL could not be parsed.
    #[error("invalid probe URL `{0}`: {1}")]
    Url(String, #[source] url::ParseError),
}
