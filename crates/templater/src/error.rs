//! Error types for configuration rendering.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for configuration rendering.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while rendering configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// Host address could not be resolved.
    #[error("failed to resolve host address: {0}")]
    HostResolution(String),

    /// Artifact output path escapes the service directory.
    #[error("artifact output path `{0}` must be relative and stay inside the service directory")]
    InvalidOutputPath(PathBuf),

    /// IO error.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] io::Error),

    /// A template references variables that were not supplied.
    #[error("template `{template}` references undefined variables: {}", .variables.join(", "))]
    MissingVariables {
        /// Template identifier.
        template: String,

        /// Names of the undefined variables.
        variables: Vec<String>,
    },

    /// An artifact source could not be read.
    #[error("failed to read artifact source {}: {source}", .path.display())]
    ReadArtifact {
        /// Path of the artifact source.
        path: PathBuf,

        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}
