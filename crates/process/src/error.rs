//! Error types for process runtime operations.

use std::io;

use thiserror::Error;

/// Result type for process runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing service processes.
#[derive(Debug, Error)]
pub enum Error {
    /// A service with this name is already running.
    #[error("service `{0}` is already running")]
    AlreadyRunning(String),

    /// IO error.
    #[error("io error: {0} - {1}")]
    Io(&'static str, #[source] io::Error),

    /// A container could not be removed.
    #[error("failed to remove container `{0}`: {1}")]
    RemoveContainer(String, String),

    /// Failed to signal a process group.
    #[error("failed to signal process group {0}: {1}")]
    Signal(i32, #[source] nix::errno::Errno),

    /// Failed to spawn a process.
    #[error("failed to spawn process: {0}")]
    SpawnProcess(String),
}
