//! Abstract interface for starting, stopping and inspecting stack services.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Boxed error returned by runtime implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How a service is started.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StartDirective {
    /// Run a container image.
    Image {
        /// Image reference, e.g. `postgres:16`.
        image: String,

        /// Arguments passed after the image reference.
        #[serde(default)]
        args: Vec<String>,

        /// Published ports in `host:container` form.
        #[serde(default)]
        ports: Vec<String>,

        /// Bind mounts in `host:container` form.
        #[serde(default)]
        volumes: Vec<String>,
    },

    /// Run a local executable.
    Command {
        /// Executable name or path.
        command: String,

        /// Arguments passed to the executable.
        #[serde(default)]
        args: Vec<String>,
    },
}

impl StartDirective {
    /// Returns the program or image this directive refers to.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::Image { image, .. } => image,
            Self::Command { command, .. } => command,
        }
    }
}

/// Format of a service's log lines, used to map them onto tracing levels.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Every stdout line is info, every stderr line is a warning.
    #[default]
    Plain,

    /// Postgres server log lines (`... [pid] LEVEL:  message`).
    Postgres,
}

/// A fully rendered request to start one service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Launch {
    /// Service name, unique within a stack.
    pub name: String,

    /// Start directive with all templates rendered.
    pub directive: StartDirective,

    /// Environment variables with all templates rendered.
    pub env: BTreeMap<String, String>,

    /// Directory holding the service's rendered artifacts.
    pub working_dir: PathBuf,

    /// Log line format.
    pub log_format: LogFormat,
}

/// Observed liveness of a started service.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Liveness {
    /// The service is running.
    Running,

    /// The service exited, with its exit code if one was reported.
    Exited(Option<i32>),

    /// The runtime has no record of the service.
    Unknown,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Exited(Some(code)) => write!(f, "exited with code {code}"),
            Self::Exited(None) => write!(f, "exited"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Start/stop/inspect primitive used by the sequencer.
#[async_trait]
pub trait ServiceRuntime
where
    Self: Send + Sync + 'static,
{
    /// Start the service described by `launch`.
    async fn start(&self, launch: &Launch) -> Result<(), BoxError>;

    /// Stop the named service and wait until it is fully stopped.
    async fn stop(&self, name: &str) -> Result<(), BoxError>;

    /// Inspect the liveness of the named service.
    async fn inspect(&self, name: &str) -> Liveness;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        start: StartDirective,
    }

    #[test]
    fn test_image_directive_from_toml() {
        let wrapper: Wrapper = toml::from_str(
            r#"start = { image = "postgres:16", ports = ["5432:5432"] }"#,
        )
        .unwrap();

        assert_eq!(
            wrapper.start,
            StartDirective::Image {
                image: "postgres:16".to_string(),
                args: vec![],
                ports: vec!["5432:5432".to_string()],
                volumes: vec![],
            }
        );
        assert_eq!(wrapper.start.target(), "postgres:16");
    }

    #[test]
    fn test_command_directive_from_toml() {
        let wrapper: Wrapper =
            toml::from_str(r#"start = { command = "ipfs", args = ["daemon"] }"#).unwrap();

        assert_eq!(
            wrapper.start,
            StartDirective::Command {
                command: "ipfs".to_string(),
                args: vec!["daemon".to_string()],
            }
        );
    }

    #[test]
    fn test_liveness_display() {
        assert_eq!(Liveness::Exited(Some(3)).to_string(), "exited with code 3");
        assert_eq!(Liveness::Running.to_string(), "running");
    }
}
