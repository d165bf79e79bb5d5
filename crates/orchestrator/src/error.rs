use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::instance::InstanceState;

/// Result type for orchestration.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating a stack.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be rendered.
    #[error("failed to render configuration: {0}")]
    ConfigRender(#[from] devstack_templater::Error),

    /// Service dependencies form a cycle.
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// Two services share a name.
    #[error("service `{0}` is defined more than once")]
    DuplicateService(String),

    /// Illegal instance state transition.
    #[error("service `{service}` cannot go from {from} to {to}")]
    IllegalTransition {
        /// Service whose instance was updated.
        service: String,

        /// Current state.
        from: InstanceState,

        /// Requested state.
        to: InstanceState,
    },

    /// Run was interrupted.
    #[error("run interrupted")]
    Interrupted,

    /// Run options are unusable.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// A service setting is unusable.
    #[error("service `{service}` is invalid: {reason}")]
    InvalidService {
        /// Service name.
        service: String,

        /// What is wrong.
        reason: String,
    },

    /// Stack file could not be parsed.
    #[error("invalid stack file {}: {source}", .path.display())]
    InvalidStackFile {
        /// Path of the stack file.
        path: PathBuf,

        /// Parse error.
        #[source]
        source: toml::de::Error,
    },

    /// IO error.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] io::Error),

    /// Observer descriptor could not be built.
    #[error(transparent)]
    Observer(#[from] devstack_validation::Error),

    /// Probe descriptor could not be built.
    #[error(transparent)]
    Probe(#[from] devstack_probe::Error),

    /// Every allowed attempt failed.
    #[error("recovery exhausted after {attempts} attempt(s):\n  {}", .failures.join("\n  "))]
    RecoveryExhausted {
        /// Number of attempts made.
        attempts: u32,

        /// Every failure, prefixed with its attempt index.
        failures: Vec<String>,
    },

    /// Some services could not be stopped.
    #[error("failed to stop services: {}", .0.join(", "))]
    Shutdown(Vec<String>),

    /// A service depends on a service that does not exist.
    #[error("service `{service}` depends on unknown service `{dependency}`")]
    UnknownDependency {
        /// Dependent service.
        service: String,

        /// Missing dependency.
        dependency: String,
    },

    /// A rule targets a service that does not exist.
    #[error("rule `{rule}` targets unknown service `{target}`")]
    UnknownRuleTarget {
        /// Rule label.
        rule: String,

        /// Missing target.
        target: String,
    },

    /// `max_attempts` is zero.
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
}

impl Error {
    /// Returns true for errors detected before any service is started.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::ConfigRender(_)
                | Self::DependencyCycle(_)
                | Self::DuplicateService(_)
                | Self::InvalidOptions(_)
                | Self::InvalidService { .. }
                | Self::InvalidStackFile { .. }
                | Self::Observer(_)
                | Self::Probe(_)
                | Self::UnknownDependency { .. }
                | Self::UnknownRuleTarget { .. }
                | Self::ZeroAttempts
        )
    }
}
