use std::process::ExitCode;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Orchestrator error.
    #[error(transparent)]
    Orchestrator(#[from] devstack_orchestrator::Error),

    /// Host resolver could not be built.
    #[error(transparent)]
    Resolver(#[from] devstack_templater::Error),

    /// Could not set global default subscriber.
    #[error("could not set global default subscriber: {0}")]
    SetTracing(#[from] tracing::dispatcher::SetGlobalDefaultError),
}

impl Error {
    /// Maps the error to the process exit code.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Orchestrator(e) if e.is_structural() => ExitCode::from(2),
            Self::Orchestrator(devstack_orchestrator::Error::RecoveryExhausted { .. }) => {
                ExitCode::from(3)
            }
            _ => ExitCode::FAILURE,
        }
    }
}
