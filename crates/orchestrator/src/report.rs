//! Attempt records and the final run result.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use devstack_bootable::ServiceRuntime;
use devstack_validation::RuleOutcome;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::instance::{InstanceState, ServiceInstance};

/// Why an attempt failed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// Service did not become healthy within its readiness timeout.
    StartupTimeout {
        /// Service name.
        service: String,

        /// Time spent probing, in milliseconds.
        elapsed_ms: u64,

        /// Number of readiness checks.
        polls: u32,

        /// Reason given by the last failed check.
        last_error: Option<String>,
    },

    /// The start primitive returned an error.
    StartFailed {
        /// Service name.
        service: String,

        /// Error reported by the runtime.
        reason: String,
    },

    /// The service exited while it was being probed.
    ServiceExited {
        /// Service name.
        service: String,

        /// Exit code, if reported.
        code: Option<i32>,
    },

    /// The attempt deadline passed before every service was healthy.
    AttemptDeadline {
        /// Deadline, in milliseconds.
        deadline_ms: u64,

        /// Services that were not healthy yet.
        pending: Vec<String>,
    },

    /// A service could not be confirmed stopped after a failed attempt.
    StopFailed {
        /// Service name.
        service: String,

        /// Error reported by the runtime.
        reason: String,
    },

    /// A service task ended abnormally.
    TaskAborted {
        /// Join error description.
        reason: String,
    },

    /// A validation rule did not hold.
    Validation {
        /// Rule label.
        rule: String,

        /// Service the rule targets.
        target: String,

        /// Observed value, if any.
        observed: Option<String>,

        /// Explanation.
        detail: String,
    },
}

impl Failure {
    /// Returns the services whose persisted state this failure implicates.
    #[must_use]
    pub fn implicated(&self) -> Vec<&str> {
        match self {
            Self::StartupTimeout { service, .. }
            | Self::StartFailed { service, .. }
            | Self::ServiceExited { service, .. } => vec![service.as_str()],
            Self::AttemptDeadline { pending, .. } => pending.iter().map(String::as_str).collect(),
            Self::Validation { target, .. } => vec![target.as_str()],
            Self::StopFailed { .. } | Self::TaskAborted { .. } => Vec::new(),
        }
    }

    pub(crate) fn from_outcome(outcome: &RuleOutcome) -> Self {
        Self::Validation {
            rule: outcome.rule.label(),
            target: outcome.rule.target.clone(),
            observed: outcome.observed.clone(),
            detail: outcome.detail.clone(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartupTimeout {
                service,
                elapsed_ms,
                polls,
                last_error,
            } => {
                write!(
                    f,
                    "{service} not healthy after {elapsed_ms}ms ({polls} checks)"
                )?;
                if let Some(last_error) = last_error {
                    write!(f, ": {last_error}")?;
                }
                Ok(())
            }
            Self::StartFailed { service, reason } => {
                write!(f, "{service} failed to start: {reason}")
            }
            Self::ServiceExited {
                service,
                code: Some(code),
            } => write!(f, "{service} exited with code {code} before becoming healthy"),
            Self::ServiceExited {
                service,
                code: None,
            } => write!(f, "{service} exited before becoming healthy"),
            Self::AttemptDeadline {
                deadline_ms,
                pending,
            } => write!(
                f,
                "attempt deadline of {deadline_ms}ms passed with {} not healthy",
                pending.join(", ")
            ),
            Self::StopFailed { service, reason } => {
                write!(f, "{service} could not be stopped: {reason}")
            }
            Self::TaskAborted { reason } => write!(f, "service task aborted: {reason}"),
            Self::Validation { rule, detail, .. } => write!(f, "rule {rule} failed: {detail}"),
        }
    }
}

/// Per-service status within one attempt.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ServiceReport {
    /// Service name.
    pub name: String,

    /// Final state in the attempt.
    pub state: InstanceState,

    /// Milliseconds from attempt start to invoking the start primitive.
    pub time_to_start_ms: Option<u64>,

    /// Milliseconds from invoking the start primitive to healthy.
    pub time_to_ready_ms: Option<u64>,

    /// Number of readiness checks.
    pub polls: u32,

    /// Failure or cancellation reason.
    pub detail: Option<String>,
}

impl From<&ServiceInstance> for ServiceReport {
    fn from(instance: &ServiceInstance) -> Self {
        Self {
            name: instance.name().to_string(),
            state: instance.state(),
            time_to_start_ms: instance.time_to_start().map(millis),
            time_to_ready_ms: instance.time_to_ready().map(millis),
            polls: instance.polls(),
            detail: instance.detail().map(str::to_string),
        }
    }
}

/// Record of one render, start and validate cycle.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RunAttempt {
    /// 1-based attempt index.
    pub index: u32,

    /// Services in the order they were started.
    pub start_order: Vec<String>,

    /// Status of every service.
    pub services: Vec<ServiceReport>,

    /// Startup and validation failures.
    pub failures: Vec<Failure>,

    /// Services whose probing was cancelled after another failure.
    pub cancelled: Vec<String>,

    /// Outcome of every validation rule, empty if validation did not run.
    pub outcomes: Vec<RuleOutcome>,

    /// Variables no template referenced.
    pub render_warnings: Vec<String>,

    /// Whether the attempt succeeded.
    pub success: bool,
}

impl RunAttempt {
    /// Returns the services implicated by this attempt's failures.
    #[must_use]
    pub fn implicated(&self) -> BTreeSet<&str> {
        self.failures.iter().flat_map(Failure::implicated).collect()
    }
}

/// Handle on a running stack.
pub struct RunningStack {
    runtime: Arc<dyn ServiceRuntime>,
    start_order: Vec<String>,
}

impl RunningStack {
    pub(crate) fn new(runtime: Arc<dyn ServiceRuntime>, start_order: Vec<String>) -> Self {
        Self {
            runtime,
            start_order,
        }
    }

    /// Returns services in the order they were started.
    #[must_use]
    pub fn start_order(&self) -> &[String] {
        &self.start_order
    }

    /// Stops every service in reverse start order.
    ///
    /// # Errors
    ///
    /// Returns `Error::Shutdown` naming the services that could not be stopped.
    pub async fn shutdown(self) -> Result<()> {
        let failures = stop_in_reverse(self.runtime.as_ref(), &self.start_order).await;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Shutdown(
                failures.iter().map(ToString::to_string).collect(),
            ))
        }
    }
}

impl fmt::Debug for RunningStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningStack")
            .field("start_order", &self.start_order)
            .finish_non_exhaustive()
    }
}

/// Stops services in reverse start order, returning one failure per service
/// that could not be stopped.
pub(crate) async fn stop_in_reverse(runtime: &dyn ServiceRuntime, start_order: &[String]) -> Vec<Failure> {
    let mut failures = Vec::new();

    for name in start_order.iter().rev() {
        info!(service = %name, "stopping");

        if let Err(e) = runtime.stop(name).await {
            warn!(service = %name, "failed to stop: {}", e);
            failures.push(Failure::StopFailed {
                service: name.clone(),
                reason: e.to_string(),
            });
        }
    }

    failures
}

/// Result of a run.
#[derive(Debug, Serialize)]
pub struct RunResult {
    /// Whether an attempt succeeded.
    pub success: bool,

    /// Every attempt in order.
    pub attempts: Vec<RunAttempt>,

    /// Running stack on success.
    #[serde(skip)]
    pub stack: Option<RunningStack>,
}

impl RunResult {
    /// Returns the number of attempts made.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.attempts.last().map_or(0, |attempt| attempt.index)
    }

    /// Returns per-service status from the final attempt.
    #[must_use]
    pub fn services(&self) -> &[ServiceReport] {
        self.attempts
            .last()
            .map_or(&[], |attempt| attempt.services.as_slice())
    }

    /// Returns every failure with its attempt index.
    pub fn failures(&self) -> impl Iterator<Item = (u32, &Failure)> {
        self.attempts
            .iter()
            .flat_map(|attempt| attempt.failures.iter().map(move |f| (attempt.index, f)))
    }

    /// Converts an unsuccessful result into `Error::RecoveryExhausted`.
    ///
    /// # Errors
    ///
    /// Returns `Error::RecoveryExhausted` with the full failure history when no
    /// attempt succeeded.
    pub fn ensure_success(self) -> Result<Self> {
        if self.success {
            return Ok(self);
        }

        Err(Error::RecoveryExhausted {
            attempts: self.attempt_count(),
            failures: self
                .failures()
                .map(|(index, failure)| format!("attempt {index}: {failure}"))
                .collect(),
        })
    }
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
