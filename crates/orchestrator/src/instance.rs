//! Per-attempt runtime record of one service.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Lifecycle state of a service within one attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Waiting for dependencies.
    Pending,

    /// Started and being probed.
    Starting,

    /// Probe succeeded.
    Healthy,

    /// Did not become healthy.
    Failed,
}

impl InstanceState {
    /// Returns true for `Healthy` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Healthy | Self::Failed)
    }

    const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Starting) | (Self::Starting, Self::Healthy | Self::Failed)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Runtime record of one service in one attempt.
#[derive(Clone, Debug)]
pub struct ServiceInstance {
    name: String,
    state: InstanceState,
    created_at: Instant,
    starting_at: Option<Instant>,
    started_at: Option<Instant>,
    settled_at: Option<Instant>,
    polls: u32,
    detail: Option<String>,
}

impl ServiceInstance {
    /// Creates a `Pending` instance.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: InstanceState::Pending,
            created_at: Instant::now(),
            starting_at: None,
            started_at: None,
            settled_at: None,
            polls: 0,
            detail: None,
        }
    }

    /// Returns the service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> InstanceState {
        self.state
    }

    /// Moves to `next`, recording the transition time.
    ///
    /// # Errors
    ///
    /// Returns `Error::IllegalTransition` for anything but
    /// `Pending -> Starting -> Healthy | Failed`.
    pub fn transition(&mut self, next: InstanceState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(Error::IllegalTransition {
                service: self.name.clone(),
                from: self.state,
                to: next,
            });
        }

        let now = Instant::now();
        match next {
            InstanceState::Starting => self.starting_at = Some(now),
            _ => self.settled_at = Some(now),
        }
        self.state = next;

        Ok(())
    }

    /// Records when the start primitive was invoked.
    pub const fn record_start(&mut self, at: Instant) {
        self.started_at = Some(at);
    }

    /// Records the number of readiness checks.
    pub const fn record_polls(&mut self, polls: u32) {
        self.polls = polls;
    }

    /// Records why the instance ended the way it did.
    pub fn record_detail(&mut self, detail: impl Into<String>) {
        self.detail = Some(detail.into());
    }

    /// Time from attempt start until the start primitive was invoked.
    #[must_use]
    pub fn time_to_start(&self) -> Option<Duration> {
        self.started_at.map(|at| at - self.created_at)
    }

    /// Time from invoking the start primitive until the service was healthy.
    #[must_use]
    pub fn time_to_ready(&self) -> Option<Duration> {
        match (self.state, self.started_at, self.settled_at) {
            (InstanceState::Healthy, Some(started), Some(settled)) => Some(settled - started),
            _ => None,
        }
    }

    /// Time spent waiting for a worker after becoming eligible.
    #[must_use]
    pub fn queued_for(&self) -> Option<Duration> {
        self.starting_at
            .zip(self.started_at)
            .map(|(eligible, started)| started.saturating_duration_since(eligible))
    }

    /// Returns the number of readiness checks.
    #[must_use]
    pub const fn polls(&self) -> u32 {
        self.polls
    }

    /// Returns the recorded detail.
    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}
