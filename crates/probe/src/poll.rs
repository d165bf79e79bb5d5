//! Repeated probing until a service is ready, the deadline passes, or the
//! caller cancels.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::probes::{Probe, ProbeStatus};

/// Default wait between checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How the wait between checks evolves.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Always wait the poll interval.
    #[default]
    Fixed,

    /// Add `step_ms` after every failed check, capped at `max_ms`.
    Linear {
        /// Increment per failed check, in milliseconds.
        step_ms: u64,

        /// Upper bound of the wait, in milliseconds.
        max_ms: u64,
    },
}

/// Timing parameters for `poll`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Wait after the first failed check.
    pub interval: Duration,

    /// Overall time budget.
    pub timeout: Duration,

    /// Growth of the wait between checks.
    pub backoff: Backoff,
}

impl PollPolicy {
    /// Creates a fixed-interval policy.
    #[must_use]
    pub const fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            backoff: Backoff::Fixed,
        }
    }

    /// Returns the wait after `failed` consecutive failed checks.
    #[must_use]
    pub fn delay(&self, failed: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Linear { step_ms, max_ms } => {
                let step = Duration::from_millis(step_ms).saturating_mul(failed.saturating_sub(1));
                self.interval
                    .saturating_add(step)
                    .min(Duration::from_millis(max_ms).max(self.interval))
            }
        }
    }
}

/// Result of polling a probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollOutcome {
    /// A check succeeded.
    Healthy {
        /// Time from the first check to the successful one.
        elapsed: Duration,

        /// Number of checks performed.
        polls: u32,
    },

    /// No check succeeded within the timeout.
    TimedOut {
        /// Time spent polling.
        elapsed: Duration,

        /// Number of checks performed.
        polls: u32,

        /// Reason given by the last failed check.
        last_error: Option<String>,
    },

    /// Polling was cancelled.
    Cancelled {
        /// Time spent polling.
        elapsed: Duration,

        /// Number of checks performed.
        polls: u32,
    },
}

impl PollOutcome {
    /// Returns true for `Healthy`.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }

    /// Returns the number of checks performed.
    #[must_use]
    pub const fn polls(&self) -> u32 {
        match self {
            Self::Healthy { polls, .. }
            | Self::TimedOut { polls, .. }
            | Self::Cancelled { polls, .. } => *polls,
        }
    }

    /// Returns the time spent polling.
    #[must_use]
    pub const fn elapsed(&self) -> Duration {
        match self {
            Self::Healthy { elapsed, .. }
            | Self::TimedOut { elapsed, .. }
            | Self::Cancelled { elapsed, .. } => *elapsed,
        }
    }
}

/// Polls `probe` until it reports ready, `policy.timeout` passes, or `cancel`
/// fires.
///
/// The first check runs immediately. Each check is bounded by the time left
/// before the deadline.
pub async fn poll(probe: &dyn Probe, policy: &PollPolicy, cancel: &CancellationToken) -> PollOutcome {
    let started = Instant::now();
    // A timeout too large to represent never expires
    let deadline = started.checked_add(policy.timeout);
    let mut polls = 0u32;

    loop {
        polls += 1;

        let check = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, probe.check()).await,
                None => Ok(probe.check().await),
            }
        };

        let checked = tokio::select! {
            () = cancel.cancelled() => {
                return PollOutcome::Cancelled { elapsed: started.elapsed(), polls };
            }
            checked = check => checked,
        };

        let last_error = match checked {
            Ok(ProbeStatus::Ready) => {
                return PollOutcome::Healthy {
                    elapsed: started.elapsed(),
                    polls,
                };
            }
            Ok(ProbeStatus::NotReady(reason)) => {
                debug!("{} probe not ready: {}", probe.kind(), reason);
                reason
            }
            Err(_) => format!("{} check did not complete in time", probe.kind()),
        };

        let now = Instant::now();
        let wait = match deadline {
            Some(deadline) if now >= deadline => {
                return PollOutcome::TimedOut {
                    elapsed: started.elapsed(),
                    polls,
                    last_error: Some(last_error),
                };
            }
            Some(deadline) => policy.delay(polls).min(deadline - now),
            None => policy.delay(polls),
        };

        tokio::select! {
            () = cancel.cancelled() => {
                return PollOutcome::Cancelled { elapsed: started.elapsed(), polls };
            }
            () = tokio::time::sleep(wait) => {}
        }
    }
}
