//! Readiness probes for stack services.
//!
//! A [`Probe`] performs one check; [`poll`] repeats it under a [`PollPolicy`]
//! until the service is ready, the time budget is spent, or polling is
//! cancelled.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod poll;
mod probes;
mod spec;

pub use error::{Error, Result};
pub use poll::{Backoff, DEFAULT_POLL_INTERVAL, PollOutcome, PollPolicy, poll};
pub use probes::{ExecProbe, HttpProbe, Probe, ProbeStatus, TcpProbe};
pub use spec::{DefaultProbeFactory, ProbeFactory, ProbeSpec};
