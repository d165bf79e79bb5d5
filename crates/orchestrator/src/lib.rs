//! Dependency-ordered startup, validation and recovery of a local service stack.
//!
//! An [`Orchestrator`] runs attempts. Each attempt renders configuration,
//! starts services as soon as their dependencies are healthy, probes them to
//! readiness and evaluates the stack's validation rules. A failed attempt stops
//! every started service, destroys the persisted state of the services that
//! caused the failure and starts over, up to `max_attempts` times.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod config;
mod error;
mod instance;
mod recovery;
mod report;
mod sequencer;
mod topology;

pub use config::{STACK_FILE, ServiceSpec, Stack};
pub use error::{Error, Result};
pub use instance::{InstanceState, ServiceInstance};
pub use recovery::{RecoveryController, RecoveryDecision};
pub use report::{Failure, RunAttempt, RunResult, RunningStack, ServiceReport};
pub use sequencer::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_WORKERS, DEFAULT_SERVICE_TIMEOUT, Orchestrator,
    OrchestratorOptions, Rendering, RunOptions,
};
pub use topology::Topology;
