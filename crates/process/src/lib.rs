//! Process runtime for stack services.
//!
//! Implements the [`ServiceRuntime`](devstack_bootable::ServiceRuntime) primitive
//! by spawning each service as a supervised child process. Container images are
//! run in the foreground through the container engine so that they are
//! supervised the same way as local executables.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//!
//! use devstack_bootable::{Launch, LogFormat, ServiceRuntime, StartDirective};
//! use devstack_process::ProcessRuntime;
//!
//! async fn run() -> Result<(), devstack_bootable::BoxError> {
//!     let runtime = ProcessRuntime::default();
//!
//!     runtime
//!         .start(&Launch {
//!             name: "ipfs".to_string(),
//!             directive: StartDirective::Command {
//!                 command: "ipfs".to_string(),
//!                 args: vec!["daemon".to_string()],
//!             },
//!             env: BTreeMap::new(),
//!             working_dir: "/tmp/devstack/ipfs".into(),
//!             log_format: LogFormat::Plain,
//!         })
//!         .await?;
//!
//!     runtime.stop("ipfs").await
//! }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod error;
mod logs;
mod spawn;

pub use error::{Error, Result};
pub use spawn::{CommandLine, DEFAULT_STOP_TIMEOUT, ProcessRuntime, ProcessRuntimeOptions};
