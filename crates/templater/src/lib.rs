//! Rendering of environment-specific service configuration.
//!
//! Templates use `{{ name }}` placeholders. Rendering is a single substitution
//! pass, so identical templates and variables always produce identical bytes.
//! The `host_ip` variable is supplied by a [`HostResolver`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod artifacts;
mod error;
mod resolver;
mod template;

pub use artifacts::{ArtifactContent, ArtifactSpec, LoadedArtifact, write_artifact};
pub use error::{Error, Result};
pub use resolver::{
    DEFAULT_EXTERNAL_IP_ENDPOINT, DEFAULT_EXTERNAL_IP_TIMEOUT, ExternalIpResolver, FallbackResolver, FixedResolver,
    HostResolver, LocalInterfaceResolver,
};
pub use template::{ConfigTemplate, Rendered, RenderedSet, TemplateSet, Variables};

/// Variable holding the resolved host address.
pub const HOST_IP_VARIABLE: &str = "host_ip";

/// Variable holding the run's work directory.
pub const WORK_DIR_VARIABLE: &str = "work_dir";

/// Variables supplied by the engine rather than the stack file.
pub const BUILTIN_VARIABLES: &[&str] = &[HOST_IP_VARIABLE, WORK_DIR_VARIABLE];
