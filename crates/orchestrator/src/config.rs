//! Stack file loading.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use devstack_bootable::{LogFormat, StartDirective};
use devstack_probe::{Backoff, PollPolicy, ProbeSpec};
use devstack_templater::ArtifactSpec;
use devstack_validation::{ObserverSpec, ValidationRule};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Name of the stack file inside the config directory.
pub const STACK_FILE: &str = "stack.toml";

const fn default_poll_interval_ms() -> u64 {
    1_000
}

/// Static description of one service.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Unique name.
    pub name: String,

    /// How the service is started. Strings may contain placeholders.
    pub start: StartDirective,

    /// Services that must be healthy before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Readiness probe.
    pub probe: ProbeSpec,

    /// Readiness timeout overriding the run-wide service timeout.
    #[serde(default)]
    pub readiness_timeout_secs: Option<u64>,

    /// Wait between readiness checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Growth of the wait between readiness checks.
    #[serde(default)]
    pub backoff: Backoff,

    /// State destroyed on recovery. Relative paths are below the work directory.
    #[serde(default)]
    pub persisted_state: Vec<PathBuf>,

    /// Environment variables. Values may contain placeholders.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Files written to the service directory before each attempt.
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,

    /// How validation rules read this service's attributes.
    #[serde(default)]
    pub observer: Option<ObserverSpec>,

    /// Format of the service's log lines.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl ServiceSpec {
    /// Creates a spec with no dependencies and default timing.
    #[must_use]
    pub fn new(name: impl Into<String>, start: StartDirective, probe: ProbeSpec) -> Self {
        Self {
            name: name.into(),
            start,
            depends_on: Vec::new(),
            probe,
            readiness_timeout_secs: None,
            poll_interval_ms: default_poll_interval_ms(),
            backoff: Backoff::Fixed,
            persisted_state: Vec::new(),
            env: BTreeMap::new(),
            artifacts: Vec::new(),
            observer: None,
            log_format: LogFormat::Plain,
        }
    }

    /// Adds dependencies.
    #[must_use]
    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(names.into_iter().map(Into::into));
        self
    }

    /// Returns the poll policy, falling back to `service_timeout`.
    #[must_use]
    pub fn poll_policy(&self, service_timeout: Duration) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            timeout: self
                .readiness_timeout_secs
                .map_or(service_timeout, Duration::from_secs),
            backoff: self.backoff,
        }
    }

    /// Checks settings that would make probing or recovery misbehave.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidService` for a zero poll interval and for
    /// persisted-state entries that are empty, climb out with `..`, or name
    /// no file below a directory.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidService {
            service: self.name.clone(),
            reason,
        };

        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be at least 1".to_string()));
        }

        for path in &self.persisted_state {
            if path.components().any(|component| component == Component::ParentDir) {
                return Err(invalid(format!(
                    "persisted state `{}` must not contain `..`",
                    path.display()
                )));
            }

            if !path
                .components()
                .any(|component| matches!(component, Component::Normal(_)))
            {
                return Err(invalid(format!(
                    "persisted state `{}` must name a path below a directory",
                    path.display()
                )));
            }
        }

        Ok(())
    }

    /// Returns persisted-state locations resolved against `work_dir`.
    #[must_use]
    pub fn persisted_paths(&self, work_dir: &Path) -> Vec<PathBuf> {
        self.persisted_state
            .iter()
            .map(|path| {
                if path.is_absolute() {
                    path.clone()
                } else {
                    work_dir.join(path)
                }
            })
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StackFile {
    #[serde(default)]
    variables: BTreeMap<String, String>,

    #[serde(default)]
    services: Vec<ServiceSpec>,

    #[serde(default)]
    rules: Vec<ValidationRule>,
}

/// A declarative stack: services, validation rules and template variables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stack {
    /// Directory artifact sources are resolved against.
    pub config_dir: PathBuf,

    /// User-defined template variables.
    pub variables: BTreeMap<String, String>,

    /// Services in declaration order.
    pub services: Vec<ServiceSpec>,

    /// Post-readiness validation rules.
    pub rules: Vec<ValidationRule>,
}

impl Stack {
    /// Creates a stack from parts, resolving artifacts against `config_dir`.
    #[must_use]
    pub fn new(
        config_dir: impl Into<PathBuf>,
        services: Vec<ServiceSpec>,
        rules: Vec<ValidationRule>,
    ) -> Self {
        Self {
            config_dir: config_dir.into(),
            variables: BTreeMap::new(),
            services,
            rules,
        }
    }

    /// Loads `stack.toml` from `config_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(config_dir: impl Into<PathBuf>) -> Result<Self> {
        let config_dir = config_dir.into();
        let path = config_dir.join(STACK_FILE);

        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Io("failed to read stack file", e))?;

        debug!("loaded stack file {}", path.display());

        Self::from_toml(config_dir, &text)
    }

    /// Parses stack file text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid stack file.
    pub fn from_toml(config_dir: impl Into<PathBuf>, text: &str) -> Result<Self> {
        let config_dir = config_dir.into();

        let file: StackFile = toml::from_str(text).map_err(|source| Error::InvalidStackFile {
            path: config_dir.join(STACK_FILE),
            source,
        })?;

        Ok(Self {
            config_dir,
            variables: file.variables,
            services: file.services,
            rules: file.rules,
        })
    }

    /// Returns the named service.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: &str = r#"
[variables]
postgres_user = "graph-node"
postgres_db = "graph-node"

[[services]]
name = "postgres"
start = { image = "postgres:16", ports = ["5432:5432"], volumes = ["{{ work_dir }}/postgres/data:/var/lib/postgresql/data"] }
probe = { kind = "exec", program = "pg_isready", args = ["-h", "127.0.0.1"] }
persisted_state = ["postgres/data"]
log_format = "postgres"

[services.env]
POSTGRES_USER = "{{ postgres_user }}"

[[services]]
name = "graph-node"
start = { command = "graph-node", args = ["--config", "config.toml"] }
depends_on = ["postgres"]
probe = { kind = "http", url = "http://127.0.0.1:8030/" }
readiness_timeout_secs = 300
poll_interval_ms = 500
backoff = { kind = "linear", step_ms = 500, max_ms = 5000 }

[[rules]]
target = "postgres"
query = "server_encoding"
expected = "UTF8"
"#;

    #[test]
    fn test_stack_file_parses() {
        let stack = Stack::from_toml("/etc/devstack", STACK).unwrap();

        assert_eq!(stack.variables["postgres_user"], "graph-node");
        assert_eq!(stack.services.len(), 2);
        assert_eq!(stack.rules.len(), 1);

        let postgres = stack.service("postgres").unwrap();
        assert_eq!(postgres.log_format, LogFormat::Postgres);
        assert_eq!(postgres.poll_interval_ms, 1_000);
        assert_eq!(
            postgres.persisted_paths(Path::new("/tmp/devstack")),
            vec![PathBuf::from("/tmp/devstack/postgres/data")]
        );

        let graph_node = stack.service("graph-node").unwrap();
        assert_eq!(graph_node.depends_on, vec!["postgres"]);
    }

    #[test]
    fn test_poll_policy_prefers_service_timeout() {
        let stack = Stack::from_toml("/etc/devstack", STACK).unwrap();
        let run_wide = Duration::from_secs(120);

        let postgres = stack.service("postgres").unwrap().poll_policy(run_wide);
        assert_eq!(postgres.timeout, run_wide);
        assert_eq!(postgres.interval, Duration::from_secs(1));

        let graph_node = stack.service("graph-node").unwrap().poll_policy(run_wide);
        assert_eq!(graph_node.timeout, Duration::from_secs(300));
        assert_eq!(graph_node.interval, Duration::from_millis(500));
        assert_eq!(
            graph_node.backoff,
            Backoff::Linear {
                step_ms: 500,
                max_ms: 5_000
            }
        );
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let result = Stack::from_toml(
            "/etc/devstack",
            "[[services]]\nname = \"a\"\nstart = { command = \"a\" }\nprobe = { kind = \"tcp\", address = \"127.0.0.1:1\" }\ndepends = [\"b\"]\n",
        );

        assert!(matches!(result, Err(Error::InvalidStackFile { .. })));
    }

    #[test]
    fn test_zero_poll_interval_is_invalid() {
        let mut spec = Stack::from_toml("/etc/devstack", STACK)
            .unwrap()
            .service("graph-node")
            .unwrap()
            .clone();
        assert!(spec.validate().is_ok());

        spec.poll_interval_ms = 0;
        match spec.validate() {
            Err(Error::InvalidService { service, reason }) => {
                assert_eq!(service, "graph-node");
                assert!(reason.contains("poll_interval_ms"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_persisted_state_must_stay_below_a_directory() {
        let mut spec = Stack::from_toml("/etc/devstack", STACK)
            .unwrap()
            .service("postgres")
            .unwrap()
            .clone();
        assert!(spec.validate().is_ok());

        for path in ["", ".", "/", "../postgres", "postgres/../../data"] {
            spec.persisted_state = vec![PathBuf::from(path)];
            let err = spec.validate().unwrap_err();
            assert!(err.is_structural(), "{path}: {err}");
        }

        spec.persisted_state = vec![PathBuf::from("/var/lib/devstack/postgres")];
        assert!(spec.validate().is_ok());
    }
}
