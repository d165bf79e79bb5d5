//! Common test setup for orchestrator integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use devstack_bootable::{BoxError, Launch, Liveness, ServiceRuntime, StartDirective};
use devstack_orchestrator::{Orchestrator, OrchestratorOptions, ServiceSpec};
use devstack_probe::{Probe, ProbeFactory, ProbeSpec, ProbeStatus};
use devstack_templater::FixedResolver;
use devstack_validation::{Observer, ObserverFactory, ObserverSpec};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Runtime call recorded by `FakeRuntime`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Start(String),
    Stop(String),
}

pub fn start(name: &str) -> Event {
    Event::Start(name.to_string())
}

pub fn stop(name: &str) -> Event {
    Event::Stop(name.to_string())
}

/// In-memory runtime recording every call.
#[derive(Default)]
pub struct FakeRuntime {
    events: Mutex<Vec<Event>>,
    launches: Mutex<Vec<Launch>>,
    running: Mutex<HashMap<String, Instant>>,
    failing: HashSet<String>,
    failing_stop: HashSet<String>,
    exiting: HashMap<String, (Duration, Option<i32>)>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `start` fail for a service.
    pub fn failing_start(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// Makes `stop` fail for a service, which keeps running.
    pub fn failing_stop(mut self, name: &str) -> Self {
        self.failing_stop.insert(name.to_string());
        self
    }

    /// Makes a service exit with `code` some time after it starts.
    pub fn exiting(mut self, name: &str, after: Duration, code: Option<i32>) -> Self {
        self.exiting.insert(name.to_string(), (after, code));
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn started_at(&self, name: &str) -> Option<Instant> {
        self.running.lock().unwrap().get(name).copied()
    }
}

#[async_trait]
impl ServiceRuntime for FakeRuntime {
    async fn start(&self, launch: &Launch) -> Result<(), BoxError> {
        self.events.lock().unwrap().push(start(&launch.name));

        if self.failing.contains(&launch.name) {
            return Err(format!("image for {} not found", launch.name).into());
        }

        self.launches.lock().unwrap().push(launch.clone());
        self.running
            .lock()
            .unwrap()
            .insert(launch.name.clone(), Instant::now());

        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), BoxError> {
        self.events.lock().unwrap().push(stop(name));

        if self.failing_stop.contains(name) {
            return Err(format!("{name} ignored SIGTERM").into());
        }

        self.running.lock().unwrap().remove(name);

        Ok(())
    }

    async fn inspect(&self, name: &str) -> Liveness {
        let Some(started) = self.started_at(name) else {
            return Liveness::Unknown;
        };

        match self.exiting.get(name) {
            Some((after, code)) if started.elapsed() >= *after => Liveness::Exited(*code),
            _ => Liveness::Running,
        }
    }
}

/// Ready a fixed time after the fake runtime started the service.
pub struct ScriptedProbe {
    service: String,
    runtime: Arc<FakeRuntime>,
    ready_after: Option<Duration>,
}

#[async_trait]
impl Probe for ScriptedProbe {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn check(&self) -> ProbeStatus {
        match (self.runtime.started_at(&self.service), self.ready_after) {
            (Some(started), Some(after)) if started.elapsed() >= after => ProbeStatus::Ready,
            _ => ProbeStatus::NotReady(format!("{} is still starting", self.service)),
        }
    }
}

/// Builds scripted probes. Services without an entry are ready immediately.
pub struct ScriptedProbes {
    runtime: Arc<FakeRuntime>,
    ready_after: HashMap<String, Option<Duration>>,
}

impl ScriptedProbes {
    pub fn new(runtime: Arc<FakeRuntime>) -> Self {
        Self {
            runtime,
            ready_after: HashMap::new(),
        }
    }

    pub fn ready_after(mut self, name: &str, after: Duration) -> Self {
        self.ready_after.insert(name.to_string(), Some(after));
        self
    }

    pub fn never_ready(mut self, name: &str) -> Self {
        self.ready_after.insert(name.to_string(), None);
        self
    }
}

impl ProbeFactory for ScriptedProbes {
    fn build(&self, service: &str, _spec: &ProbeSpec) -> devstack_probe::Result<Arc<dyn Probe>> {
        Ok(Arc::new(ScriptedProbe {
            service: service.to_string(),
            runtime: self.runtime.clone(),
            ready_after: self
                .ready_after
                .get(service)
                .copied()
                .unwrap_or(Some(Duration::ZERO)),
        }))
    }
}

/// Reports the encoding stored in a data directory, `UTF8` when it is fresh.
pub struct DataDirObserver {
    marker: PathBuf,
}

#[async_trait]
impl Observer for DataDirObserver {
    async fn observe(&self, query: &str) -> devstack_validation::Result<String> {
        assert_eq!(query, "server_encoding");

        match std::fs::read_to_string(&self.marker) {
            Ok(encoding) => Ok(encoding.trim().to_string()),
            Err(_) => Ok("UTF8".to_string()),
        }
    }
}

/// Always answers with the same value.
pub struct FixedObserver(pub &'static str);

#[async_trait]
impl Observer for FixedObserver {
    async fn observe(&self, _query: &str) -> devstack_validation::Result<String> {
        Ok(self.0.to_string())
    }
}

/// Cancels a token while observing, as a Ctrl-C during validation would.
pub struct CancellingObserver {
    pub token: CancellationToken,
    pub value: &'static str,
}

#[async_trait]
impl Observer for CancellingObserver {
    async fn observe(&self, _query: &str) -> devstack_validation::Result<String> {
        self.token.cancel();
        Ok(self.value.to_string())
    }
}

/// Hands out pre-built observers by service name.
#[derive(Default)]
pub struct StaticObservers(HashMap<String, Arc<dyn Observer>>);

impl StaticObservers {
    pub fn with(mut self, name: &str, observer: impl Observer) -> Self {
        self.0.insert(name.to_string(), Arc::new(observer));
        self
    }

    pub fn data_dir(self, name: &str, marker: &Path) -> Self {
        self.with(
            name,
            DataDirObserver {
                marker: marker.to_path_buf(),
            },
        )
    }
}

impl ObserverFactory for StaticObservers {
    fn build(
        &self,
        service: &str,
        _spec: &ObserverSpec,
    ) -> devstack_validation::Result<Arc<dyn Observer>> {
        self.0
            .get(service)
            .cloned()
            .ok_or_else(|| devstack_validation::Error::InvalidSpec {
                service: service.to_string(),
                reason: "no scripted observer".to_string(),
            })
    }
}

/// A command service with a placeholder probe.
pub fn service(name: &str, depends_on: &[&str]) -> ServiceSpec {
    ServiceSpec::new(
        name,
        StartDirective::Command {
            command: name.to_string(),
            args: vec![],
        },
        ProbeSpec::Tcp {
            address: "127.0.0.1:1".to_string(),
        },
    )
    .depends_on(depends_on.iter().copied())
}

/// A service validated through an observer.
pub fn observed_service(name: &str, persisted_state: &[&str]) -> ServiceSpec {
    let mut spec = service(name, &[]);
    spec.persisted_state = persisted_state.iter().map(PathBuf::from).collect();
    spec.observer = Some(ObserverSpec::Exec {
        program: "psql".to_string(),
        args: vec!["-tAc".to_string(), "SHOW {{ query }}".to_string()],
    });
    spec
}

pub fn host_ip() -> IpAddr {
    "192.168.1.20".parse().unwrap()
}

pub fn options(
    runtime: Arc<FakeRuntime>,
    probes: ScriptedProbes,
    observers: StaticObservers,
    work_dir: &Path,
) -> OrchestratorOptions {
    let mut options = OrchestratorOptions::new(runtime, Arc::new(FixedResolver(host_ip())), work_dir);
    options.probes = Arc::new(probes);
    options.observers = Arc::new(observers);
    options
}

pub fn orchestrator(
    runtime: Arc<FakeRuntime>,
    probes: ScriptedProbes,
    observers: StaticObservers,
    work_dir: &Path,
) -> Orchestrator {
    Orchestrator::new(options(runtime, probes, observers, work_dir))
}
