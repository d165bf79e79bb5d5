//! Attempt scheduling: rendering, wavefront startup, probing and validation.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use devstack_bootable::{Launch, Liveness, ServiceRuntime, StartDirective};
use devstack_probe::{DefaultProbeFactory, PollOutcome, PollPolicy, Probe, ProbeFactory, poll};
use devstack_templater::{
    ArtifactContent, BUILTIN_VARIABLES, HOST_IP_VARIABLE, HostResolver, LoadedArtifact,
    RenderedSet, TemplateSet, Variables, WORK_DIR_VARIABLE, write_artifact,
};
use devstack_validation::{
    DEFAULT_OBSERVE_TIMEOUT, DefaultObserverFactory, Observer, ObserverFactory, evaluate,
};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ServiceSpec, Stack};
use crate::error::{Error, Result};
use crate::instance::{InstanceState, ServiceInstance};
use crate::recovery::{RecoveryController, RecoveryDecision};
use crate::report::{Failure, RunAttempt, RunResult, RunningStack, ServiceReport, millis, stop_in_reverse};
use crate::topology::Topology;

/// Default number of attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default number of services started and probed at once.
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Default readiness timeout for services that do not set one.
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(120);

/// Lower bound for the interval between liveness checks.
const MIN_LIVENESS_INTERVAL: Duration = Duration::from_millis(100);

/// Parameters of one run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunOptions {
    /// Attempts allowed before giving up.
    pub max_attempts: u32,

    /// Readiness timeout for services that do not set their own.
    pub service_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            service_timeout: DEFAULT_SERVICE_TIMEOUT,
        }
    }
}

/// Collaborators and limits of an `Orchestrator`.
pub struct OrchestratorOptions {
    /// Start/stop/inspect primitive.
    pub runtime: Arc<dyn ServiceRuntime>,

    /// Source of the `host_ip` variable.
    pub resolver: Arc<dyn HostResolver>,

    /// Builds readiness probes.
    pub probes: Arc<dyn ProbeFactory>,

    /// Builds validation observers.
    pub observers: Arc<dyn ObserverFactory>,

    /// Root of rendered artifacts and relative persisted state.
    pub work_dir: PathBuf,

    /// Services started and probed at once.
    pub max_workers: usize,

    /// Time budget for starting every service of one attempt.
    pub attempt_deadline: Option<Duration>,

    /// Time budget for one validation observation.
    pub observe_timeout: Duration,

    /// Cancelling this token interrupts the run.
    pub shutdown_token: CancellationToken,
}

impl OrchestratorOptions {
    /// Creates options with the built-in probes and observers.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ServiceRuntime>,
        resolver: Arc<dyn HostResolver>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            resolver,
            probes: Arc::new(DefaultProbeFactory),
            observers: Arc::new(DefaultObserverFactory),
            work_dir: work_dir.into(),
            max_workers: DEFAULT_MAX_WORKERS,
            attempt_deadline: None,
            observe_timeout: DEFAULT_OBSERVE_TIMEOUT,
            shutdown_token: CancellationToken::new(),
        }
    }
}

/// Configuration rendered for one attempt.
#[derive(Clone, Debug)]
pub struct Rendering {
    /// Resolved host address.
    pub host_ip: IpAddr,

    /// Rendered start requests in start order.
    pub launches: Vec<Launch>,

    /// Variables no template referenced.
    pub unused: Vec<String>,
}

/// Everything about a stack that does not change between attempts.
struct Plan {
    topology: Topology,
    templates: TemplateSet,
    template_outputs: Vec<(String, String, PathBuf)>,
    verbatim_outputs: Vec<(String, PathBuf, Vec<u8>)>,
    probes: HashMap<String, Arc<dyn Probe>>,
    observers: HashMap<String, Arc<dyn Observer>>,
}

/// One service's start request, probe and timing.
struct Job {
    launch: Launch,
    probe: Arc<dyn Probe>,
    policy: PollPolicy,
}

/// Shared by every service task of one attempt.
#[derive(Clone)]
struct AttemptContext {
    runtime: Arc<dyn ServiceRuntime>,
    semaphore: Arc<Semaphore>,
    started: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
}

struct ServiceRun {
    name: String,
    started_at: Option<Instant>,
    polls: u32,
    outcome: ServiceOutcome,
}

enum ServiceOutcome {
    Healthy,
    Failed(Failure),
    Cancelled,
}

/// Brings a stack up, validates it and recovers from failed attempts.
pub struct Orchestrator {
    runtime: Arc<dyn ServiceRuntime>,
    resolver: Arc<dyn HostResolver>,
    probes: Arc<dyn ProbeFactory>,
    observers: Arc<dyn ObserverFactory>,
    work_dir: PathBuf,
    max_workers: usize,
    attempt_deadline: Option<Duration>,
    observe_timeout: Duration,
    shutdown_token: CancellationToken,
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(options: OrchestratorOptions) -> Self {
        Self {
            runtime: options.runtime,
            resolver: options.resolver,
            probes: options.probes,
            observers: options.observers,
            work_dir: options.work_dir,
            max_workers: options.max_workers,
            attempt_deadline: options.attempt_deadline,
            observe_timeout: options.observe_timeout,
            shutdown_token: options.shutdown_token,
        }
    }

    /// Returns the work directory.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Runs attempts until the stack is healthy and valid, or no attempts remain.
    ///
    /// A failed run is `Ok` with `success == false`; use
    /// [`RunResult::ensure_success`] to turn it into `Error::RecoveryExhausted`.
    /// A run also ends early, without destroying state, when a service of a
    /// failed attempt cannot be stopped. The last attempt then carries
    /// `Failure::StopFailed`.
    ///
    /// An interrupt stops the started services and returns
    /// `Error::Interrupted` without destroying state.
    ///
    /// # Errors
    ///
    /// Returns structural errors before any service starts, configuration
    /// rendering errors, IO errors and `Error::Interrupted`.
    pub async fn run(&self, stack: &Stack, options: &RunOptions) -> Result<RunResult> {
        let mut recovery = RecoveryController::new(options.max_attempts, &self.work_dir)?;
        let plan = self.plan(stack).await?;
        let mut attempts = Vec::new();

        info!(
            "starting {} services in order: {}",
            plan.topology.order().len(),
            plan.topology.order().join(", ")
        );

        loop {
            let index = recovery.begin_attempt();
            info!(attempt = index, "attempt {} of {}", index, options.max_attempts);

            let rendering = self.render_with(stack, &plan).await?;
            let mut attempt = self.start_all(index, stack, &plan, rendering.launches, options).await;
            attempt.render_warnings = rendering.unused;

            if self.shutdown_token.is_cancelled() {
                return self.interrupt(&attempt).await;
            }

            if attempt.failures.is_empty() {
                attempt.outcomes =
                    evaluate(&stack.rules, &plan.observers, self.observe_timeout).await;
                attempt.failures.extend(
                    attempt
                        .outcomes
                        .iter()
                        .filter(|outcome| !outcome.passed)
                        .map(Failure::from_outcome),
                );
            }

            if self.shutdown_token.is_cancelled() {
                return self.interrupt(&attempt).await;
            }

            if attempt.failures.is_empty() {
                attempt.success = true;
                info!(attempt = index, "stack is healthy and valid");

                let running = RunningStack::new(self.runtime.clone(), attempt.start_order.clone());
                attempts.push(attempt);

                return Ok(RunResult {
                    success: true,
                    attempts,
                    stack: Some(running),
                });
            }

            for failure in &attempt.failures {
                warn!(attempt = index, "{}", failure);
            }

            let stop_failures = stop_in_reverse(self.runtime.as_ref(), &attempt.start_order).await;
            if !stop_failures.is_empty() {
                error!(
                    attempt = index,
                    "services could not be stopped, keeping persisted state"
                );
                attempt.failures.extend(stop_failures);
                attempts.push(attempt);

                return Ok(RunResult {
                    success: false,
                    attempts,
                    stack: None,
                });
            }

            let decision = recovery.recover(&attempt, stack).await?;
            attempts.push(attempt);

            if decision == RecoveryDecision::Exhausted {
                error!("recovery exhausted after {} attempt(s)", index);

                return Ok(RunResult {
                    success: false,
                    attempts,
                    stack: None,
                });
            }
        }
    }

    /// Stops what an interrupted attempt started. Persisted state is kept.
    async fn interrupt(&self, attempt: &RunAttempt) -> Result<RunResult> {
        warn!(attempt = attempt.index, "interrupted, stopping started services");

        for failure in stop_in_reverse(self.runtime.as_ref(), &attempt.start_order).await {
            error!(attempt = attempt.index, "{}", failure);
        }

        Err(Error::Interrupted)
    }

    /// Validates the stack and renders its configuration without starting
    /// anything.
    ///
    /// # Errors
    ///
    /// Returns structural errors and configuration rendering errors.
    pub async fn render(&self, stack: &Stack) -> Result<Rendering> {
        let plan = self.plan(stack).await?;
        self.render_with(stack, &plan).await
    }

    async fn plan(&self, stack: &Stack) -> Result<Plan> {
        let topology = Topology::build(&stack.services)?;

        if self.max_workers == 0 {
            return Err(Error::InvalidOptions("max_workers must be at least 1".to_string()));
        }

        for rule in &stack.rules {
            if stack.service(&rule.target).is_none() {
                return Err(Error::UnknownRuleTarget {
                    rule: rule.label(),
                    target: rule.target.clone(),
                });
            }
        }

        let mut templates = TemplateSet::new();
        let mut template_outputs = Vec::new();
        let mut verbatim_outputs = Vec::new();
        let mut probes = HashMap::new();
        let mut observers = HashMap::new();

        for service in &stack.services {
            service.validate()?;
        }

        for service in &stack.services {
            let name = service.name.as_str();

            add_directive(&mut templates, name, &service.start);
            for (key, value) in &service.env {
                templates.add_text(template_key(name, "env", key), value.clone());
            }

            for artifact in &service.artifacts {
                let key = template_key(name, "artifact", artifact.output.display());
                let loaded = LoadedArtifact::load(&stack.config_dir, &key, artifact).await?;

                match loaded.content {
                    ArtifactContent::Template(template) => {
                        templates.add(template);
                        template_outputs.push((name.to_string(), key, artifact.output.clone()));
                    }
                    ArtifactContent::Verbatim(bytes) => {
                        verbatim_outputs.push((name.to_string(), artifact.output.clone(), bytes));
                    }
                }
            }

            probes.insert(name.to_string(), self.probes.build(name, &service.probe)?);

            if let Some(observer) = &service.observer {
                observers.insert(name.to_string(), self.observers.build(name, observer)?);
            }
        }

        Ok(Plan {
            topology,
            templates,
            template_outputs,
            verbatim_outputs,
            probes,
            observers,
        })
    }

    async fn render_with(&self, stack: &Stack, plan: &Plan) -> Result<Rendering> {
        let host_ip = self.resolver.resolve().await?;

        let mut variables: Variables = stack
            .variables
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        for builtin in BUILTIN_VARIABLES {
            if stack.variables.contains_key(*builtin) {
                warn!("variable `{}` is provided by devstack, ignoring the stack value", builtin);
            }
        }

        variables.insert(HOST_IP_VARIABLE, host_ip.to_string());
        variables.insert(WORK_DIR_VARIABLE, self.work_dir.display().to_string());

        let rendered = plan.templates.render_all(&variables, BUILTIN_VARIABLES)?;

        for service in &stack.services {
            tokio::fs::create_dir_all(self.service_dir(&service.name))
                .await
                .map_err(|e| Error::Io("failed to create service directory", e))?;
        }

        for (service, key, output) in &plan.template_outputs {
            let bytes = rendered.bytes(key).unwrap_or_default();
            write_artifact(&self.service_dir(service), output, bytes).await?;
        }

        for (service, output, bytes) in &plan.verbatim_outputs {
            write_artifact(&self.service_dir(service), output, bytes).await?;
        }

        let launches = plan
            .topology
            .order()
            .iter()
            .filter_map(|name| stack.service(name))
            .map(|service| self.launch(service, &rendered))
            .collect();

        debug!("rendered configuration with host_ip {}", host_ip);

        Ok(Rendering {
            host_ip,
            launches,
            unused: rendered.unused,
        })
    }

    fn launch(&self, service: &ServiceSpec, rendered: &RenderedSet) -> Launch {
        let name = service.name.as_str();

        Launch {
            name: name.to_string(),
            directive: render_directive(name, &service.start, rendered),
            env: service
                .env
                .keys()
                .map(|key| (key.clone(), rendered_text(rendered, &template_key(name, "env", key))))
                .collect(),
            working_dir: self.service_dir(name),
            log_format: service.log_format,
        }
    }

    fn service_dir(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    async fn start_all(
        &self,
        index: u32,
        stack: &Stack,
        plan: &Plan,
        launches: Vec<Launch>,
        options: &RunOptions,
    ) -> RunAttempt {
        let ctx = AttemptContext {
            runtime: self.runtime.clone(),
            semaphore: Arc::new(Semaphore::new(self.max_workers)),
            started: Arc::new(Mutex::new(Vec::new())),
            cancel: self.shutdown_token.child_token(),
        };

        let jobs: HashMap<String, Job> = launches
            .into_iter()
            .filter_map(|launch| {
                let service = stack.service(&launch.name)?;
                let probe = plan.probes.get(&launch.name)?.clone();
                let policy = service.poll_policy(options.service_timeout);
                Some((
                    launch.name.clone(),
                    Job {
                        launch,
                        probe,
                        policy,
                    },
                ))
            })
            .collect();

        let mut instances: BTreeMap<String, ServiceInstance> = plan
            .topology
            .order()
            .iter()
            .map(|name| (name.clone(), ServiceInstance::new(name.clone())))
            .collect();

        let mut waiting: HashMap<String, usize> = plan
            .topology
            .order()
            .iter()
            .map(|name| (name.clone(), plan.topology.dependencies(name).len()))
            .collect();

        let mut tasks = JoinSet::new();
        let mut failures = Vec::new();
        let mut cancelled = Vec::new();
        // A deadline too far out to represent is no deadline
        let mut deadline = self
            .attempt_deadline
            .and_then(|limit| Some((Instant::now().checked_add(limit)?, limit)));

        for name in plan.topology.order() {
            if waiting.get(name) == Some(&0) {
                spawn_job(&mut tasks, &ctx, &mut instances, jobs.get(name));
            }
        }

        loop {
            let joined = tokio::select! {
                () = sleep_until(deadline.map(|(at, _)| at)) => {
                    if let Some((_, limit)) = deadline.take() {
                        let pending: Vec<String> = instances
                            .values()
                            .filter(|instance| instance.state() == InstanceState::Starting)
                            .map(|instance| instance.name().to_string())
                            .collect();

                        warn!(attempt = index, "attempt deadline of {:?} passed", limit);
                        failures.push(Failure::AttemptDeadline {
                            deadline_ms: millis(limit),
                            pending,
                        });
                        ctx.cancel.cancel();
                    }
                    continue;
                }
                joined = tasks.join_next() => joined,
            };

            let Some(joined) = joined else {
                break;
            };

            let run = match joined {
                Ok(run) => run,
                Err(e) => {
                    error!(attempt = index, "service task failed: {}", e);
                    failures.push(Failure::TaskAborted {
                        reason: e.to_string(),
                    });
                    ctx.cancel.cancel();
                    continue;
                }
            };

            let Some(instance) = instances.get_mut(&run.name) else {
                continue;
            };

            if let Some(at) = run.started_at {
                instance.record_start(at);
            }
            instance.record_polls(run.polls);

            let healthy = match run.outcome {
                ServiceOutcome::Healthy => {
                    settle(instance, InstanceState::Healthy);
                    true
                }
                ServiceOutcome::Failed(failure) => {
                    instance.record_detail(failure.to_string());
                    settle(instance, InstanceState::Failed);
                    failures.push(failure);
                    ctx.cancel.cancel();
                    false
                }
                ServiceOutcome::Cancelled => {
                    instance.record_detail("cancelled");
                    settle(instance, InstanceState::Failed);
                    cancelled.push(run.name.clone());
                    false
                }
            };

            if !healthy || ctx.cancel.is_cancelled() {
                continue;
            }

            for dependent in plan.topology.dependents(&run.name) {
                let Some(count) = waiting.get_mut(dependent) else {
                    continue;
                };

                *count -= 1;
                if *count == 0 {
                    spawn_job(&mut tasks, &ctx, &mut instances, jobs.get(dependent));
                }
            }
        }

        let start_order = ctx.started.lock().await.clone();
        let services = plan
            .topology
            .order()
            .iter()
            .filter_map(|name| instances.get(name))
            .map(ServiceReport::from)
            .collect();

        RunAttempt {
            index,
            start_order,
            services,
            failures,
            cancelled,
            outcomes: Vec::new(),
            render_warnings: Vec::new(),
            success: false,
        }
    }
}

fn spawn_job(
    tasks: &mut JoinSet<ServiceRun>,
    ctx: &AttemptContext,
    instances: &mut BTreeMap<String, ServiceInstance>,
    job: Option<&Job>,
) {
    let Some(job) = job else {
        return;
    };

    if let Some(instance) = instances.get_mut(&job.launch.name) {
        if let Err(e) = instance.transition(InstanceState::Starting) {
            error!("{}", e);
            return;
        }
    }

    tasks.spawn(start_and_probe(
        ctx.clone(),
        job.launch.clone(),
        job.probe.clone(),
        job.policy,
    ));
}

fn settle(instance: &mut ServiceInstance, state: InstanceState) {
    if let Err(e) = instance.transition(state) {
        error!("{}", e);
    }
}

async fn start_and_probe(
    ctx: AttemptContext,
    launch: Launch,
    probe: Arc<dyn Probe>,
    policy: PollPolicy,
) -> ServiceRun {
    let name = launch.name.clone();
    let cancelled = |name: String, started_at| ServiceRun {
        name,
        started_at,
        polls: 0,
        outcome: ServiceOutcome::Cancelled,
    };

    let permit = tokio::select! {
        () = ctx.cancel.cancelled() => None,
        permit = ctx.semaphore.clone().acquire_owned() => permit.ok(),
    };

    let Some(_permit) = permit else {
        return cancelled(name, None);
    };

    if ctx.cancel.is_cancelled() {
        return cancelled(name, None);
    }

    let started_at = Instant::now();
    info!(service = %name, "starting {}", launch.directive.target());

    if let Err(e) = ctx.runtime.start(&launch).await {
        return ServiceRun {
            name: name.clone(),
            started_at: Some(started_at),
            polls: 0,
            outcome: ServiceOutcome::Failed(Failure::StartFailed {
                service: name,
                reason: e.to_string(),
            }),
        };
    }

    ctx.started.lock().await.push(name.clone());

    let probe_cancel = ctx.cancel.child_token();
    let outcome = tokio::select! {
        outcome = poll(probe.as_ref(), &policy, &probe_cancel) => outcome,
        code = watch_exit(ctx.runtime.as_ref(), &name, policy.interval) => {
            probe_cancel.cancel();
            warn!(service = %name, "exited while starting");

            return ServiceRun {
                name: name.clone(),
                started_at: Some(started_at),
                polls: 0,
                outcome: ServiceOutcome::Failed(Failure::ServiceExited {
                    service: name.clone(),
                    code,
                }),
            };
        }
    };

    let polls = outcome.polls();
    let outcome = match outcome {
        PollOutcome::Healthy { elapsed, polls } => {
            info!(service = %name, "healthy after {:?} ({} checks)", elapsed, polls);
            ServiceOutcome::Healthy
        }
        PollOutcome::TimedOut {
            elapsed,
            polls,
            last_error,
        } => {
            warn!(service = %name, "not healthy after {:?}", elapsed);
            ServiceOutcome::Failed(Failure::StartupTimeout {
                service: name.clone(),
                elapsed_ms: millis(elapsed),
                polls,
                last_error,
            })
        }
        PollOutcome::Cancelled { .. } => {
            debug!(service = %name, "probing cancelled");
            ServiceOutcome::Cancelled
        }
    };

    ServiceRun {
        name,
        started_at: Some(started_at),
        polls,
        outcome,
    }
}

/// Resolves once the runtime reports the service as exited.
async fn watch_exit(runtime: &dyn ServiceRuntime, name: &str, interval: Duration) -> Option<i32> {
    let interval = interval.max(MIN_LIVENESS_INTERVAL);

    loop {
        tokio::time::sleep(interval).await;

        if let Liveness::Exited(code) = runtime.inspect(name).await {
            return code;
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn template_key(service: &str, kind: &str, item: impl Display) -> String {
    format!("{service}/{kind}/{item}")
}

fn rendered_text(rendered: &RenderedSet, key: &str) -> String {
    rendered.text(key).unwrap_or_default().to_string()
}

fn add_list(templates: &mut TemplateSet, service: &str, field: &str, items: &[String]) {
    for (index, item) in items.iter().enumerate() {
        templates.add_text(template_key(service, field, index), item.clone());
    }
}

fn render_list(rendered: &RenderedSet, service: &str, field: &str, items: &[String]) -> Vec<String> {
    (0..items.len())
        .map(|index| rendered_text(rendered, &template_key(service, field, index)))
        .collect()
}

fn add_directive(templates: &mut TemplateSet, service: &str, directive: &StartDirective) {
    templates.add_text(template_key(service, "start", "target"), directive.target());

    match directive {
        StartDirective::Image {
            args,
            ports,
            volumes,
            ..
        } => {
            add_list(templates, service, "args", args);
            add_list(templates, service, "ports", ports);
            add_list(templates, service, "volumes", volumes);
        }
        StartDirective::Command { args, .. } => add_list(templates, service, "args", args),
    }
}

fn render_directive(service: &str, directive: &StartDirective, rendered: &RenderedSet) -> StartDirective {
    let target = rendered_text(rendered, &template_key(service, "start", "target"));

    match directive {
        StartDirective::Image {
            args,
            ports,
            volumes,
            ..
        } => StartDirective::Image {
            image: target,
            args: render_list(rendered, service, "args", args),
            ports: render_list(rendered, service, "ports", ports),
            volumes: render_list(rendered, service, "volumes", volumes),
        },
        StartDirective::Command { args, .. } => StartDirective::Command {
            command: target,
            args: render_list(rendered, service, "args", args),
        },
    }
}
