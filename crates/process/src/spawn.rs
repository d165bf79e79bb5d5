//! Process spawning and supervision for stack services.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devstack_bootable::{BoxError, Launch, Liveness, LogFormat, ServiceRuntime, StartDirective};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::logs::{self, Stream};

/// Default time a service gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Program and arguments that realize a start directive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandLine {
    /// Program to execute.
    pub program: String,

    /// Arguments to pass.
    pub args: Vec<String>,

    /// Whether the environment is passed through the program's own flags.
    pub env_in_args: bool,
}

/// Options for configuring a `ProcessRuntime`.
#[derive(Clone, Debug)]
pub struct ProcessRuntimeOptions {
    /// Prefix for container names of image services.
    pub container_prefix: String,

    /// Container engine executable used for image services.
    pub container_engine: String,

    /// Grace period between SIGTERM and kill.
    pub stop_timeout: Duration,
}

impl Default for ProcessRuntimeOptions {
    fn default() -> Self {
        Self {
            container_prefix: "devstack-".to_string(),
            container_engine: "docker".to_string(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// A supervised child process and the process group it leads.
struct ManagedProcess {
    group: Pid,
    container: Option<String>,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
    stop_rx: oneshot::Receiver<Result<()>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// Runs stack services as local child processes.
///
/// `Command` directives are executed directly. `Image` directives are executed
/// through the container engine in the foreground, so the same supervision
/// applies to both. Every service leads its own process group, and stopping
/// a service signals the whole group.
#[derive(Clone)]
pub struct ProcessRuntime {
    options: ProcessRuntimeOptions,
    processes: Arc<Mutex<HashMap<String, ManagedProcess>>>,
}

impl ProcessRuntime {
    /// Creates a new `ProcessRuntime`.
    #[must_use]
    pub fn new(options: ProcessRuntimeOptions) -> Self {
        Self {
            options,
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the container name used for an image service.
    #[must_use]
    pub fn container_name(&self, service: &str) -> String {
        format!("{}{}", self.options.container_prefix, service)
    }

    /// Builds the command line for a launch request.
    #[must_use]
    pub fn command_line(&self, launch: &Launch) -> CommandLine {
        match &launch.directive {
            StartDirective::Command { command, args } => CommandLine {
                program: command.clone(),
                args: args.clone(),
                env_in_args: false,
            },
            StartDirective::Image {
                image,
                args,
                ports,
                volumes,
            } => {
                let mut cmd_args = vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "--name".to_string(),
                    self.container_name(&launch.name),
                ];

                for port in ports {
                    cmd_args.push("-p".to_string());
                    cmd_args.push(port.clone());
                }

                for volume in volumes {
                    cmd_args.push("-v".to_string());
                    cmd_args.push(volume.clone());
                }

                for (key, value) in &launch.env {
                    cmd_args.push("-e".to_string());
                    cmd_args.push(format!("{key}={value}"));
                }

                cmd_args.push(image.clone());
                cmd_args.extend(args.iter().cloned());

                CommandLine {
                    program: self.options.container_engine.clone(),
                    args: cmd_args,
                    env_in_args: true,
                }
            }
        }
    }

    /// Spawns the process for a launch request and starts supervising it.
    async fn spawn(&self, launch: &Launch) -> Result<ManagedProcess> {
        tokio::fs::create_dir_all(&launch.working_dir)
            .await
            .map_err(|e| Error::Io("failed to create working directory", e))?;

        let command_line = self.command_line(launch);

        let mut cmd = Command::new(&command_line.program);
        cmd.args(&command_line.args);
        cmd.current_dir(&launch.working_dir);
        cmd.process_group(0);

        if !command_line.env_in_args {
            for (key, value) in &launch.env {
                cmd.env(key, value);
            }
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!("Spawning process: {:?}", cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Io("failed to spawn process", e))?;

        let pid = child.id().ok_or_else(|| {
            Error::SpawnProcess("no PID available for spawned process".to_string())
        })?;

        debug!("{} spawned with PID: {}", launch.name, pid);

        #[allow(clippy::cast_possible_wrap)]
        let group = Pid::from_raw(pid as i32);

        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = oneshot::channel();

        if let Some(stdout) = child.stdout.take() {
            let name = launch.name.clone();
            let format = launch.log_format;
            task_tracker.spawn(async move {
                forward_lines(stdout, &name, format, Stream::Stdout).await;
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let name = launch.name.clone();
            let format = launch.log_format;
            task_tracker.spawn(async move {
                forward_lines(stderr, &name, format, Stream::Stderr).await;
            });
        }

        let name = launch.name.clone();
        let token = shutdown_token.clone();
        let stop_timeout = self.options.stop_timeout;
        task_tracker.spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let code = match status {
                        Ok(status) => {
                            log_exit(&name, status);
                            status.code()
                        }
                        Err(err) => {
                            error!("failed to wait for {}: {}", name, err);
                            None
                        }
                    };
                    let _ = exit_tx.send(Some(code));
                }
                () = token.cancelled() => {
                    info!("stopping {}...", name);
                    let (code, stopped) = terminate(&name, group, &mut child, stop_timeout).await;
                    let _ = exit_tx.send(Some(code));
                    let _ = stop_tx.send(stopped);
                }
            }
        });

        task_tracker.close();

        let container = matches!(launch.directive, StartDirective::Image { .. })
            .then(|| self.container_name(&launch.name));

        Ok(ManagedProcess {
            group,
            container,
            exit_rx,
            stop_rx,
            shutdown_token,
            task_tracker,
        })
    }

    /// Stops a supervised process and everything left in its group.
    async fn halt(&self, name: &str, process: ManagedProcess) -> Result<()> {
        process.shutdown_token.cancel();

        // The sender is dropped without a report when the process exited on its own
        let stopped = match process.stop_rx.await {
            Ok(stopped) => stopped,
            Err(_) => clear_group(name, process.group, self.options.stop_timeout).await,
        };

        // Grandchildren may keep the output pipes open after the child exits
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, process.task_tracker.wait())
            .await
            .is_err()
        {
            debug!("output of {} still open after exit", name);
        }

        let removed = match &process.container {
            Some(container) => self.remove_container(container).await,
            None => Ok(()),
        };

        stopped.and(removed)
    }

    /// Force-removes the container of an image service.
    async fn remove_container(&self, container: &str) -> Result<()> {
        let output = tokio::time::timeout(
            self.options.stop_timeout,
            Command::new(&self.options.container_engine)
                .args(["rm", "-f", container])
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::RemoveContainer(container.to_string(), "timed out".to_string()))?
        .map_err(|e| Error::Io("failed to run container engine", e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("No such container") {
            debug!("container {} removed", container);
            return Ok(());
        }

        Err(Error::RemoveContainer(
            container.to_string(),
            stderr.trim().to_string(),
        ))
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new(ProcessRuntimeOptions::default())
    }
}

#[async_trait]
impl ServiceRuntime for ProcessRuntime {
    async fn start(&self, launch: &Launch) -> std::result::Result<(), BoxError> {
        let mut processes = self.processes.lock().await;

        if let Some(existing) = processes.get(&launch.name) {
            if existing.exit_rx.borrow().is_none() {
                return Err(Box::new(Error::AlreadyRunning(launch.name.clone())));
            }
        }

        info!(
            "starting {} ({})",
            launch.name,
            launch.directive.target()
        );

        let process = self.spawn(launch).await?;
        processes.insert(launch.name.clone(), process);

        Ok(())
    }

    async fn stop(&self, name: &str) -> std::result::Result<(), BoxError> {
        let taken = self.processes.lock().await.remove(name);

        let Some(process) = taken else {
            debug!("no running process for {} to stop", name);
            return Ok(());
        };

        self.halt(name, process).await?;
        info!("{} stopped", name);

        Ok(())
    }

    async fn inspect(&self, name: &str) -> Liveness {
        let processes = self.processes.lock().await;

        processes
            .get(name)
            .map_or(Liveness::Unknown, |process| match *process.exit_rx.borrow() {
                None => Liveness::Running,
                Some(code) => Liveness::Exited(code),
            })
    }
}

/// Sends SIGTERM to the group, kills the child after `grace`, then clears
/// whatever is left of the group.
async fn terminate(
    name: &str,
    group: Pid,
    child: &mut Child,
    grace: Duration,
) -> (Option<i32>, Result<()>) {
    let started = Instant::now();

    if let Err(err) = signal_group(group, Signal::SIGTERM) {
        error!("failed to send SIGTERM to {}: {}", name, err);
    }

    let code = if let Ok(result) = tokio::time::timeout(grace, child.wait()).await {
        match result {
            Ok(status) => {
                log_exit(name, status);
                status.code()
            }
            Err(err) => {
                error!("failed to wait for {}: {}", name, err);
                None
            }
        }
    } else {
        error!("timeout waiting for {} to exit, killing...", name);
        if let Err(err) = child.kill().await {
            error!("failed to kill {}: {}", name, err);
            return (None, Err(Error::Io("failed to kill process", err)));
        }
        None
    };

    let cleared = clear_group(name, group, grace.saturating_sub(started.elapsed())).await;

    (code, cleared)
}

/// Waits up to `grace` for the group to empty, then kills what remains.
async fn clear_group(name: &str, group: Pid, grace: Duration) -> Result<()> {
    let emptied = tokio::time::timeout(grace, async {
        while group_alive(group) {
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }
    })
    .await;

    if emptied.is_ok() {
        return Ok(());
    }

    warn!("processes of {} outlived it, killing the group", name);
    signal_group(group, Signal::SIGKILL).map(|_| ())
}

/// Signals every process in a group. Returns false if the group is empty.
fn signal_group(group: Pid, signal: Signal) -> Result<bool> {
    match killpg(group, signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(Error::Signal(group.as_raw(), err)),
    }
}

fn group_alive(group: Pid) -> bool {
    !matches!(killpg(group, None), Err(Errno::ESRCH))
}

async fn forward_lines<R>(reader: R, name: &str, format: LogFormat, stream: Stream)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        logs::forward(name, format, stream, &line);
    }
}

fn log_exit(name: &str, status: ExitStatus) {
    if status.success() {
        info!("{} exited with status: {}", name, status);
    } else {
        warn!("{} exited with non-zero status: {}", name, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn launch(directive: StartDirective) -> Launch {
        let mut env = BTreeMap::new();
        env.insert("POSTGRES_INITDB_ARGS".to_string(), "-E UTF8".to_string());

        Launch {
            name: "store".to_string(),
            directive,
            env,
            working_dir: PathBuf::from("/tmp/devstack/store"),
            log_format: LogFormat::Postgres,
        }
    }

    #[test]
    fn test_image_command_line() {
        let runtime = ProcessRuntime::default();
        let line = runtime.command_line(&launch(StartDirective::Image {
            image: "postgres:16".to_string(),
            args: vec!["-c".to_string(), "max_connections=200".to_string()],
            ports: vec!["5432:5432".to_string()],
            volumes: vec!["/tmp/devstack/data/postgres:/var/lib/postgresql/data".to_string()],
        }));

        assert_eq!(line.program, "docker");
        assert!(line.env_in_args);
        assert_eq!(
            line.args,
            vec![
                "run",
                "--rm",
                "--name",
                "devstack-store",
                "-p",
                "5432:5432",
                "-v",
                "/tmp/devstack/data/postgres:/var/lib/postgresql/data",
                "-e",
                "POSTGRES_INITDB_ARGS=-E UTF8",
                "postgres:16",
                "-c",
                "max_connections=200",
            ]
        );
    }

    #[test]
    fn test_command_line_passes_through() {
        let runtime = ProcessRuntime::default();
        let line = runtime.command_line(&launch(StartDirective::Command {
            command: "ipfs".to_string(),
            args: vec!["daemon".to_string()],
        }));

        assert_eq!(line.program, "ipfs");
        assert_eq!(line.args, vec!["daemon"]);
        assert!(!line.env_in_args);
    }
}
