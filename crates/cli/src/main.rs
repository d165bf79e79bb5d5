//! CLI binary to bring up a local indexing stack.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod error;
mod summary;

use error::Result;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use devstack_orchestrator::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_WORKERS, Orchestrator, OrchestratorOptions, RunOptions,
    Stack,
};
use devstack_process::ProcessRuntime;
use devstack_templater::{
    DEFAULT_EXTERNAL_IP_ENDPOINT, ExternalIpResolver, FallbackResolver, FixedResolver,
    HostResolver, LocalInterfaceResolver,
};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use url::Url;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory containing stack.toml and artifact sources
    #[arg(long, default_value = ".", env = "DEVSTACK_CONFIG_DIR")]
    config_dir: PathBuf,

    /// Directory rendered artifacts and service state are written to
    #[arg(long, default_value = "/tmp/devstack", env = "DEVSTACK_WORK_DIR")]
    work_dir: PathBuf,

    /// Attempts before giving up
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS, env = "DEVSTACK_MAX_ATTEMPTS")]
    max_attempts: u32,

    /// Readiness timeout for services that do not set their own
    #[arg(long, default_value_t = 120, env = "DEVSTACK_SERVICE_TIMEOUT_SECS")]
    service_timeout_secs: u64,

    /// Services started and probed at once
    #[arg(long, default_value_t = DEFAULT_MAX_WORKERS, env = "DEVSTACK_MAX_WORKERS")]
    max_workers: usize,

    /// Time budget for bringing up every service in one attempt
    #[arg(long, env = "DEVSTACK_ATTEMPT_DEADLINE_SECS")]
    attempt_deadline_secs: Option<u64>,

    /// Host address substituted for `host_ip`, skips detection
    #[arg(long, env = "DEVSTACK_HOST_IP")]
    host_ip: Option<IpAddr>,

    /// Host address used when detection fails
    #[arg(long, env = "DEVSTACK_FALLBACK_HOST_IP")]
    fallback_host_ip: Option<IpAddr>,

    /// Detect the public address instead of the local interface address
    #[arg(long, env = "DEVSTACK_EXTERNAL_IP")]
    external_ip: bool,

    /// Endpoint answering with the caller's public address
    #[arg(
        long,
        default_value = DEFAULT_EXTERNAL_IP_ENDPOINT,
        env = "DEVSTACK_EXTERNAL_IP_ENDPOINT"
    )]
    external_ip_endpoint: Url,

    /// Render configuration and exit without starting anything
    #[arg(long, env = "DEVSTACK_RENDER_ONLY")]
    render_only: bool,

    /// Print the run report as JSON
    #[arg(long, env = "DEVSTACK_JSON")]
    json: bool,

    /// Stop the stack and exit once it is healthy and valid
    #[arg(long, env = "DEVSTACK_EXIT_WHEN_READY")]
    exit_when_ready: bool,

    /// Maximum log level
    #[arg(long, default_value_t = Level::INFO, env = "DEVSTACK_LOG_LEVEL")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_tracing(args.log_level) {
        eprintln!("{e}");
        return e.exit_code();
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    }
}

fn init_tracing(level: Level) -> Result<()> {
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(level).finish(),
    )?;

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let shutdown_token = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown_token.clone()));

    info!("loading stack from {}", args.config_dir.display());
    let stack = Stack::load(&args.config_dir).await?;

    let mut options = OrchestratorOptions::new(
        Arc::new(ProcessRuntime::default()),
        resolver(&args)?,
        &args.work_dir,
    );
    options.max_workers = args.max_workers;
    options.attempt_deadline = args.attempt_deadline_secs.map(Duration::from_secs);
    options.shutdown_token = shutdown_token.clone();

    let orchestrator = Orchestrator::new(options);

    if args.render_only {
        let rendering = orchestrator.render(&stack).await?;
        summary::print_rendering(&rendering, orchestrator.work_dir());
        return Ok(());
    }

    let mut result = orchestrator
        .run(
            &stack,
            &RunOptions {
                max_attempts: args.max_attempts,
                service_timeout: Duration::from_secs(args.service_timeout_secs),
            },
        )
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        summary::print_result(&result);
    }

    let running = result.stack.take();
    result.ensure_success()?;

    let Some(running) = running else {
        return Ok(());
    };

    if !args.exit_when_ready {
        info!("stack is running, press Ctrl-C to stop");
        shutdown_token.cancelled().await;
    }

    info!("shutting down");
    running.shutdown().await?;

    Ok(())
}

fn resolver(args: &Args) -> Result<Arc<dyn HostResolver>> {
    if let Some(host_ip) = args.host_ip {
        return Ok(Arc::new(FixedResolver(host_ip)));
    }

    let detected: Arc<dyn HostResolver> = if args.external_ip {
        Arc::new(ExternalIpResolver::new(args.external_ip_endpoint.clone())?)
    } else {
        Arc::new(LocalInterfaceResolver::default())
    };

    Ok(match args.fallback_host_ip {
        Some(fallback) => Arc::new(FallbackResolver::new(detected, Some(fallback))),
        None => detected,
    })
}

async fn wait_for_signal(shutdown_token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
            }
            _ => {
                warn!("failed to install signal handlers, falling back to ctrl-c");
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("received interrupt signal");
    }

    shutdown_token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_structural_errors_exit_with_two() {
        let cycle = Error::from(devstack_orchestrator::Error::DependencyCycle(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]));
        assert_eq!(cycle.exit_code(), ExitCode::from(2));

        let exhausted = Error::from(devstack_orchestrator::Error::RecoveryExhausted {
            attempts: 3,
            failures: vec![],
        });
        assert_eq!(exhausted.exit_code(), ExitCode::from(3));

        let interrupted = Error::from(devstack_orchestrator::Error::Interrupted);
        assert_eq!(interrupted.exit_code(), ExitCode::FAILURE);
    }

    #[test]
    fn test_flags_fall_back_to_defaults() {
        let args = Args::try_parse_from(["devstack", "--config-dir", "demos/indexer-stack"]).unwrap();

        assert_eq!(args.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(args.service_timeout_secs, 120);
        assert_eq!(args.log_level, Level::INFO);
        assert!(args.host_ip.is_none());
        assert!(!args.render_only);
    }

    #[test]
    fn test_host_ip_and_log_level_are_parsed() {
        let args = Args::try_parse_from([
            "devstack",
            "--host-ip",
            "10.0.0.7",
            "--log-level",
            "debug",
            "--max-attempts",
            "5",
        ])
        .unwrap();

        assert_eq!(args.host_ip, Some("10.0.0.7".parse().unwrap()));
        assert_eq!(args.log_level, Level::DEBUG);
        assert_eq!(args.max_attempts, 5);
    }
}
