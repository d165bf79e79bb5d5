//! Human-readable run reports.

use std::path::Path;

use console::style;
use devstack_orchestrator::{InstanceState, Rendering, RunAttempt, RunResult};

pub fn print_rendering(rendering: &Rendering, work_dir: &Path) {
    println!(
        "Rendered {} services into {} (host_ip {})",
        rendering.launches.len(),
        style(work_dir.display()).blue(),
        style(rendering.host_ip).cyan()
    );

    for launch in &rendering.launches {
        println!("  {} {}", style(&launch.name).bold(), launch.directive.target());
    }

    if !rendering.unused.is_empty() {
        println!(
            "{} unused variables: {}",
            style("warning:").yellow(),
            rendering.unused.join(", ")
        );
    }
}

pub fn print_result(result: &RunResult) {
    for attempt in &result.attempts {
        print_attempt(attempt);
    }

    let attempts = result.attempt_count();
    if result.success {
        println!(
            "{} after {} attempt(s)",
            style("Stack is healthy and valid").green().bold(),
            attempts
        );
    } else {
        println!(
            "{} after {} attempt(s)",
            style("Stack failed").red().bold(),
            attempts
        );
    }
}

fn print_attempt(attempt: &RunAttempt) {
    let verdict = if attempt.success {
        style("ok").green()
    } else {
        style("failed").red()
    };
    println!("Attempt {}: {}", attempt.index, verdict);

    for service in &attempt.services {
        let state = match service.state {
            InstanceState::Healthy => style(service.state).green(),
            InstanceState::Failed => style(service.state).red(),
            InstanceState::Pending | InstanceState::Starting => style(service.state).dim(),
        };

        let timing = match (service.time_to_start_ms, service.time_to_ready_ms) {
            (Some(start), Some(ready)) => format!("started at {start}ms, ready in {ready}ms"),
            (Some(start), None) => format!("started at {start}ms"),
            _ => "not started".to_string(),
        };

        println!("  {:<16} {} ({})", service.name, state, timing);
    }

    for outcome in &attempt.outcomes {
        let mark = if outcome.passed {
            style("pass").green()
        } else {
            style("FAIL").red()
        };
        println!("  {} {}", mark, outcome.rule);
    }

    for failure in &attempt.failures {
        println!("  {} {}", style("error:").red(), failure);
    }

    for warning in &attempt.render_warnings {
        println!("  {} variable `{}` is unused", style("warning:").yellow(), warning);
    }
}
