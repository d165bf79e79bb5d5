//! Forwarding of child process output into tracing.

use std::sync::LazyLock;

use devstack_bootable::LogFormat;
use regex::Regex;
use tracing::{debug, error, info, warn};

/// Regex pattern for matching Postgres log lines
static POSTGRES_LOG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}.\d{3} (?:UTC|[+-]\d{2}) \[\d+\] (\w+):  (.*)")
        .expect("Invalid regex pattern")
});

/// Which pipe a line was read from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stream {
    /// Standard output.
    Stdout,

    /// Standard error.
    Stderr,
}

/// Severity assigned to a forwarded line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Classifies a line and returns its severity and message body.
pub fn classify<'a>(format: LogFormat, stream: Stream, line: &'a str) -> (Severity, &'a str) {
    match format {
        LogFormat::Plain => match stream {
            Stream::Stdout => (Severity::Info, line),
            Stream::Stderr => (Severity::Warn, line),
        },
        // Postgres sends all logs to stderr, so both streams are parsed the same way
        LogFormat::Postgres => {
            let Some(caps) = POSTGRES_LOG_REGEX.captures(line) else {
                return (Severity::Info, line);
            };

            let label = caps.get(1).map_or("UNKNOWN", |m| m.as_str());
            let message = caps.get(2).map_or(line, |m| m.as_str());
            let severity = match label {
                "DEBUG1" | "DEBUG2" | "DEBUG3" | "DEBUG4" | "DEBUG5" => Severity::Debug,
                "INFO" | "NOTICE" | "LOG" => Severity::Info,
                "WARNING" => Severity::Warn,
                _ => Severity::Error,
            };

            (severity, message)
        }
    }
}

/// Emits one line of service output.
pub fn forward(service: &str, format: LogFormat, stream: Stream, line: &str) {
    let (severity, message) = classify(format, stream, line);

    match severity {
        Severity::Debug => debug!(target: "devstack::service", service, "{}", message),
        Severity::Info => info!(target: "devstack::service", service, "{}", message),
        Severity::Warn => warn!(target: "devstack::service", service, "{}", message),
        Severity::Error => error!(target: "devstack::service", service, "{}", message),
    }
}
