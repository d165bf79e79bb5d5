//! Observers read attribute values from running services.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use devstack_templater::{ConfigTemplate, Variables};
use reqwest::Client;
use serde_json::Value;
use tokio::process::Command;
use tracing::trace;
use url::Url;

use crate::error::{Error, Result};

/// Variable an exec observer's arguments use to receive the query.
pub const QUERY_VARIABLE: &str = "query";

const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads attribute values from a service.
#[async_trait]
pub trait Observer
where
    Self: Send + Sync + 'static,
{
    /// Returns the current value selected by `query`.
    async fn observe(&self, query: &str) -> Result<String>;
}

/// Runs a command and returns its trimmed stdout.
///
/// Arguments may contain a `{{ query }}` placeholder, e.g.
/// `psql -tAc "SHOW {{ query }}"`.
#[derive(Clone, Debug)]
pub struct ExecObserver {
    program: String,
    args: Vec<ConfigTemplate>,
}

impl ExecObserver {
    /// Creates a command observer.
    #[must_use]
    pub fn new(program: impl Into<String>, args: &[String]) -> Self {
        let program = program.into();
        let args = args
            .iter()
            .enumerate()
            .map(|(index, arg)| ConfigTemplate::new(format!("{program} arg {index}"), arg.clone()))
            .collect();

        Self { program, args }
    }
}

#[async_trait]
impl Observer for ExecObserver {
    async fn observe(&self, query: &str) -> Result<String> {
        let variables = Variables::new().with(QUERY_VARIABLE, query);

        let mut args = Vec::with_capacity(self.args.len());
        for template in &self.args {
            let rendered = template.render(&variables)?;
            args.push(String::from_utf8_lossy(&rendered.bytes).into_owned());
        }

        trace!("observing with {} {:?}", self.program, args);

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Io("failed to run observer command", e))?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Fetches a JSON document and selects a value with a JSON pointer
/// (`/a/0/b`) or a dotted path (`a.0.b`).
#[derive(Clone, Debug)]
pub struct HttpJsonObserver {
    client: Client,
    url: Url,
}

impl HttpJsonObserver {
    /// Creates a JSON observer.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: Url) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_REQUEST_TIMEOUT).build()?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl Observer for HttpJsonObserver {
    async fn observe(&self, query: &str) -> Result<String> {
        let body = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let document: Value = serde_json::from_str(&body).map_err(Error::Json)?;

        select_json(&document, query)
            .map(json_to_string)
            .ok_or_else(|| Error::NotFound(query.to_string()))
    }
}

/// Selects a value by JSON pointer or dotted path.
#[must_use]
pub fn select_json<'a>(document: &'a Value, query: &str) -> Option<&'a Value> {
    if query.is_empty() {
        return Some(document);
    }

    if query.starts_with('/') {
        return document.pointer(query);
    }

    query
        .split('.')
        .try_fold(document, |value, segment| match value {
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            Value::Object(map) => map.get(segment),
            _ => None,
        })
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fetches a Prometheus text exposition.
///
/// A bare metric name sums every series of that metric. A query with labels,
/// e.g. `deployment_head{deployment="Qm.."}`, matches one series exactly.
#[derive(Clone, Debug)]
pub struct MetricsObserver {
    client: Client,
    url: Url,
}

impl MetricsObserver {
    /// Creates a metrics observer.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: Url) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_REQUEST_TIMEOUT).build()?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl Observer for MetricsObserver {
    async fn observe(&self, query: &str) -> Result<String> {
        let body = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        select_metric(&body, query).map(format_number)
    }
}

/// Evaluates a metric query against a Prometheus text exposition.
///
/// # Errors
///
/// Returns an error if a relevant line is malformed or nothing matches.
pub fn select_metric(exposition: &str, query: &str) -> Result<f64> {
    let query = query.trim();
    let exact = query.contains('{');
    let mut total = None;

    for line in exposition.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (series, rest) = split_series(line)?;
        let name = series.split('{').next().unwrap_or(series);

        let matched = if exact {
            series == query
        } else {
            name == query
        };
        if !matched {
            continue;
        }

        let value = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| Error::MalformedMetric(line.to_string()))?;

        total = Some(total.unwrap_or(0.0) + value);
    }

    total.ok_or_else(|| Error::NotFound(query.to_string()))
}

fn split_series(line: &str) -> Result<(&str, &str)> {
    if let Some(open) = line.find('{') {
        let close = line[open..]
            .find('}')
            .map(|offset| open + offset)
            .ok_or_else(|| Error::MalformedMetric(line.to_string()))?;

        Ok((&line[..=close], &line[close + 1..]))
    } else {
        line.split_once(char::is_whitespace)
            .ok_or_else(|| Error::MalformedMetric(line.to_string()))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use serde_json::json;

    use super::*;

    const EXPOSITION: &str = r#"
# HELP deployment_head Track the head block number for a deployment
# TYPE deployment_head gauge
deployment_head{deployment="QmA",network="mainnet",shard="primary"} 120
deployment_head{deployment="QmB",network="mainnet",shard="primary"} 80
# TYPE store_connection_checkout_count counter
store_connection_checkout_count 17
"#;

    #[test]
    fn test_metric_name_sums_series() {
        assert_eq!(select_metric(EXPOSITION, "deployment_head").unwrap(), 200.0);
        assert_eq!(
            select_metric(EXPOSITION, "store_connection_checkout_count").unwrap(),
            17.0
        );
    }

    #[test]
    fn test_metric_series_matches_exactly() {
        let value = select_metric(
            EXPOSITION,
            r#"deployment_head{deployment="QmB",network="mainnet",shard="primary"}"#,
        )
        .unwrap();

        assert_eq!(value, 80.0);
    }

    #[test]
    fn test_missing_metric_is_not_found() {
        assert!(matches!(
            select_metric(EXPOSITION, "ethereum_chain_head_number"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_numbers_are_formatted_plainly() {
        assert_eq!(format_number(200.0), "200");
        assert_eq!(format_number(0.5), "0.5");
    }

    #[test]
    fn test_json_selection() {
        let document = json!({
            "version": "0.35.0",
            "chains": [{ "network": "mainnet", "latestBlock": { "number": "42" } }],
            "synced": true
        });

        assert_eq!(
            select_json(&document, "version").map(json_to_string),
            Some("0.35.0".to_string())
        );
        assert_eq!(
            select_json(&document, "chains.0.latestBlock.number").map(json_to_string),
            Some("42".to_string())
        );
        assert_eq!(
            select_json(&document, "/chains/0/network").map(json_to_string),
            Some("mainnet".to_string())
        );
        assert_eq!(
            select_json(&document, "synced").map(json_to_string),
            Some("true".to_string())
        );
        assert_eq!(select_json(&document, "chains.1"), None);
    }
}
