use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use crate::observers::Observer;
use crate::rule::{RuleOutcome, ValidationRule};

/// Upper bound for a single observation.
pub const DEFAULT_OBSERVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Evaluates every rule concurrently.
///
/// Outcomes are returned in the order of `rules`. A rule whose target has no
/// observer, or whose observer fails or times out, is a failing outcome with no
/// observed value.
pub async fn evaluate(
    rules: &[ValidationRule],
    observers: &HashMap<String, Arc<dyn Observer>>,
    observe_timeout: Duration,
) -> Vec<RuleOutcome> {
    let outcomes = join_all(
        rules
            .iter()
            .map(|rule| evaluate_rule(rule, observers.get(&rule.target), observe_timeout)),
    )
    .await;

    for outcome in &outcomes {
        if outcome.passed {
            info!(rule = %outcome.rule.label(), "validation passed: {}", outcome.detail);
        } else {
            warn!(rule = %outcome.rule.label(), "validation failed: {}", outcome.detail);
        }
    }

    outcomes
}

async fn evaluate_rule(
    rule: &ValidationRule,
    observer: Option<&Arc<dyn Observer>>,
    observe_timeout: Duration,
) -> RuleOutcome {
    let Some(observer) = observer else {
        return failed(rule, format!("no observer configured for `{}`", rule.target));
    };

    let observed = match tokio::time::timeout(observe_timeout, observer.observe(&rule.query)).await
    {
        Ok(Ok(observed)) => observed,
        Ok(Err(e)) => return failed(rule, format!("failed to observe `{}`: {e}", rule.query)),
        Err(_) => {
            return failed(
                rule,
                format!("observing `{}` took longer than {observe_timeout:?}", rule.query),
            );
        }
    };

    match rule.comparator.holds(&observed, &rule.expected) {
        Ok(passed) => {
            let verdict = if passed { "holds" } else { "does not hold" };
            RuleOutcome {
                rule: rule.clone(),
                passed,
                detail: format!(
                    "{} {observed:?} {} {:?} {verdict}",
                    rule.query, rule.comparator, rule.expected
                ),
                observed: Some(observed),
            }
        }
        Err(reason) => RuleOutcome {
            rule: rule.clone(),
            passed: false,
            observed: Some(observed),
            detail: reason,
        },
    }
}

fn failed(rule: &ValidationRule, detail: String) -> RuleOutcome {
    RuleOutcome {
        rule: rule.clone(),
        passed: false,
        observed: None,
        detail,
    }
}
