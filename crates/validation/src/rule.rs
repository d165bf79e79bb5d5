//! Validation rules and comparators.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// How an observed value is compared to the expected one.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    /// Exact string equality.
    #[default]
    Equals,

    /// String inequality.
    NotEquals,

    /// Observed value contains the expected substring.
    Contains,

    /// Numeric `observed > expected`.
    GreaterThan,

    /// Numeric `observed >= expected`.
    AtLeast,

    /// Numeric `observed < expected`.
    LessThan,

    /// Numeric `observed <= expected`.
    AtMost,
}

impl Comparator {
    /// Applies the comparator.
    ///
    /// # Errors
    ///
    /// Returns a description if a numeric comparator gets a non-numeric value.
    pub fn holds(self, observed: &str, expected: &str) -> Result<bool, String> {
        match self {
            Self::Equals => Ok(observed == expected),
            Self::NotEquals => Ok(observed != expected),
            Self::Contains => Ok(observed.contains(expected)),
            Self::GreaterThan | Self::AtLeast | Self::LessThan | Self::AtMost => {
                let lhs = parse_number(observed, "observed")?;
                let rhs = parse_number(expected, "expected")?;

                Ok(match self {
                    Self::GreaterThan => lhs > rhs,
                    Self::AtLeast => lhs >= rhs,
                    Self::LessThan => lhs < rhs,
                    _ => lhs <= rhs,
                })
            }
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Equals => "==",
            Self::NotEquals => "!=",
            Self::Contains => "contains",
            Self::GreaterThan => ">",
            Self::AtLeast => ">=",
            Self::LessThan => "<",
            Self::AtMost => "<=",
        };

        f.write_str(symbol)
    }
}

fn parse_number(value: &str, which: &str) -> Result<f64, String> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("{which} value `{value}` is not a number"))
}

/// A post-readiness assertion about one service.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ValidationRule {
    /// Optional label used in reports.
    #[serde(default)]
    pub name: Option<String>,

    /// Service whose observer answers the query.
    pub target: String,

    /// Selector passed to the observer.
    pub query: String,

    /// Expected value.
    #[serde(deserialize_with = "scalar_as_string")]
    pub expected: String,

    /// Comparison applied to the observed value.
    #[serde(default)]
    pub comparator: Comparator,
}

impl ValidationRule {
    /// Creates an equality rule.
    #[must_use]
    pub fn equals(
        target: impl Into<String>,
        query: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self {
            name: None,
            target: target.into(),
            query: query.into(),
            expected: expected.into(),
            comparator: Comparator::Equals,
        }
    }

    /// Returns the rule's label, or `target.query` when unnamed.
    #[must_use]
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.target, self.query))
    }
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {} {:?}",
            self.label(),
            self.query,
            self.comparator,
            self.expected
        )
    }
}

/// Outcome of evaluating one rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RuleOutcome {
    /// Rule that was evaluated.
    pub rule: ValidationRule,

    /// Whether the rule held.
    pub passed: bool,

    /// Observed value, if the observer answered.
    pub observed: Option<String>,

    /// Human-readable explanation.
    pub detail: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

fn scalar_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Bool(b) => b.to_string(),
        Scalar::Integer(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Text(s) => s,
    })
}
