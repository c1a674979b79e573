//! The rule condition language.
//!
//! A condition is a single comparison between a variable and a literal:
//!
//! ```text
//! remaining < 10
//! used > 500
//! cost == 0
//! forecast_tte < 3600
//! provider_id == "github"
//! ```
//!
//! Conditions are compiled once when a policy is loaded. Text that does not
//! fit the grammar compiles to [`Condition::Invalid`], which never matches.

use std::fmt;

/// Numeric variables a condition can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    Remaining,
    Used,
    Cost,
    ForecastTte,
}

impl Variable {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "remaining" => Some(Self::Remaining),
            "used" => Some(Self::Used),
            "cost" => Some(Self::Cost),
            "forecast_tte" => Some(Self::ForecastTte),
            _ => None,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Remaining => "remaining",
            Self::Used => "used",
            Self::Cost => "cost",
            Self::ForecastTte => "forecast_tte",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Less,
    Greater,
    Equal,
}

impl Comparison {
    #[expect(clippy::float_cmp, reason = "equality against integer literals is exact")]
    fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Less => lhs < rhs,
            Self::Greater => lhs > rhs,
            Self::Equal => lhs == rhs,
        }
    }

    const fn symbol(self) -> &'static str {
        match self {
            Self::Less => "<",
            Self::Greater => ">",
            Self::Equal => "==",
        }
    }

    const fn negated_symbol(self) -> &'static str {
        match self {
            Self::Less => ">=",
            Self::Greater => "<=",
            Self::Equal => "!=",
        }
    }
}

/// A compiled condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Numeric {
        variable: Variable,
        comparison: Comparison,
        threshold: f64,
    },
    ProviderIs(String),
    /// The text did not parse. Evaluates to no match.
    Invalid { reason: String },
}

/// Values a condition is evaluated against.
///
/// Numeric inputs are `None` when the pool (or its forecast) is unknown;
/// a condition over a missing input does not match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment<'a> {
    pub provider_id: &'a str,
    pub remaining: Option<f64>,
    pub used: Option<f64>,
    pub cost: Option<f64>,
    pub forecast_tte: Option<f64>,
}

impl Environment<'_> {
    const fn value(&self, variable: Variable) -> Option<f64> {
        match variable {
            Variable::Remaining => self.remaining,
            Variable::Used => self.used,
            Variable::Cost => self.cost,
            Variable::ForecastTte => self.forecast_tte,
        }
    }
}

/// Whether a condition matched, with a human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub matched: bool,
    pub explanation: String,
}

impl Outcome {
    fn passed(explanation: String) -> Self {
        Self {
            matched: true,
            explanation: format!("passed: {explanation}"),
        }
    }

    fn failed(explanation: impl fmt::Display) -> Self {
        Self {
            matched: false,
            explanation: format!("failed: {explanation}"),
        }
    }
}

fn split_comparison(text: &str) -> Option<(&str, Comparison, &str)> {
    if let Some(pos) = text.find("==") {
        return Some((&text[..pos], Comparison::Equal, &text[pos + 2..]));
    }
    let pos = text.find(['<', '>'])?;
    let comparison = if text[pos..].starts_with('<') {
        Comparison::Less
    } else {
        Comparison::Greater
    };
    Some((&text[..pos], comparison, &text[pos + 1..]))
}

fn unquote(literal: &str) -> &str {
    literal
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(literal)
}

impl Condition {
    /// Compiles condition text. Never fails; see [`Condition::Invalid`].
    pub fn parse(text: &str) -> Self {
        let invalid = |reason: &str| Self::Invalid {
            reason: reason.to_string(),
        };

        let text = text.trim();
        if text.is_empty() {
            return invalid("empty condition");
        }
        let Some((lhs, comparison, rhs)) = split_comparison(text) else {
            return invalid("no comparison operator");
        };
        let (lhs, rhs) = (lhs.trim(), rhs.trim());
        if rhs.starts_with(['=', '<', '>']) || lhs.ends_with('!') {
            return invalid("unsupported operator");
        }
        if rhs.is_empty() {
            return invalid("missing right-hand side");
        }

        if lhs == "provider_id" {
            if comparison != Comparison::Equal {
                return invalid("provider_id supports only ==");
            }
            let value = unquote(rhs);
            if value.is_empty() || value.contains(char::is_whitespace) {
                return invalid("provider_id literal must be a single word");
            }
            return Self::ProviderIs(value.to_string());
        }

        let Some(variable) = Variable::parse(lhs) else {
            return invalid("unknown variable");
        };
        match rhs.parse::<f64>() {
            Ok(threshold) if threshold.is_finite() => Self::Numeric {
                variable,
                comparison,
                threshold,
            },
            _ => invalid("threshold is not a number"),
        }
    }

    pub const fn is_valid(&self) -> bool {
        !matches!(self, Self::Invalid { .. })
    }

    pub fn evaluate(&self, env: &Environment<'_>) -> Outcome {
        match self {
            Self::ProviderIs(expected) => {
                if env.provider_id == expected {
                    Outcome::passed("provider_id matches".to_string())
                } else {
                    Outcome::failed("provider_id does not match")
                }
            }
            Self::Numeric {
                variable,
                comparison,
                threshold,
            } => {
                let Some(value) = env.value(*variable) else {
                    return Outcome::failed(format_args!("{} unavailable", variable.as_str()));
                };
                if comparison.holds(value, *threshold) {
                    Outcome::passed(format!(
                        "{} {value} {} {threshold}",
                        variable.as_str(),
                        comparison.symbol()
                    ))
                } else {
                    Outcome::failed(format_args!(
                        "{} {value} {} {threshold}",
                        variable.as_str(),
                        comparison.negated_symbol()
                    ))
                }
            }
            Self::Invalid { reason } => Outcome::failed(format_args!("unparseable condition ({reason})")),
        }
    }
}
