use crate::error::ConfigError;
use crate::stats::AggregateStats;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Aggregate metric a threshold is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMetric {
    P95Latency,
    ErrorRate,
    /// Any other latency percentile, in percent.
    Percentile(f64),
    AvgLatency,
    MaxLatency,
    TotalRequests,
    /// Fraction of passed response checks.
    CheckRate,
}

impl ThresholdMetric {
    fn is_latency(self) -> bool {
        matches!(
            self,
            ThresholdMetric::P95Latency
                | ThresholdMetric::Percentile(_)
                | ThresholdMetric::AvgLatency
                | ThresholdMetric::MaxLatency
        )
    }

    pub fn observe(self, stats: &AggregateStats) -> f64 {
        match self {
            ThresholdMetric::P95Latency => stats.percentile(95.0),
            ThresholdMetric::ErrorRate => stats.error_rate(),
            ThresholdMetric::Percentile(p) => stats.percentile(p),
            ThresholdMetric::AvgLatency => stats.mean_latency(),
            ThresholdMetric::MaxLatency => stats.max_latency_ms,
            ThresholdMetric::TotalRequests => stats.total_requests as f64,
            ThresholdMetric::CheckRate => stats.check_rate(),
        }
    }

    /// Whether the rule has nothing to measure and passes without a check.
    /// Latency bounds over an empty run hold vacuously, as does a check
    /// rate when no check ran. Request counts and error rates are always
    /// evaluated, so `http_reqs count>0` still fails an empty run.
    fn is_vacuous(self, stats: &AggregateStats) -> bool {
        match self {
            ThresholdMetric::CheckRate => stats.checks_passed + stats.checks_failed == 0,
            metric => metric.is_latency() && stats.total_requests == 0,
        }
    }

    fn source_name(self) -> &'static str {
        match self {
            ThresholdMetric::ErrorRate => "http_req_failed",
            ThresholdMetric::TotalRequests => "http_reqs",
            ThresholdMetric::CheckRate => "checks",
            _ => "http_req_duration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Comparator {
    pub fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Comparator::Lt => observed < bound,
            Comparator::Lte => observed <= bound,
            Comparator::Gt => observed > bound,
            Comparator::Gte => observed >= bound,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
        }
    }
}

/// Pass/fail bound on one aggregate metric, checked once at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub metric: ThresholdMetric,
    pub comparator: Comparator,
    pub bound: f64,
}

impl ThresholdRule {
    pub fn new(metric: ThresholdMetric, comparator: Comparator, bound: f64) -> Self {
        Self {
            metric,
            comparator,
            bound,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.bound.is_finite() {
            return Err(ConfigError::malformed(self.to_string(), "bound must be finite"));
        }
        if let ThresholdMetric::Percentile(p) = self.metric {
            if !(p > 0.0 && p <= 100.0) {
                return Err(ConfigError::malformed(
                    self.to_string(),
                    "percentile must be in (0, 100]",
                ));
            }
        }
        Ok(())
    }

    /// Parse a rule written against a named source metric, e.g.
    /// `("http_req_duration", "p(95)<300")` or `("http_req_failed", "rate<0.01")`.
    pub fn parse(metric: &str, expr: &str) -> Result<Self, ConfigError> {
        let compact: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
        let op_at = compact
            .find(['<', '>'])
            .ok_or_else(|| ConfigError::malformed(expr, "missing comparator"))?;

        let (aggregation, rest) = compact.split_at(op_at);
        let (comparator, bound) = match rest.as_bytes() {
            [b'<', b'=', ..] => (Comparator::Lte, &rest[2..]),
            [b'>', b'=', ..] => (Comparator::Gte, &rest[2..]),
            [b'<', ..] => (Comparator::Lt, &rest[1..]),
            _ => (Comparator::Gt, &rest[1..]),
        };

        let bound: f64 = bound
            .parse()
            .map_err(|_| ConfigError::malformed(expr, format!("invalid bound '{bound}'")))?;

        let metric = match (metric, aggregation) {
            ("http_req_duration", "avg") => ThresholdMetric::AvgLatency,
            ("http_req_duration", "max") => ThresholdMetric::MaxLatency,
            ("http_req_duration", "med") => ThresholdMetric::Percentile(50.0),
            ("http_req_duration", agg) => parse_percentile(agg)
                .map(|p| {
                    if p == 95.0 {
                        ThresholdMetric::P95Latency
                    } else {
                        ThresholdMetric::Percentile(p)
                    }
                })
                .ok_or_else(|| {
                    ConfigError::malformed(expr, format!("unsupported aggregation '{agg}'"))
                })?,
            ("http_req_failed", "rate") => ThresholdMetric::ErrorRate,
            ("http_reqs", "count") => ThresholdMetric::TotalRequests,
            ("checks", "rate") => ThresholdMetric::CheckRate,
            ("http_req_failed" | "http_reqs" | "checks", agg) => {
                return Err(ConfigError::malformed(
                    expr,
                    format!("unsupported aggregation '{agg}' for {metric}"),
                ))
            }
            (other, _) => return Err(ConfigError::UnknownMetric(other.to_string())),
        };

        let rule = ThresholdRule::new(metric, comparator, bound);
        rule.validate()?;
        Ok(rule)
    }

    pub fn evaluate(&self, stats: &AggregateStats) -> RuleOutcome {
        let observed = self.metric.observe(stats);
        let passed =
            self.metric.is_vacuous(stats) || self.comparator.holds(observed, self.bound);
        RuleOutcome {
            rule: *self,
            observed,
            passed,
        }
    }
}

fn parse_percentile(aggregation: &str) -> Option<f64> {
    aggregation
        .strip_prefix("p(")
        .and_then(|s| s.strip_suffix(')'))
        .and_then(|s| s.parse().ok())
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.metric.source_name())?;
        match self.metric {
            ThresholdMetric::P95Latency => write!(f, "p(95)")?,
            ThresholdMetric::Percentile(p) => write!(f, "p({p})")?,
            ThresholdMetric::AvgLatency => write!(f, "avg")?,
            ThresholdMetric::MaxLatency => write!(f, "max")?,
            ThresholdMetric::TotalRequests => write!(f, "count")?,
            ThresholdMetric::ErrorRate | ThresholdMetric::CheckRate => write!(f, "rate")?,
        }
        write!(f, "{}{}", self.comparator.symbol(), self.bound)
    }
}

/// Parses `"<metric> <expr>"`, e.g. `"http_req_duration p(95)<300"`.
impl FromStr for ThresholdRule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (metric, expr) = s
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| ConfigError::malformed(s, "expected '<metric> <expression>'"))?;
        ThresholdRule::parse(metric, expr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule: ThresholdRule,
    pub observed: f64,
    pub passed: bool,
}

/// Terminal pass/fail outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunVerdict {
    pub passed: bool,
    /// Rules that did not hold, in declaration order.
    pub failed_rules: Vec<ThresholdRule>,
    pub outcomes: Vec<RuleOutcome>,
    pub stats: AggregateStats,
}

/// Evaluate every rule independently against a final snapshot.
pub fn evaluate(stats: &AggregateStats, rules: &[ThresholdRule]) -> RunVerdict {
    let outcomes: Vec<RuleOutcome> = rules.iter().map(|rule| rule.evaluate(stats)).collect();
    let failed_rules: Vec<ThresholdRule> = outcomes
        .iter()
        .filter(|o| !o.passed)
        .map(|o| o.rule)
        .collect();

    RunVerdict {
        passed: failed_rules.is_empty(),
        failed_rules,
        outcomes,
        stats: stats.clone(),
    }
}
