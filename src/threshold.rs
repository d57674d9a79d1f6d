//! Thresholds: declarative pass/fail criteria evaluated once at the end of a run.
//!
//! A threshold is written the way k6 writes them: a metric key plus an expression
//! `<aggregation> <comparison> <bound>`.
//!
//! ```text
//! http_req_duration:       p(95)<500
//! checks:                  rate>0.99
//! iteration_errors:        count==0
//! iteration_duration{api}: med<=250
//! ```
//!
//! The metric key may select a tagged sub-series with `name{tag}`. Expressions are
//! parsed and checked against the [`MetricCatalog`] at configuration time, so a
//! typo in a metric name fails the run before any virtual user is spawned.
//! Evaluation itself never fails: an unanswerable threshold is reported as a failed
//! [`ThresholdOutcome`] carrying a [`ThresholdEvaluationError`].

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::MetricAggregate,
    error::{ConfigError, ThresholdEvaluationError},
    metric::{MetricKind, BUILTIN_METRICS},
    sink::Snapshot,
};

/// Statistic a threshold reads from its metric.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Aggregation {
    /// `p(N)`: N-th percentile of a trend, N in `0..=100`.
    Percentile(f64),
    Avg,
    Min,
    Max,
    Med,
    /// Fraction of non-zero samples of a rate metric.
    Rate,
    /// Counter total, or the number of samples of a rate or trend.
    Count,
}

impl Aggregation {
    fn supports(&self, kind: MetricKind) -> bool {
        match self {
            Aggregation::Percentile(_)
            | Aggregation::Avg
            | Aggregation::Min
            | Aggregation::Max
            | Aggregation::Med => kind == MetricKind::Trend,
            Aggregation::Rate => kind == MetricKind::Rate,
            Aggregation::Count => true,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "avg" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "med" => Some(Self::Med),
            "rate" => Some(Self::Rate),
            "count" => Some(Self::Count),
            _ => {
                let inner = s.strip_prefix("p(")?.strip_suffix(')')?;
                let p: f64 = inner.trim().parse().ok()?;
                (0.0..=100.0).contains(&p).then_some(Self::Percentile(p))
            }
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Percentile(p) => write!(f, "p({p})"),
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Count => f.write_str("count"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    // Two-character operators first so `<=` is not read as `<`
    const TOKENS: [(&'static str, Comparison); 6] = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("!=", Comparison::Ne),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ];

    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => observed == bound,
            Comparison::Ne => observed != bound,
        }
    }
}

/// A parsed, validated threshold.
#[derive(Clone, Debug, PartialEq)]
pub struct Threshold {
    /// Metric key as written, e.g. `http_req_duration` or `checks{status is 200}`.
    pub metric: String,
    /// Expression as written, e.g. `p(95)<500`.
    pub expression: String,
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
}

impl Threshold {
    /// Parse `expression` for the metric key `metric`.
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_owned(),
            expression: expression.to_owned(),
            reason: reason.to_owned(),
        };

        split_metric_key(metric).ok_or_else(|| invalid("malformed metric key"))?;

        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
        let (at, token, comparison) = Comparison::TOKENS
            .iter()
            .filter_map(|(tok, cmp)| compact.find(tok).map(|at| (at, *tok, *cmp)))
            // leftmost operator wins, longest token on ties
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.len().cmp(&a.1.len())))
            .ok_or_else(|| invalid("missing comparison operator"))?;

        let aggregation = Aggregation::parse(&compact[..at])
            .ok_or_else(|| invalid("unknown aggregation"))?;
        let bound: f64 = compact[at + token.len()..]
            .parse()
            .map_err(|_| invalid("bound is not a number"))?;
        if !bound.is_finite() {
            return Err(invalid("bound must be finite"));
        }

        Ok(Self {
            metric: metric.to_owned(),
            expression: expression.to_owned(),
            aggregation,
            comparison,
            bound,
        })
    }

    /// Base metric name without the tag selector.
    pub fn metric_name(&self) -> &str {
        split_metric_key(&self.metric).map_or(self.metric.as_str(), |(name, _)| name)
    }

    pub fn tag(&self) -> Option<&str> {
        split_metric_key(&self.metric).and_then(|(_, tag)| tag)
    }

    /// Reject metrics the run cannot produce and aggregations the metric's kind
    /// cannot answer.
    pub fn validate(&self, catalog: &MetricCatalog) -> Result<(), ConfigError> {
        let name = self.metric_name();
        let kind = catalog
            .kind(name)
            .ok_or_else(|| ConfigError::UnknownMetric(name.to_owned()))?;
        if !self.aggregation.supports(kind) {
            return Err(ConfigError::IncompatibleAggregation {
                metric: name.to_owned(),
                kind,
                aggregation: self.aggregation.to_string(),
            });
        }
        Ok(())
    }

    /// Read the statistic this threshold compares.
    pub fn observe(&self, snapshot: &Snapshot) -> Result<f64, ThresholdEvaluationError> {
        let name = self.metric_name();
        let metric = snapshot.get(name);
        let aggregate = match (metric, self.tag()) {
            (Some(m), None) => Some(&m.all),
            (Some(m), Some(tag)) => m.tagged.get(tag),
            (None, _) => None,
        };

        let Some(aggregate) = aggregate else {
            // Nothing recorded is a well defined count of zero
            if self.aggregation == Aggregation::Count {
                return Ok(0.0);
            }
            return Err(ThresholdEvaluationError::MissingMetric(self.metric.clone()));
        };

        let no_samples = || ThresholdEvaluationError::NoSamples(self.metric.clone());
        let unsupported = || ThresholdEvaluationError::UnsupportedAggregation(self.metric.clone());
        match (self.aggregation, aggregate) {
            (Aggregation::Count, MetricAggregate::Counter(c)) => Ok(c.total),
            (Aggregation::Count, other) => Ok(other.count() as f64),
            (Aggregation::Rate, MetricAggregate::Rate(r)) => r.rate().ok_or_else(no_samples),
            (Aggregation::Percentile(p), MetricAggregate::Trend(t)) => {
                t.percentile(p).ok_or_else(no_samples)
            }
            (Aggregation::Avg, MetricAggregate::Trend(t)) => t.avg().ok_or_else(no_samples),
            (Aggregation::Min, MetricAggregate::Trend(t)) => t.min().ok_or_else(no_samples),
            (Aggregation::Max, MetricAggregate::Trend(t)) => t.max().ok_or_else(no_samples),
            (Aggregation::Med, MetricAggregate::Trend(t)) => t.median().ok_or_else(no_samples),
            _ => Err(unsupported()),
        }
    }

    pub fn evaluate(&self, snapshot: &Snapshot) -> ThresholdOutcome {
        match self.observe(snapshot) {
            Ok(observed) => ThresholdOutcome {
                metric: self.metric.clone(),
                expression: self.expression.clone(),
                passed: self.comparison.holds(observed, self.bound),
                observed: Some(observed),
                error: None,
            },
            Err(error) => ThresholdOutcome {
                metric: self.metric.clone(),
                expression: self.expression.clone(),
                passed: false,
                observed: None,
                error: Some(error),
            },
        }
    }
}

/// Split `name{tag}` into its parts. `None` when the key is malformed.
fn split_metric_key(key: &str) -> Option<(&str, Option<&str>)> {
    let key = key.trim();
    match key.split_once('{') {
        None if !key.is_empty() && !key.contains('}') => Some((key, None)),
        None => None,
        Some((name, rest)) => {
            let tag = rest.strip_suffix('}')?;
            (!name.is_empty() && !tag.is_empty()).then_some((name, Some(tag)))
        }
    }
}

/// Result of one threshold against the final snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOutcome {
    pub metric: String,
    pub expression: String,
    pub passed: bool,
    pub observed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ThresholdEvaluationError>,
}

/// Evaluate every threshold once against `snapshot`.
///
/// Pure: the same thresholds against the same snapshot always yield the same
/// outcomes, in the order the thresholds were given.
pub fn evaluate(thresholds: &[Threshold], snapshot: &Snapshot) -> Vec<ThresholdOutcome> {
    thresholds.iter().map(|t| t.evaluate(snapshot)).collect()
}

/// Parse a `metric -> [expression]` map, validating every entry.
pub fn parse_all(
    raw: &BTreeMap<String, Vec<String>>,
    catalog: &MetricCatalog,
) -> Result<Vec<Threshold>, ConfigError> {
    let mut thresholds = Vec::new();
    for (metric, expressions) in raw {
        for expression in expressions {
            let threshold = Threshold::parse(metric, expression)?;
            threshold.validate(catalog)?;
            thresholds.push(threshold);
        }
    }
    Ok(thresholds)
}

/// Every metric name a run can produce: the built-ins plus declared custom metrics.
#[derive(Clone, Debug)]
pub struct MetricCatalog {
    kinds: BTreeMap<String, MetricKind>,
}

impl Default for MetricCatalog {
    fn default() -> Self {
        Self {
            kinds: BUILTIN_METRICS
                .iter()
                .map(|(name, kind)| ((*name).to_owned(), *kind))
                .collect(),
        }
    }
}

impl MetricCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a custom metric. Built-in names cannot be redeclared.
    pub fn declare(&mut self, name: &str, kind: MetricKind) -> Result<(), ConfigError> {
        if self.kinds.contains_key(name) {
            return Err(ConfigError::DuplicateMetric(name.to_owned()));
        }
        self.kinds.insert(name.to_owned(), kind);
        Ok(())
    }

    pub fn kind(&self, name: &str) -> Option<MetricKind> {
        self.kinds.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, MetricKind)> {
        self.kinds.iter().map(|(name, kind)| (name.as_str(), *kind))
    }
}
