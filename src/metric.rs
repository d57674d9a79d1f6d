use std::{fmt, time::SystemTime};

use serde::{Deserialize, Serialize};

/// Number of completed scenario iterations.
pub const ITERATIONS: &str = "iterations";
/// Wall time of each scenario iteration, tagged with the scenario name.
pub const ITERATION_DURATION: &str = "iteration_duration";
/// Iterations that returned an error or panicked.
pub const ITERATION_ERRORS: &str = "iteration_errors";
/// Fraction of passing checks across the whole run.
pub const CHECKS: &str = "checks";
/// Number of HTTP requests issued through an instrumented client.
pub const HTTP_REQS: &str = "http_reqs";
/// Time from sending a request until the response was received.
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
/// Fraction of HTTP requests that failed (transport error or status >= 400).
pub const HTTP_REQ_FAILED: &str = "http_req_failed";

/// Label of the check recorded when an iteration faults.
pub const ITERATION_CHECK: &str = "iteration completed";

/// Every metric the crate itself produces, with its kind.
pub const BUILTIN_METRICS: &[(&str, MetricKind)] = &[
    (ITERATIONS, MetricKind::Counter),
    (ITERATION_DURATION, MetricKind::Trend),
    (ITERATION_ERRORS, MetricKind::Counter),
    (CHECKS, MetricKind::Rate),
    (HTTP_REQS, MetricKind::Counter),
    (HTTP_REQ_DURATION, MetricKind::Trend),
    (HTTP_REQ_FAILED, MetricKind::Rate),
];

/// How samples of a metric are aggregated.
///
/// - `Counter`: values are summed.
/// - `Rate`: values are booleans (non-zero is `true`), the metric reports the
///   fraction of `true` samples.
/// - `Trend`: values are durations in milliseconds kept in a histogram so that
///   percentiles can be queried at the end of the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        })
    }
}

/// A `Sample` is a single observed measurement produced by a virtual user.
///
/// Samples are the most granular level of data in a run. They are created by
/// exactly one virtual user, handed to the [`crate::MetricSink`] and never
/// mutated afterwards; the sink only ever aggregates them.
///
/// ## Example
/// ```rust
/// use std::time::Duration;
/// use stampede::metric::{HTTP_REQ_DURATION, Sample};
///
/// let sample = Sample::duration(HTTP_REQ_DURATION, Duration::from_millis(42));
/// assert_eq!(sample.value, 42.0);
/// ```
#[derive(Clone, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub timestamp: SystemTime,
    /// Optional sub-series, e.g. the scenario name or a check label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl Sample {
    pub fn new(name: impl Into<String>, kind: MetricKind, value: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            timestamp: SystemTime::now(),
            tag: None,
        }
    }

    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Counter, value)
    }

    pub fn rate(name: impl Into<String>, hit: bool) -> Self {
        Self::new(name, MetricKind::Rate, if hit { 1.0 } else { 0.0 })
    }

    pub fn trend(name: impl Into<String>, millis: f64) -> Self {
        Self::new(name, MetricKind::Trend, millis)
    }

    pub fn duration(name: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::trend(name, elapsed.as_micros() as f64 / 1000.0)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn duration_samples_are_millis() {
        let s = Sample::duration(HTTP_REQ_DURATION, Duration::from_micros(1500));
        assert_eq!(s.kind, MetricKind::Trend);
        assert_eq!(s.value, 1.5);
    }

    #[test]
    fn rate_samples_are_zero_or_one() {
        assert_eq!(Sample::rate(CHECKS, true).value, 1.0);
        assert_eq!(Sample::rate(CHECKS, false).value, 0.0);
    }

    #[test]
    fn tags_are_optional() {
        assert_eq!(Sample::counter(ITERATIONS, 1.0).tag, None);
        let s = Sample::trend(ITERATION_DURATION, 3.0).with_tag("query");
        assert_eq!(s.tag.as_deref(), Some("query"));
    }
}
