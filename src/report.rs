use std::{collections::BTreeMap, fmt, future::Future, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    executor::Execution,
    sink::{CheckTally, MetricSummary, Snapshot},
    threshold::ThresholdOutcome,
};

/// Exit code of a run whose thresholds all passed.
pub const EXIT_PASSED: i32 = 0;
/// Exit code of a run with at least one failed threshold.
pub const EXIT_THRESHOLDS_FAILED: i32 = 99;

/// Final outcome of a run. Built once at the end and never changed afterwards.
///
/// A [`Verdict`] is pure data: it is what reporters render, what CI reads through
/// [`Verdict::exit_code`] and what `JsonReporter` serializes. Its fields are only
/// readable, so `passed` always agrees with `thresholds`:
///
/// ```compile_fail
/// fn tamper(verdict: &mut stampede::Verdict) {
///     verdict.passed = true;
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Verdict {
    scenario: String,
    passed: bool,
    cancelled: bool,
    #[serde(with = "humantime_serde")]
    elapsed: Duration,
    peak_vus: usize,
    iterations: u64,
    thresholds: Vec<ThresholdOutcome>,
    metrics: BTreeMap<String, MetricSummary>,
    checks: Vec<CheckTally>,
    #[serde(skip)]
    snapshot: Snapshot,
}

impl Verdict {
    pub fn new(
        scenario: impl Into<String>,
        execution: Execution,
        thresholds: Vec<ThresholdOutcome>,
        snapshot: Snapshot,
    ) -> Self {
        Self {
            scenario: scenario.into(),
            passed: thresholds.iter().all(|t| t.passed),
            cancelled: execution.cancelled,
            elapsed: execution.elapsed,
            peak_vus: execution.peak_vus,
            iterations: execution.iterations,
            thresholds,
            metrics: snapshot.summaries(),
            checks: snapshot.checks(),
            snapshot,
        }
    }

    /// `0` when every threshold passed, `99` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.passed {
            EXIT_PASSED
        } else {
            EXIT_THRESHOLDS_FAILED
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// Every threshold passed. Cancellation alone does not clear it.
    pub fn passed(&self) -> bool {
        self.passed
    }

    /// The run was stopped before its schedule finished.
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn peak_vus(&self) -> usize {
        self.peak_vus
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// One outcome per configured threshold, in evaluation order.
    pub fn thresholds(&self) -> &[ThresholdOutcome] {
        &self.thresholds
    }

    /// Summary of every metric, keyed by name.
    pub fn metrics(&self) -> &BTreeMap<String, MetricSummary> {
        &self.metrics
    }

    pub fn checks(&self) -> &[CheckTally] {
        &self.checks
    }

    /// The raw aggregates the verdict was computed from, for arbitrary queries.
    /// Empty on a deserialized verdict.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdOutcome> {
        self.thresholds.iter().filter(|t| !t.passed)
    }
}

fn opt(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_owned(), |v| format!("{v:.2}"))
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match (self.passed, self.cancelled) {
            (true, false) => "PASSED",
            (true, true) => "PASSED (cancelled)",
            (false, false) => "FAILED",
            (false, true) => "FAILED (cancelled)",
        };
        writeln!(f, "scenario: {} {status}", self.scenario)?;
        writeln!(
            f,
            "  elapsed {:?}, peak {} VUs, {} iterations",
            Duration::from_millis(self.elapsed.as_millis() as u64),
            self.peak_vus,
            self.iterations
        )?;

        if !self.thresholds.is_empty() {
            writeln!(f, "\nthresholds:")?;
            for t in &self.thresholds {
                let mark = if t.passed { "✓" } else { "✗" };
                write!(f, "  {mark} {}: {} ", t.metric, t.expression)?;
                match (&t.observed, &t.error) {
                    (_, Some(error)) => writeln!(f, "({error})")?,
                    (Some(observed), None) => writeln!(f, "(observed {observed:.2})")?,
                    (None, None) => writeln!(f)?,
                }
            }
        }

        if !self.checks.is_empty() {
            writeln!(f, "\nchecks:")?;
            for c in &self.checks {
                let mark = if c.fails == 0 { "✓" } else { "✗" };
                writeln!(f, "  {mark} {} ({} passed, {} failed)", c.label, c.passes, c.fails)?;
            }
        }

        if !self.metrics.is_empty() {
            writeln!(f, "\nmetrics:")?;
        }
        for (name, summary) in &self.metrics {
            match summary {
                MetricSummary::Counter { count, total } => {
                    writeln!(f, "  {name:<20} total={total} samples={count}")?
                }
                MetricSummary::Rate {
                    passes,
                    fails,
                    rate,
                } => writeln!(
                    f,
                    "  {name:<20} rate={}% ({passes} / {})",
                    opt(rate.map(|r| r * 100.0)),
                    passes + fails
                )?,
                MetricSummary::Trend {
                    avg,
                    min,
                    med,
                    max,
                    p90,
                    p95,
                    ..
                } => writeln!(
                    f,
                    "  {name:<20} avg={}ms min={}ms med={}ms max={}ms p(90)={}ms p(95)={}ms",
                    opt(*avg),
                    opt(*min),
                    opt(*med),
                    opt(*max),
                    opt(*p90),
                    opt(*p95)
                )?,
            }
        }
        Ok(())
    }
}

/// A [`Reporter`] consumes a [`Verdict`] and performs side effects: displaying
/// it, sending it to a service, or persisting it somewhere.
///
/// Reporters are the I/O boundary of stampede; the verdict itself stays pure data.
///
/// # Example
/// ```rust
/// use stampede::{Reporter, Verdict, Error};
///
/// struct FailuresOnly;
///
/// impl Reporter for FailuresOnly {
///     async fn report(&self, verdict: &Verdict) -> Result<(), Error> {
///         for t in verdict.failed_thresholds() {
///             eprintln!("{}: {} failed", t.metric, t.expression);
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter {
    fn report(&self, verdict: &Verdict) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Prints the human readable summary.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutReporter;

impl Reporter for StdoutReporter {
    async fn report(&self, verdict: &Verdict) -> Result<(), Error> {
        println!("{verdict}");
        Ok(())
    }
}

/// Writes the verdict as pretty JSON, to a file or to stdout.
#[derive(Clone, Debug, Default)]
pub struct JsonReporter {
    path: Option<PathBuf>,
}

impl JsonReporter {
    pub fn stdout() -> Self {
        Self { path: None }
    }

    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

impl Reporter for JsonReporter {
    async fn report(&self, verdict: &Verdict) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(verdict)?;
        match &self.path {
            Some(path) => {
                tokio::fs::write(path, json).await?;
                tracing::info!("Wrote verdict to {}", path.display());
            }
            None => println!("{json}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ThresholdEvaluationError,
        metric::{CHECKS, HTTP_REQ_DURATION, ITERATIONS},
        sink::MetricSink,
    };

    fn outcome(metric: &str, expression: &str, passed: bool, observed: Option<f64>) -> ThresholdOutcome {
        ThresholdOutcome {
            metric: metric.into(),
            expression: expression.into(),
            passed,
            observed,
            error: None,
        }
    }

    fn verdict(thresholds: Vec<ThresholdOutcome>, cancelled: bool) -> Verdict {
        let sink = MetricSink::new();
        sink.add(ITERATIONS, 3.0);
        sink.observe(HTTP_REQ_DURATION, Duration::from_millis(42));
        sink.check("status is 200", true);
        sink.check("status is 200", false);
        let execution = Execution {
            elapsed: Duration::from_secs(30),
            peak_vus: 10,
            iterations: 3,
            cancelled,
        };
        Verdict::new("query", execution, thresholds, sink.snapshot())
    }

    #[test]
    fn exit_codes() {
        let pass = verdict(vec![outcome(HTTP_REQ_DURATION, "p(95)<500", true, Some(42.0))], false);
        assert!(pass.passed());
        assert_eq!(pass.exit_code(), 0);

        let fail = verdict(
            vec![
                outcome(HTTP_REQ_DURATION, "p(95)<500", true, Some(42.0)),
                outcome(CHECKS, "rate>0.99", false, Some(0.5)),
            ],
            false,
        );
        assert!(!fail.passed());
        assert_eq!(fail.exit_code(), 99);
        assert_eq!(fail.failed_thresholds().count(), 1);
    }

    #[test]
    fn accessors_reflect_the_run() {
        let v = verdict(vec![outcome(CHECKS, "rate>0.4", true, Some(0.5))], false);
        assert_eq!(v.scenario(), "query");
        assert_eq!(v.elapsed(), Duration::from_secs(30));
        assert_eq!(v.iterations(), 3);
        assert_eq!(v.thresholds().len(), 1);
        assert_eq!(v.checks().len(), 1);
        assert!(v.metrics().contains_key(HTTP_REQ_DURATION));
    }

    #[test]
    fn cancellation_alone_does_not_fail() {
        let v = verdict(vec![], true);
        assert!(v.cancelled());
        assert!(v.passed());
        assert_eq!(v.exit_code(), 0);
    }

    #[test]
    fn summary_lists_every_threshold() {
        let mut missing = outcome("http_req_failed", "rate<0.01", false, None);
        missing.error = Some(ThresholdEvaluationError::NoSamples("http_req_failed".into()));
        let v = verdict(
            vec![
                outcome(HTTP_REQ_DURATION, "p(95)<500", true, Some(42.0)),
                outcome(CHECKS, "rate>0.99", false, Some(0.5)),
                missing,
            ],
            false,
        );
        let text = v.to_string();
        assert!(text.contains("FAILED"));
        assert!(text.contains("✓ http_req_duration: p(95)<500 (observed 42.00)"));
        assert!(text.contains("✗ checks: rate>0.99 (observed 0.50)"));
        assert!(text.contains("✗ http_req_failed: rate<0.01 (metric `http_req_failed` has no samples)"));
        assert!(text.contains("status is 200 (1 passed, 1 failed)"));
        assert!(text.contains("elapsed 30s, peak 10 VUs, 3 iterations"));
    }

    #[test]
    fn json_skips_the_raw_snapshot() {
        let v = verdict(vec![outcome(CHECKS, "rate>0.4", true, Some(0.5))], false);
        assert!(v.snapshot().get(ITERATIONS).is_some());

        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["elapsed"], "30s");
        assert_eq!(json["thresholds"][0]["observed"], 0.5);
        assert_eq!(json["metrics"][ITERATIONS]["kind"], "counter");
        assert!(json.get("snapshot").is_none());

        let back: Verdict = serde_json::from_value(json).unwrap();
        assert_eq!(back.thresholds(), v.thresholds());
        assert!(back.snapshot().is_empty());
    }

    #[tokio::test]
    async fn json_reporter_writes_file() {
        let path = std::env::temp_dir().join(format!("stampede-verdict-{}.json", std::process::id()));
        let v = verdict(vec![], false);
        JsonReporter::to_file(&path).report(&v).await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        let back: Verdict = serde_json::from_str(&written).unwrap();
        assert_eq!(back.peak_vus(), 10);
        let _ = tokio::fs::remove_file(&path).await;
    }
}
