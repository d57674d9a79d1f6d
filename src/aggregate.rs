use std::fmt::Debug;

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::metric::MetricKind;

/// The `Aggregate` trait defines how raw sample values are folded into a compact
/// representation that preserves the information necessary for later analysis.
///
/// **Important:** aggregates do not compute final statistics such as averages or
/// percentiles eagerly. They store raw data (counts, sums, histograms) and answer
/// queries on demand once the run is over. Folding must not depend on sample
/// order: samples from different virtual users arrive interleaved arbitrarily.
///
/// `consume` sits on the hot path of every virtual user and should not allocate.
pub trait Aggregate
where
    Self: Send + Sync + Debug + Clone,
{
    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Incorporate a single sample value into the aggregate.
    fn consume(&mut self, value: f64);

    /// Number of samples consumed so far.
    fn count(&self) -> u64;
}

/// Sums every sample.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterAggregate {
    pub count: u64,
    pub total: f64,
}

impl Aggregate for CounterAggregate {
    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: f64) {
        self.count += 1;
        self.total += value;
    }

    fn count(&self) -> u64 {
        self.count
    }
}

/// Counts how many samples were non-zero out of all samples.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RateAggregate {
    pub passes: u64,
    pub total: u64,
}

impl RateAggregate {
    /// Fraction of non-zero samples, `None` before the first sample.
    pub fn rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.passes as f64 / self.total as f64)
    }

    pub fn fails(&self) -> u64 {
        self.total - self.passes
    }
}

impl Aggregate for RateAggregate {
    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: f64) {
        self.total += 1;
        if value != 0.0 {
            self.passes += 1;
        }
    }

    fn count(&self) -> u64 {
        self.total
    }
}

/// Highest trackable value before the histogram starts resizing: one hour in µs.
const TREND_HIGHEST_MICROS: u64 = 3_600_000_000;
const TREND_SIGFIGS: u8 = 3;

/// Distribution of millisecond values.
///
/// Values are stored in an HdrHistogram with microsecond resolution and three
/// significant digits, so percentile answers are accurate to 0.1% of the value.
/// `min`, `max` and `sum` are tracked exactly alongside the histogram.
#[derive(Clone, Debug)]
pub struct TrendAggregate {
    histogram: Histogram<u64>,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendAggregate {
    pub fn min(&self) -> Option<f64> {
        (!self.histogram.is_empty()).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (!self.histogram.is_empty()).then_some(self.max)
    }

    pub fn avg(&self) -> Option<f64> {
        (!self.histogram.is_empty()).then(|| self.sum / self.histogram.len() as f64)
    }

    /// Value at percentile `p` (0..=100) in milliseconds.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.histogram.is_empty() {
            return None;
        }
        let q = (p / 100.0).clamp(0.0, 1.0);
        let micros = self.histogram.value_at_quantile(q);
        // Never report a value outside of what was actually observed
        Some((micros as f64 / 1000.0).clamp(self.min, self.max))
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.0)
    }
}

impl Aggregate for TrendAggregate {
    fn new() -> Self {
        let mut histogram = Histogram::new_with_bounds(1, TREND_HIGHEST_MICROS, TREND_SIGFIGS)
            .expect("static histogram bounds are valid");
        histogram.auto(true);
        Self {
            histogram,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn consume(&mut self, value: f64) {
        let value = value.max(0.0);
        let micros = (value * 1000.0).round() as u64;
        self.histogram.saturating_record(micros);
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn count(&self) -> u64 {
        self.histogram.len()
    }
}

/// Aggregate for one metric name, picked by the metric's kind.
#[derive(Clone, Debug)]
pub enum MetricAggregate {
    Counter(CounterAggregate),
    Rate(RateAggregate),
    Trend(TrendAggregate),
}

impl MetricAggregate {
    pub fn for_kind(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(CounterAggregate::new()),
            MetricKind::Rate => Self::Rate(RateAggregate::new()),
            MetricKind::Trend => Self::Trend(TrendAggregate::new()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Rate(_) => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    pub fn consume(&mut self, value: f64) {
        match self {
            Self::Counter(a) => a.consume(value),
            Self::Rate(a) => a.consume(value),
            Self::Trend(a) => a.consume(value),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            Self::Counter(a) => a.count(),
            Self::Rate(a) => a.count(),
            Self::Trend(a) => a.count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        // one sample of slack on top of the histogram precision
        (a - b).abs() <= 1.1
    }

    mod counter {
        use super::*;

        #[test]
        fn sums_values() {
            let mut c = CounterAggregate::new();
            [1.0, 2.0, 3.0].into_iter().for_each(|v| c.consume(v));
            assert_eq!(c.count, 3);
            assert_eq!(c.total, 6.0);
        }
    }

    mod rate {
        use super::*;

        #[test]
        fn empty_rate_is_none() {
            assert_eq!(RateAggregate::new().rate(), None);
        }

        #[test]
        fn fraction_of_non_zero() {
            let mut r = RateAggregate::new();
            [1.0, 0.0, 1.0, 1.0].into_iter().for_each(|v| r.consume(v));
            assert_eq!(r.rate(), Some(0.75));
            assert_eq!(r.fails(), 1);
        }
    }

    mod trend {
        use super::*;

        #[test]
        fn empty_trend_answers_none() {
            let t = TrendAggregate::new();
            assert_eq!(t.percentile(95.0), None);
            assert_eq!(t.avg(), None);
            assert_eq!(t.min(), None);
        }

        #[test]
        fn percentiles_over_uniform_values() {
            let mut t = TrendAggregate::new();
            for ms in 1..=100 {
                t.consume(ms as f64);
            }
            assert_eq!(t.count(), 100);
            assert!(close(t.percentile(50.0).unwrap(), 50.0));
            assert!(close(t.percentile(95.0).unwrap(), 95.0));
            assert!(close(t.percentile(99.0).unwrap(), 99.0));
            assert_eq!(t.min(), Some(1.0));
            assert_eq!(t.max(), Some(100.0));
            assert_eq!(t.avg(), Some(50.5));
        }

        #[test]
        fn percentile_never_leaves_observed_range() {
            let mut t = TrendAggregate::new();
            t.consume(100.0);
            assert_eq!(t.percentile(100.0), Some(100.0));
            assert_eq!(t.percentile(0.0), Some(100.0));
        }

        #[test]
        fn order_does_not_matter() {
            let mut ascending = TrendAggregate::new();
            let mut descending = TrendAggregate::new();
            for ms in 1..=200 {
                ascending.consume(ms as f64);
                descending.consume((201 - ms) as f64);
            }
            assert_eq!(ascending.count(), descending.count());
            assert_eq!(ascending.percentile(95.0), descending.percentile(95.0));
            assert_eq!(ascending.avg(), descending.avg());
        }
    }

    #[test]
    fn metric_aggregate_follows_kind() {
        for kind in [MetricKind::Counter, MetricKind::Rate, MetricKind::Trend] {
            let mut a = MetricAggregate::for_kind(kind);
            assert_eq!(a.kind(), kind);
            a.consume(1.0);
            assert_eq!(a.count(), 1);
        }
    }
}
