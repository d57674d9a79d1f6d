//! Metric Sink: the only shared mutable state of a run.
//!
//! Every virtual user holds a clone of the same [`MetricSink`] handle and pushes
//! [`Sample`]s into it. Recording is the single contended operation of the whole
//! system, so the lock scope is kept per metric name:
//!
//! 1. A read lock on the bucket index finds the bucket for `sample.name`.
//! 2. The bucket's own mutex is held just long enough to fold the value in.
//!
//! The index write lock is only taken the first time a metric name is seen, so
//! unrelated metrics never serialize each other after warm-up.
//!
//! [`MetricSink::snapshot`] clones every bucket into an immutable [`Snapshot`]
//! which is what thresholds and reports are computed from.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    aggregate::MetricAggregate,
    metric::{MetricKind, Sample, CHECKS},
};

#[derive(Debug)]
struct Bucket {
    all: MetricAggregate,
    tagged: HashMap<String, MetricAggregate>,
}

impl Bucket {
    fn new(kind: MetricKind) -> Self {
        Self {
            all: MetricAggregate::for_kind(kind),
            tagged: HashMap::new(),
        }
    }

    fn consume(&mut self, sample: &Sample) {
        self.all.consume(sample.value);
        if let Some(tag) = &sample.tag {
            match self.tagged.get_mut(tag) {
                Some(agg) => agg.consume(sample.value),
                None => {
                    let mut agg = MetricAggregate::for_kind(sample.kind);
                    agg.consume(sample.value);
                    self.tagged.insert(tag.clone(), agg);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
    recorded: AtomicU64,
    rejected: AtomicU64,
}

/// Thread-safe accumulator of named counters, rates and trends.
///
/// Cloning is cheap and every clone feeds the same buckets.
#[derive(Clone, Debug, Default)]
pub struct MetricSink {
    inner: Arc<Inner>,
}

impl MetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a sample into its metric bucket.
    ///
    /// A sample whose kind disagrees with the kind the metric was first recorded
    /// with is rejected and counted in [`MetricSink::rejected`].
    pub fn record(&self, sample: Sample) {
        let bucket = self.bucket(&sample.name, sample.kind);
        let mut bucket = bucket.lock();
        if bucket.all.kind() != sample.kind {
            drop(bucket);
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                metric = %sample.name,
                kind = %sample.kind,
                "Rejecting sample with mismatched metric kind"
            );
            return;
        }
        bucket.consume(&sample);
        self.inner.recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Register a metric up front so it shows up in snapshots even if nothing is
    /// ever recorded into it. Does nothing if the metric already exists.
    pub fn declare(&self, name: &str, kind: MetricKind) {
        let bucket = self.bucket(name, kind);
        let existing = bucket.lock().all.kind();
        if existing != kind {
            tracing::warn!(metric = %name, %kind, %existing, "Metric already declared with another kind");
        }
    }

    /// Add `value` to a counter.
    pub fn add(&self, name: &str, value: f64) {
        self.record(Sample::counter(name, value));
    }

    /// Record a boolean into a rate metric.
    pub fn hit(&self, name: &str, hit: bool) {
        self.record(Sample::rate(name, hit));
    }

    /// Record a duration into a trend metric.
    pub fn observe(&self, name: &str, elapsed: Duration) {
        self.record(Sample::duration(name, elapsed));
    }

    /// Record a labelled check result into the `checks` rate.
    pub fn check(&self, label: &str, passed: bool) {
        self.record(Sample::rate(CHECKS, passed).with_tag(label));
    }

    /// Total number of samples folded in so far.
    pub fn recorded(&self) -> u64 {
        self.inner.recorded.load(Ordering::Relaxed)
    }

    /// Samples dropped because of a kind mismatch.
    pub fn rejected(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }

    /// Immutable, point-in-time view of every metric.
    pub fn snapshot(&self) -> Snapshot {
        let buckets = self.inner.buckets.read();
        let metrics = buckets
            .iter()
            .map(|(name, bucket)| {
                let bucket = bucket.lock();
                let metric = MetricSnapshot {
                    all: bucket.all.clone(),
                    tagged: bucket
                        .tagged
                        .iter()
                        .map(|(tag, agg)| (tag.clone(), agg.clone()))
                        .collect(),
                };
                (name.clone(), metric)
            })
            .collect();
        Snapshot { metrics }
    }

    fn bucket(&self, name: &str, kind: MetricKind) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.inner.buckets.read().get(name) {
            return Arc::clone(bucket);
        }
        let mut buckets = self.inner.buckets.write();
        // Another virtual user may have created it between the two locks
        Arc::clone(
            buckets
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(kind)))),
        )
    }
}

/// Aggregated state of a single metric at snapshot time.
#[derive(Clone, Debug)]
pub struct MetricSnapshot {
    pub all: MetricAggregate,
    pub tagged: BTreeMap<String, MetricAggregate>,
}

impl MetricSnapshot {
    pub fn kind(&self) -> MetricKind {
        self.all.kind()
    }

    pub fn summary(&self) -> MetricSummary {
        MetricSummary::from(&self.all)
    }
}

/// Immutable aggregated view of a run's metrics.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    metrics: BTreeMap<String, MetricSnapshot>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&MetricSnapshot> {
        self.metrics.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Metric names in lexical order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    pub fn summaries(&self) -> BTreeMap<String, MetricSummary> {
        self.metrics
            .iter()
            .map(|(name, m)| (name.clone(), m.summary()))
            .collect()
    }

    /// Per-label pass/fail tallies of every check.
    pub fn checks(&self) -> Vec<CheckTally> {
        let Some(checks) = self.metrics.get(CHECKS) else {
            return Vec::new();
        };
        checks
            .tagged
            .iter()
            .filter_map(|(label, agg)| match agg {
                MetricAggregate::Rate(rate) => Some(CheckTally {
                    label: label.clone(),
                    passes: rate.passes,
                    fails: rate.fails(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Report-ready statistics derived from an aggregate. Trend values are milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricSummary {
    Counter {
        count: u64,
        total: f64,
    },
    Rate {
        passes: u64,
        fails: u64,
        rate: Option<f64>,
    },
    Trend {
        count: u64,
        min: Option<f64>,
        max: Option<f64>,
        avg: Option<f64>,
        med: Option<f64>,
        p90: Option<f64>,
        p95: Option<f64>,
        p99: Option<f64>,
    },
}

impl From<&MetricAggregate> for MetricSummary {
    fn from(value: &MetricAggregate) -> Self {
        match value {
            MetricAggregate::Counter(c) => Self::Counter {
                count: c.count,
                total: c.total,
            },
            MetricAggregate::Rate(r) => Self::Rate {
                passes: r.passes,
                fails: r.fails(),
                rate: r.rate(),
            },
            MetricAggregate::Trend(t) => Self::Trend {
                count: value.count(),
                min: t.min(),
                max: t.max(),
                avg: t.avg(),
                med: t.median(),
                p90: t.percentile(90.0),
                p95: t.percentile(95.0),
                p99: t.percentile(99.0),
            },
        }
    }
}

/// Outcome counts of one labelled check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTally {
    pub label: String,
    pub passes: u64,
    pub fails: u64,
}
