use std::{future::Future, marker::PhantomData, sync::Arc, time::Duration};

use parking_lot::Mutex;
use typed_builder::TypedBuilder;

use crate::{error::BoxError, metric::Sample, sink::MetricSink};

/// What a scenario action resolves to. Returning `Err` marks the iteration as
/// faulted; it is recorded as a failed check and the virtual user carries on.
pub type ScenarioResult = Result<(), BoxError>;

/// The unit of work a virtual user repeats.
///
/// The action is called exactly once per iteration with a fresh [`VuContext`].
/// Heavy objects such as HTTP clients must be created outside of it and cloned
/// in, otherwise every iteration pays for them.
///
/// ```rust
/// use std::time::Duration;
/// use stampede::{Scenario, VuContext};
///
/// let scenario = Scenario::builder()
///     .name("query")
///     .action(|ctx: VuContext| async move {
///         ctx.check("always true", true);
///         ctx.sleep(Duration::from_secs(1));
///         Ok(())
///     })
///     .build();
/// assert_eq!(scenario.name, "query");
/// ```
#[derive(TypedBuilder)]
pub struct Scenario<F, Fut>
where
    F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send,
{
    #[builder(setter(into))]
    pub name: String,
    pub action: F,
    /// Pause between iterations when the iteration did not ask for one itself.
    #[builder(default, setter(strip_option))]
    pub pause: Option<Duration>,
    #[builder(default, setter(skip))]
    output: PhantomData<fn() -> Fut>,
}

/// Per-iteration handle given to the scenario action.
///
/// It is the scenario's only window into the run: checks, custom metrics and
/// pause requests all go through it. Every method is safe to call any number of
/// times from anywhere inside the iteration.
#[derive(Clone, Debug)]
pub struct VuContext {
    vu: usize,
    iteration: u64,
    scenario: Arc<str>,
    sink: MetricSink,
    pause: Arc<Mutex<Option<Duration>>>,
}

impl VuContext {
    pub(crate) fn new(vu: usize, iteration: u64, scenario: Arc<str>, sink: MetricSink) -> Self {
        Self {
            vu,
            iteration,
            scenario,
            sink,
            pause: Arc::new(Mutex::new(None)),
        }
    }

    /// Id of the virtual user running this iteration.
    pub fn vu(&self) -> usize {
        self.vu
    }

    /// Zero based iteration number of this virtual user.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// Record a labelled assertion and return `passed` so it can be chained.
    pub fn check(&self, label: &str, passed: bool) -> bool {
        self.sink.check(label, passed);
        passed
    }

    /// Ask for a pause once this iteration is done. Repeated calls add up.
    ///
    /// The pause is taken by the virtual user between iterations and is cut
    /// short if the virtual user is retired or the run is cancelled.
    pub fn sleep(&self, duration: Duration) {
        let mut pause = self.pause.lock();
        *pause = Some(pause.unwrap_or_default() + duration);
    }

    /// Add to a custom counter.
    pub fn add(&self, metric: &str, value: f64) {
        self.sink.add(metric, value);
    }

    /// Record into a custom rate.
    pub fn hit(&self, metric: &str, hit: bool) {
        self.sink.hit(metric, hit);
    }

    /// Record into a custom trend.
    pub fn observe(&self, metric: &str, elapsed: Duration) {
        self.sink.observe(metric, elapsed);
    }

    pub fn record(&self, sample: Sample) {
        self.sink.record(sample);
    }

    pub(crate) fn sink(&self) -> &MetricSink {
        &self.sink
    }

    pub(crate) fn requested_pause(&self) -> Option<Duration> {
        *self.pause.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::CHECKS;

    fn ctx(sink: &MetricSink) -> VuContext {
        VuContext::new(3, 7, Arc::from("scenario"), sink.clone())
    }

    #[test]
    fn check_returns_outcome_and_records() {
        let sink = MetricSink::new();
        let ctx = ctx(&sink);
        assert!(ctx.check("a", true));
        assert!(!ctx.check("a", false));
        assert_eq!(sink.snapshot().get(CHECKS).unwrap().all.count(), 2);
    }

    #[test]
    fn sleeps_add_up() {
        let ctx = ctx(&MetricSink::new());
        assert_eq!(ctx.requested_pause(), None);
        ctx.sleep(Duration::from_millis(300));
        ctx.clone().sleep(Duration::from_millis(700));
        assert_eq!(ctx.requested_pause(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn identity() {
        let ctx = ctx(&MetricSink::new());
        assert_eq!(ctx.vu(), 3);
        assert_eq!(ctx.iteration(), 7);
        assert_eq!(ctx.scenario(), "scenario");
    }
}
