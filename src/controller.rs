//! Run Controller: validate, execute, evaluate.
//!
//! [`Run`] ties a [`RunConfig`] to a [`Scenario`] and produces a [`Verdict`]:
//!
//! 1. The configuration is validated. Any [`ConfigError`](crate::error::ConfigError)
//!    aborts here, before a single virtual user exists.
//! 2. The executor drives virtual users through the stages, every sample landing
//!    in the run's [`MetricSink`].
//! 3. Once every virtual user is joined the sink is snapshotted, thresholds are
//!    evaluated against the snapshot and the verdict is assembled.
//!
//! Cancelling through a [`CancelHandle`] or [`Run::execute_until`] skips the rest of
//! the schedule but not step 3: what was collected so far is still judged.

use std::future::Future;

use tokio::sync::watch;

use crate::{
    config::RunConfig,
    error::{Error, Result},
    executor::Executor,
    report::Verdict,
    scenario::{Scenario, ScenarioResult, VuContext},
    sink::MetricSink,
    threshold,
};

/// Cancels the execution in progress on the run it was taken from. Cheap to clone;
/// cancelling twice is harmless. The next execution starts uncancelled.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if !self.tx.send_replace(true) {
            tracing::info!("Cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// One configured load test.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use stampede::{Run, RunConfig, Scenario, Stage, VuContext};
///
/// # async fn demo() -> stampede::Result<()> {
/// let config = RunConfig::new(vec![Stage::new(Duration::from_secs(30), 10)])
///     .with_threshold("iteration_duration", "p(95)<500");
/// let scenario = Scenario::builder()
///     .name("noop")
///     .action(|_ctx: VuContext| async { Ok(()) })
///     .build();
///
/// let verdict = Run::new(config, scenario).execute().await?;
/// std::process::exit(verdict.exit_code());
/// # }
/// ```
pub struct Run<F, Fut>
where
    F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send + 'static,
{
    config: RunConfig,
    scenario: Scenario<F, Fut>,
    sink: MetricSink,
    cancel: watch::Sender<bool>,
}

impl<F, Fut> Run<F, Fut>
where
    F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send + 'static,
{
    pub fn new(config: RunConfig, scenario: Scenario<F, Fut>) -> Self {
        Self::with_sink(config, scenario, MetricSink::new())
    }

    /// Use an existing sink, e.g. to watch metrics while the run is in progress.
    pub fn with_sink(config: RunConfig, scenario: Scenario<F, Fut>, sink: MetricSink) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            config,
            scenario,
            sink,
            cancel,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn sink(&self) -> &MetricSink {
        &self.sink
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel.clone(),
        }
    }

    /// Run the configured stages to completion (or cancellation).
    pub async fn execute(&self) -> Result<Verdict> {
        let executor = self.config.executor();
        self.execute_with(&executor).await
    }

    /// Run with a custom executor. Thresholds and metric declarations still come
    /// from the configuration, and the configuration is still validated as a whole.
    ///
    /// A `Run` can be executed more than once. Every execution starts uncancelled,
    /// so a [`CancelHandle`] only affects the execution in progress. Samples keep
    /// accumulating in the same sink across executions.
    pub async fn execute_with<E>(&self, executor: &E) -> Result<Verdict>
    where
        E: Executor<F, Fut>,
        E::Error: Into<Error>,
    {
        let thresholds = self.config.validate()?;
        self.cancel.send_replace(false);
        for (name, kind) in self.config.catalog()?.iter() {
            self.sink.declare(name, kind);
        }

        tracing::info!(
            scenario = %self.scenario.name,
            stages = self.config.stages.len(),
            thresholds = thresholds.len(),
            "Starting run"
        );
        let execution = executor
            .exec(&self.scenario, &self.sink, self.cancel.subscribe())
            .await
            .map_err(Into::<Error>::into)?;

        let snapshot = self.sink.snapshot();
        let outcomes = threshold::evaluate(&thresholds, &snapshot);
        for outcome in outcomes.iter().filter(|o| !o.passed) {
            tracing::warn!(
                metric = %outcome.metric,
                expression = %outcome.expression,
                observed = ?outcome.observed,
                "Threshold failed"
            );
        }

        let verdict = Verdict::new(self.scenario.name.clone(), execution, outcomes, snapshot);
        tracing::info!(
            passed = verdict.passed(),
            cancelled = verdict.cancelled(),
            iterations = verdict.iterations(),
            "Run finished"
        );
        Ok(verdict)
    }

    /// Like [`Run::execute`], cancelling the run as soon as `signal` resolves.
    ///
    /// ```rust,ignore
    /// let verdict = run.execute_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
    /// ```
    pub async fn execute_until<S>(&self, signal: S) -> Result<Verdict>
    where
        S: Future<Output = ()>,
    {
        let run = self.execute();
        tokio::pin!(run);
        tokio::select! {
            verdict = &mut run => verdict,
            _ = signal => {
                self.cancel_handle().cancel();
                run.await
            }
        }
    }
}
