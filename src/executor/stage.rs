//! The `StageExecutor` and its components, providing a stage-based
//! virtual-user scheduler.
//!
//! Each [`Stage`] defines a target number of concurrent virtual users (VUs) and a
//! duration over which the scheduler moves from the previous stage's target (zero
//! before the first stage) to this one.
//!
//! # High-level flow
//! 1. The stages are validated; a malformed schedule fails before anything runs.
//! 2. A logical clock starts at zero. On every `tick` the scheduler computes the
//!    desired VU count for the current instant and scales the [`VuPool`] to it:
//!    - desired < active: the most recently spawned VUs are told to retire. They
//!      finish their current iteration and stop; nothing is aborted mid-request.
//!    - desired > running: new VUs are spawned, each starting a fresh iteration
//!      loop. Retired VUs still finishing an iteration count as running, so the
//!      number of live VUs never exceeds the desired count.
//! 3. When the last stage ends (or the run is cancelled) every remaining VU is
//!    retired and the scheduler waits for all of them before returning.
//!
//! # Ramp behaviour
//! With [`RampPolicy::Linear`] the desired count at `elapsed` into a stage is
//!
//! ```text
//! t = elapsed / duration
//! vus(t) = round(from + (to - from) * t), clamped to [min(from, to), max(from, to)]
//! ```
//!
//! so a flat stage (`from == to`) holds the count and the desired count can never
//! exceed the largest target in the schedule. [`RampPolicy::Immediate`] jumps to
//! the stage target on the stage's first tick.
//!
//! # Tuning knobs
//! - `tick`: granularity of scheduling decisions (default 1s). Smaller ticks give
//!   smoother ramps at the cost of more wakeups.
//! - `max_vus`: hard cap on simultaneously active VUs regardless of targets.
use tokio::sync::watch::{self, Receiver};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use super::{Execution, Executor};
use crate::{
    error::ConfigError,
    runner::{signalled, VirtualUser},
    scenario::{Scenario, ScenarioResult, VuContext},
    sink::MetricSink,
};
use internals::*;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::{future::Future, marker::PhantomData, sync::Arc, time::Duration};

/// Default scheduling granularity.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// A stage defines a target VU count and how long to ramp to that target.
///
/// Use `Stage::new(Duration::from_secs(30), 10)` to ramp to 10 VUs over 30s.
/// Durations must be strictly positive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Concurrent virtual users at the end of the stage
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// How the desired VU count moves between two stage targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampPolicy {
    #[default]
    Linear,
    Immediate,
}

/// Executor that ramps concurrent virtual users through stages.
#[derive(Clone, Debug, TypedBuilder)]
pub struct StageExecutor {
    /// The sequence of stages to execute.
    pub stages: Vec<Stage>,
    /// The granularity of scheduling decisions.
    #[builder(default = DEFAULT_TICK)]
    pub tick: Duration,
    #[builder(default)]
    pub ramp: RampPolicy,
    /// Upper bound on simultaneously active virtual users.
    #[builder(default, setter(strip_option))]
    pub max_vus: Option<usize>,
}

impl StageExecutor {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_stages(&self.stages)?;
        if self.tick.is_zero() {
            return Err(ConfigError::InvalidTick(self.tick));
        }
        if self.max_vus == Some(0) {
            return Err(ConfigError::InvalidMaxVus);
        }
        Ok(())
    }

    /// Largest number of VUs this schedule will ever ask for.
    pub fn peak_target(&self) -> usize {
        let peak = self.stages.iter().map(|s| s.target).max().unwrap_or(0);
        self.max_vus.map_or(peak, |m| peak.min(m))
    }

    /// Total length of the schedule.
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    fn cap(&self, desired: usize) -> usize {
        self.max_vus.map_or(desired, |m| desired.min(m))
    }
}

pub(crate) fn validate_stages(stages: &[Stage]) -> Result<(), ConfigError> {
    if stages.is_empty() {
        return Err(ConfigError::NoStages);
    }
    if let Some(index) = stages.iter().position(|s| s.duration.is_zero()) {
        return Err(ConfigError::ZeroStageDuration { index });
    }
    Ok(())
}

impl<F, Fut> Executor<F, Fut> for StageExecutor
where
    Self: Send + Sync + Sized,
    F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send + 'static,
{
    type Error = ConfigError;

    async fn exec(
        &self,
        scenario: &Scenario<F, Fut>,
        sink: &MetricSink,
        mut cancel: Receiver<bool>,
    ) -> Result<Execution, Self::Error> {
        self.validate()?;

        let mut pool = VuPool::new(scenario, sink.clone(), cancel.clone());
        let run_start = Instant::now();
        let mut previous = 0;
        let mut cancelled = false;

        let j = self.stages.len();
        'stages: for (i, stage) in self.stages.iter().enumerate() {
            tracing::info!("Starting stage: {}/{j} (target {} VUs)", i + 1, stage.target);
            let stage_start = Instant::now();
            let stage_end = stage_start + stage.duration;
            let mut next_tick = stage_start;

            loop {
                if *cancel.borrow() {
                    cancelled = true;
                    break 'stages;
                }
                let elapsed = Instant::now().duration_since(stage_start);
                if elapsed >= stage.duration {
                    break;
                }

                let desired = desired_vus(elapsed, stage.duration, previous, stage.target, self.ramp);
                pool.scale_to(self.cap(desired));

                next_tick += self.tick;
                tokio::select! {
                    _ = tokio::time::sleep_until(next_tick.min(stage_end)) => {}
                    _ = signalled(&mut cancel) => {
                        cancelled = true;
                        break 'stages;
                    }
                }
            }
            // The next stage ramps from exactly this target
            previous = stage.target;
            tracing::info!("Finishing stage: {}/{j}", i + 1);
        }

        if cancelled {
            tracing::warn!(
                "Scenario {} cancelled, draining {} VUs...",
                scenario.name,
                pool.running()
            );
        } else {
            tracing::info!("Schedule complete, draining {} VUs...", pool.running());
        }
        let peak_vus = pool.peak();
        let iterations = pool.drain().await;

        tracing::info!("Done running scenario: {}!", scenario.name);
        Ok(Execution {
            elapsed: run_start.elapsed(),
            peak_vus,
            iterations,
            cancelled,
        })
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Internal components for the `StageExecutor`.
/// Encapsulated in a module to allow conditional exposure via `#[cfg(feature = "internals")]`.
mod internals {
    use super::*;

    /// Pure function computing how many VUs should be active `elapsed` into a
    /// stage ramping from `from` to `to` over `duration`.
    pub fn desired_vus(
        elapsed: Duration,
        duration: Duration,
        from: usize,
        to: usize,
        ramp: RampPolicy,
    ) -> usize {
        if ramp == RampPolicy::Immediate || duration.is_zero() {
            return to;
        }
        // Interpolation factor [0.0..1.0]
        let t = (elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0);
        let vus = from as f64 + (to as f64 - from as f64) * t;
        (vus.round() as usize).clamp(from.min(to), from.max(to))
    }

    struct ActiveVu {
        id: usize,
        retire: watch::Sender<bool>,
        handle: JoinHandle<u64>,
    }

    /// The set of running virtual users of one scenario.
    ///
    /// Active VUs are kept in spawn order; scaling down retires from the back so
    /// the longest running VUs are the last to go. A retired VU keeps running until
    /// its current iteration ends and still occupies a slot until then, so the
    /// number of running VUs never exceeds the last `desired` count.
    pub struct VuPool<F, Fut>
    where
        F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ScenarioResult> + Send + 'static,
    {
        scenario: Arc<str>,
        action: F,
        pause: Option<Duration>,
        sink: MetricSink,
        cancel: Receiver<bool>,
        active: Vec<ActiveVu>,
        retiring: Vec<JoinHandle<u64>>,
        stopped: Vec<JoinHandle<u64>>,
        next_id: usize,
        peak: usize,
        output: PhantomData<fn() -> Fut>,
    }

    impl<F, Fut> VuPool<F, Fut>
    where
        F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ScenarioResult> + Send + 'static,
    {
        pub fn new(scenario: &Scenario<F, Fut>, sink: MetricSink, cancel: Receiver<bool>) -> Self {
            Self {
                scenario: Arc::from(scenario.name.as_str()),
                action: scenario.action.clone(),
                pause: scenario.pause,
                sink,
                cancel,
                active: Vec::new(),
                retiring: Vec::new(),
                stopped: Vec::new(),
                next_id: 0,
                peak: 0,
                output: PhantomData,
            }
        }

        /// Active VUs plus retired ones still finishing their iteration.
        pub fn running(&self) -> usize {
            self.active.len() + self.retiring.len()
        }

        /// Highest number of simultaneously running VUs seen so far.
        pub fn peak(&self) -> usize {
            self.peak
        }

        /// Retire or spawn VUs so that at most `desired` are running.
        ///
        /// Retired VUs that have not stopped yet count against `desired`; their
        /// slots are refilled on a later call once they are gone.
        pub fn scale_to(&mut self, desired: usize) {
            self.reap();
            let before = self.running();
            while self.active.len() > desired {
                if let Some(vu) = self.active.pop() {
                    tracing::debug!("Retiring VU {}.", vu.id);
                    vu.retire.send_replace(true);
                    self.retiring.push(vu.handle);
                }
            }
            while self.running() < desired {
                self.spawn();
            }
            let after = self.running();
            if before != after {
                tracing::debug!("Scaled VUs {before} -> {after} (desired {desired})");
            }
            self.peak = self.peak.max(after);
        }

        /// Move retired VUs whose task has ended out of the running set.
        fn reap(&mut self) {
            let (stopped, retiring): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retiring)
                .into_iter()
                .partition(|handle| handle.is_finished());
            self.retiring = retiring;
            self.stopped.extend(stopped);
        }

        fn spawn(&mut self) {
            let id = self.next_id;
            self.next_id += 1;
            let (retire, retire_rx) = watch::channel(false);
            let vu = VirtualUser::new(
                id,
                Arc::clone(&self.scenario),
                self.action.clone(),
                self.pause,
                self.sink.clone(),
            );
            let handle = tokio::spawn(vu.run(retire_rx, self.cancel.clone()));
            self.active.push(ActiveVu { id, retire, handle });
        }

        /// Retire every VU and wait for all of them. Returns the total number of
        /// iterations they completed.
        pub async fn drain(mut self) -> u64 {
            self.scale_to(0);
            self.stopped.append(&mut self.retiring);
            join_all(self.stopped)
                .await
                .into_iter()
                .map(|res| match res {
                    Ok(iterations) => iterations,
                    Err(e) => {
                        // instead of failing the run, lose only this VU's count
                        tracing::error!("VU task failed: {e}");
                        0
                    }
                })
                .sum()
        }
    }
}
