//! Executor: orchestration of virtual users over time
//!
//! The `Executor` trait is the runtime that executes a `Scenario`. Different
//! executors provide different scheduling strategies; stampede ships the
//! [`StageExecutor`], which ramps the number of concurrent virtual users through
//! a list of [`Stage`]s.
pub mod stage;
pub use stage::{RampPolicy, Stage, StageExecutor, DEFAULT_TICK};

use crate::{
    scenario::{Scenario, ScenarioResult, VuContext},
    sink::MetricSink,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tokio::sync::watch::Receiver;

/// The runtime hook that executes a `Scenario`.
///
/// An executor owns the virtual users for the duration of [`Executor::exec`]: it
/// spawns them, retires them, and must have joined every one of them before it
/// returns. Samples go straight into `sink`; the executor only reports how the
/// schedule itself went.
///
/// `cancel` flips to `true` when the run should stop early. Executors react by
/// retiring every virtual user gracefully and returning normally with
/// [`Execution::cancelled`] set.
pub trait Executor<F, Fut>
where
    Self: Send + Sync + Sized,
    F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send,
{
    type Error;

    /// Execute the scenario until the schedule completes or `cancel` fires.
    fn exec(
        &self,
        scenario: &Scenario<F, Fut>,
        sink: &MetricSink,
        cancel: Receiver<bool>,
    ) -> impl Future<Output = Result<Execution, Self::Error>> + Send;
}

/// How a schedule went.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    /// Wall time from the first tick until the last virtual user was joined.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Highest number of simultaneously active virtual users.
    pub peak_vus: usize,
    /// Iterations completed across all virtual users.
    pub iterations: u64,
    /// The run was stopped before the schedule finished.
    pub cancelled: bool,
}
