//! stampede: a small virtual-user load-testing orchestrator.
//!
//! A load test is a [`Scenario`] (an async action repeated by every virtual user)
//! plus a [`RunConfig`] (ramp stages and pass/fail thresholds). stampede keeps the
//! k6 vocabulary: stages ramp the number of concurrent virtual users, scenarios
//! assert with checks, and thresholds such as `p(95)<500` decide whether the run
//! passed.
//!
//! # Architecture
//!
//! - [`Scenario`]: the action a virtual user runs once per iteration, with a
//!   [`VuContext`] for checks, custom metrics and pacing.
//! - [`Executor`]: spawns and retires virtual users over time. [`StageExecutor`]
//!   ramps through a list of [`Stage`]s.
//! - [`MetricSink`]: the shared, thread-safe accumulator every sample goes into.
//! - [`Threshold`]: a declarative criterion evaluated once against the final
//!   [`Snapshot`] of the sink.
//! - [`Run`]: validates the configuration, drives the executor and produces the
//!   [`Verdict`].
//! - [`Reporter`]: renders a verdict somewhere (stdout, a JSON file).
//!
//! HTTP clients are collaborators, not part of the core: anything implementing
//! [`HttpClient`] can be wrapped with [`VuContext::http`] to record the built-in
//! `http_*` metrics.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use stampede::{Reporter, Run, RunConfig, Scenario, Stage, StdoutReporter, VuContext};
//!
//! #[tokio::main]
//! async fn main() -> stampede::Result<()> {
//!     let config = RunConfig::new(vec![
//!         Stage::new(Duration::from_secs(10), 10),
//!         Stage::new(Duration::from_secs(30), 10),
//!         Stage::new(Duration::from_secs(10), 0),
//!     ])
//!     .with_threshold("checks", "rate>0.99");
//!
//!     let scenario = Scenario::builder()
//!         .name("noop")
//!         .action(|ctx: VuContext| async move {
//!             ctx.check("it works", true);
//!             ctx.sleep(Duration::from_secs(1));
//!             Ok(())
//!         })
//!         .build();
//!
//!     let run = Run::new(config, scenario);
//!     let verdict = run.execute().await?;
//!     StdoutReporter.report(&verdict).await?;
//!     std::process::exit(verdict.exit_code());
//! }
//! ```
//!
//! # Feature flags
//! - `internals`: enable access to internal (and unstable) scheduler functions
//! - `reqwest`: implement [`HttpClient`] for `reqwest::Client`

/// Metric aggregators
pub mod aggregate;
/// Run configuration
pub mod config;
/// Run orchestration and cancellation
pub mod controller;
pub mod error;
/// Orchestrators that define how virtual users are scheduled
pub mod executor;
/// HTTP collaborator seam
pub mod http;
/// Metric samples and the built-in metric names
pub mod metric;
/// Verdicts and Reporters
pub mod report;
mod runner;
/// The unit of work and its per-iteration context
pub mod scenario;
pub mod sink;
pub mod threshold;

pub use aggregate::Aggregate;
pub use config::RunConfig;
pub use controller::{CancelHandle, Run};
pub use error::{BoxError, ConfigError, Error, Result};
pub use executor::{Execution, Executor, RampPolicy, Stage, StageExecutor};
pub use http::{HttpClient, HttpRequest, HttpResponse, RequestOptions};
pub use metric::{MetricKind, Sample};
pub use report::{JsonReporter, Reporter, StdoutReporter, Verdict};
pub use scenario::{Scenario, ScenarioResult, VuContext};
pub use sink::{MetricSink, Snapshot};
pub use threshold::{Threshold, ThresholdOutcome};
