//! Error types for stampede
//!
//! Only [`ConfigError`] ever aborts a run. Faults raised by a scenario are absorbed
//! into metrics as [`IterationFault`]s, and a threshold that cannot be evaluated
//! becomes a failed outcome carrying a [`ThresholdEvaluationError`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metric::MetricKind;

/// Boxed error returned by user supplied code (scenario actions, HTTP clients).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Crate error type
#[derive(Error, Debug)]
pub enum Error {
    /// The run configuration was rejected before anything started
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A reporter could not write its output
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A reporter could not serialize the verdict
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Malformed stages or thresholds. Detected before any virtual user is spawned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("at least one stage is required")]
    NoStages,

    #[error("stage {index} has a zero duration")]
    ZeroStageDuration { index: usize },

    #[error("scheduling tick must be positive, got {0:?}")]
    InvalidTick(Duration),

    #[error("max_vus must be at least 1")]
    InvalidMaxVus,

    #[error("invalid threshold `{expression}` on `{metric}`: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("threshold references unknown metric `{0}`")]
    UnknownMetric(String),

    #[error("`{aggregation}` cannot be applied to {kind} metric `{metric}`")]
    IncompatibleAggregation {
        metric: String,
        kind: MetricKind,
        aggregation: String,
    },

    #[error("custom metric `{0}` shadows a built-in metric")]
    DuplicateMetric(String),
}

/// A threshold that could not be evaluated against the final snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "metric", rename_all = "snake_case")]
pub enum ThresholdEvaluationError {
    #[error("metric `{0}` was never recorded")]
    MissingMetric(String),

    #[error("metric `{0}` has no samples")]
    NoSamples(String),

    #[error("metric `{0}` does not support this aggregation")]
    UnsupportedAggregation(String),
}

/// A single scenario iteration that did not complete normally.
#[derive(Error, Debug)]
pub enum IterationFault {
    #[error("scenario returned an error: {0}")]
    Failed(BoxError),

    #[error("scenario panicked: {0}")]
    Panicked(String),
}
