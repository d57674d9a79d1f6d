//! Run configuration
//!
//! Everything a run needs besides the scenario itself. A [`RunConfig`] can be built
//! in code or deserialized, with durations written the human way:
//!
//! ```json
//! {
//!   "stages": [{ "duration": "30s", "target": 10 }],
//!   "thresholds": {
//!     "http_req_duration": ["p(95)<500"],
//!     "checks": ["rate>0.99"]
//!   },
//!   "metrics": { "cache_hits": "rate" }
//! }
//! ```

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    executor::{RampPolicy, Stage, StageExecutor, DEFAULT_TICK},
    metric::MetricKind,
    threshold::{self, MetricCatalog, Threshold},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub stages: Vec<Stage>,
    /// Metric key to threshold expressions, e.g. `"http_req_duration": ["p(95)<500"]`.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_tick", with = "humantime_serde")]
    pub tick: Duration,
    #[serde(default)]
    pub ramp: RampPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_vus: Option<usize>,
    /// Custom metrics thresholds may refer to.
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricKind>,
}

fn default_tick() -> Duration {
    DEFAULT_TICK
}

impl RunConfig {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            stages,
            thresholds: BTreeMap::new(),
            tick: DEFAULT_TICK,
            ramp: RampPolicy::default(),
            max_vus: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_threshold(mut self, metric: impl Into<String>, expression: impl Into<String>) -> Self {
        self.thresholds
            .entry(metric.into())
            .or_default()
            .push(expression.into());
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, kind: MetricKind) -> Self {
        self.metrics.insert(name.into(), kind);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_ramp(mut self, ramp: RampPolicy) -> Self {
        self.ramp = ramp;
        self
    }

    pub fn with_max_vus(mut self, max_vus: usize) -> Self {
        self.max_vus = Some(max_vus);
        self
    }

    /// Built-in metrics plus the declared custom ones.
    pub fn catalog(&self) -> Result<MetricCatalog, ConfigError> {
        let mut catalog = MetricCatalog::new();
        for (name, kind) in &self.metrics {
            catalog.declare(name, *kind)?;
        }
        Ok(catalog)
    }

    /// Check the whole configuration and return the parsed thresholds.
    pub fn validate(&self) -> Result<Vec<Threshold>, ConfigError> {
        self.executor().validate()?;
        threshold::parse_all(&self.thresholds, &self.catalog()?)
    }

    /// The scheduler this configuration describes.
    pub fn executor(&self) -> StageExecutor {
        StageExecutor {
            stages: self.stages.clone(),
            tick: self.tick,
            ramp: self.ramp,
            max_vus: self.max_vus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{CHECKS, HTTP_REQ_DURATION};

    fn thirty_seconds_of_ten() -> RunConfig {
        RunConfig::new(vec![Stage::new(Duration::from_secs(30), 10)])
    }

    #[test]
    fn deserializes_human_durations() {
        let config: RunConfig = serde_json::from_str(
            r#"{
                "stages": [
                    { "duration": "30s", "target": 10 },
                    { "duration": "1m 30s", "target": 0 }
                ],
                "thresholds": { "http_req_duration": ["p(95)<500"] },
                "tick": "250ms",
                "ramp": "immediate",
                "metrics": { "cache_hits": "rate" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.stages[1].duration, Duration::from_secs(90));
        assert_eq!(config.tick, Duration::from_millis(250));
        assert_eq!(config.ramp, RampPolicy::Immediate);
        assert_eq!(config.max_vus, None);
        assert_eq!(config.metrics.get("cache_hits"), Some(&MetricKind::Rate));
        assert_eq!(config.validate().unwrap().len(), 1);
    }

    #[test]
    fn defaults() {
        let config: RunConfig =
            serde_json::from_str(r#"{ "stages": [{ "duration": "5s", "target": 1 }] }"#).unwrap();
        assert_eq!(config, RunConfig::new(vec![Stage::new(Duration::from_secs(5), 1)]));
        assert_eq!(config.tick, DEFAULT_TICK);
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn builder_style() {
        let config = thirty_seconds_of_ten()
            .with_threshold(HTTP_REQ_DURATION, "p(95)<500")
            .with_threshold(HTTP_REQ_DURATION, "avg<200")
            .with_threshold(CHECKS, "rate>0.99")
            .with_max_vus(4);
        assert_eq!(config.thresholds[HTTP_REQ_DURATION].len(), 2);
        assert_eq!(config.validate().unwrap().len(), 3);
        assert_eq!(config.executor().max_vus, Some(4));
    }

    #[test]
    fn rejects_bad_schedules() {
        assert_eq!(RunConfig::new(vec![]).validate(), Err(ConfigError::NoStages));
        assert_eq!(
            thirty_seconds_of_ten().with_tick(Duration::ZERO).validate(),
            Err(ConfigError::InvalidTick(Duration::ZERO))
        );
        assert_eq!(
            thirty_seconds_of_ten().with_max_vus(0).validate(),
            Err(ConfigError::InvalidMaxVus)
        );
    }

    #[test]
    fn rejects_bad_thresholds() {
        let config = thirty_seconds_of_ten().with_threshold("cache_hits", "rate>0.8");
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownMetric("cache_hits".into()))
        );
        let config = config.with_metric("cache_hits", MetricKind::Rate);
        assert!(config.validate().is_ok());

        let shadowing = thirty_seconds_of_ten().with_metric(CHECKS, MetricKind::Counter);
        assert_eq!(
            shadowing.validate(),
            Err(ConfigError::DuplicateMetric(CHECKS.into()))
        );
    }
}
