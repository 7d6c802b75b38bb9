//! File-based run options.
//!
//! ```json
//! {
//!   "stages": [
//!     { "duration": "30s", "target": 5 },
//!     { "duration": "1m", "target": 10 },
//!     { "duration": "30s", "target": 0 }
//!   ],
//!   "thresholds": {
//!     "http_req_duration": ["p(95)<2000"],
//!     "errors": ["rate<0.1"]
//!   },
//!   "sleep": "1s"
//! }
//! ```
//!
//! Everything is validated up front by [`RunConfig::executor`] and
//! [`RunConfig::thresholds`], so a bad option never surfaces mid-run.
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::{
    executor::{Ramp, Stage, StageExecutor},
    threshold::{ThresholdError, ThresholdSet},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid duration `{0}` (expected e.g. 500ms, 30s, 1m30s, 2h)")]
    InvalidDuration(String),
    #[error("at least one stage is required")]
    NoStages,
    #[error("tick must be greater than zero")]
    ZeroTick,
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub duration: String,
    pub target: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub stages: Vec<StageConfig>,
    pub thresholds: BTreeMap<String, Vec<String>>,
    pub sleep: String,
    pub tick: String,
    pub graceful_stop: Option<String>,
    pub ramp: Ramp,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            thresholds: BTreeMap::new(),
            sleep: "0s".into(),
            tick: "100ms".into(),
            graceful_stop: None,
            ramp: Ramp::Linear,
        }
    }
}

impl RunConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_owned(),
                source,
            })?;
        Self::from_json_str(&raw)
    }

    pub fn stages(&self) -> Result<Vec<Stage>, ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        self.stages
            .iter()
            .map(|s| Ok(Stage::new(parse_duration(&s.duration)?, s.target)))
            .collect()
    }

    /// Build the executor these options describe.
    pub fn executor(&self) -> Result<StageExecutor, ConfigError> {
        let tick = parse_duration(&self.tick)?;
        if tick.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        let graceful_stop = self
            .graceful_stop
            .as_deref()
            .map(parse_duration)
            .transpose()?;
        Ok(StageExecutor {
            stages: self.stages()?,
            ramp: self.ramp,
            sleep: parse_duration(&self.sleep)?,
            tick,
            graceful_stop,
        })
    }

    pub fn thresholds(&self) -> Result<ThresholdSet, ConfigError> {
        Ok(ThresholdSet::from_map(&self.thresholds)?)
    }
}

/// Parse `500ms`, `30s`, `1.5m`, `2h` and compounds such as `1m30s`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(raw.to_owned());
    let s = raw.trim();
    if s.is_empty() {
        return Err(invalid());
    }

    let mut nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let unit_end = rest[number_end..]
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .map_or(rest.len(), |i| number_end + i);

        let value: f64 = rest[..number_end].parse().map_err(|_| invalid())?;
        let unit = match &rest[number_end..unit_end] {
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        nanos += value * unit;
        rest = &rest[unit_end..];
    }

    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SCRIPT: &str = r#"{
        "stages": [
            { "duration": "30s", "target": 5 },
            { "duration": "1m", "target": 10 },
            { "duration": "2m", "target": 15 },
            { "duration": "1m", "target": 5 },
            { "duration": "30s", "target": 0 }
        ],
        "thresholds": {
            "http_req_duration": ["p(95)<2000"],
            "http_req_failed": ["rate<0.1"],
            "errors": ["rate<0.1"]
        },
        "sleep": "1s"
    }"#;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
        for bad in ["", "30", "s", "10x", "1..5s", "-1s", "ms10"] {
            assert!(
                matches!(parse_duration(bad), Err(ConfigError::InvalidDuration(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn builds_executor_and_thresholds() {
        let config = RunConfig::from_json_str(SCRIPT).unwrap();
        let executor = config.executor().unwrap();
        assert_eq!(executor.stages.len(), 5);
        assert_eq!(executor.stages[2], Stage::new(Duration::from_secs(120), 15));
        assert_eq!(executor.sleep, Duration::from_secs(1));
        assert_eq!(executor.tick, Duration::from_millis(100));
        assert_eq!(executor.ramp, Ramp::Linear);
        assert_eq!(executor.graceful_stop, None);
        assert_eq!(config.thresholds().unwrap().len(), 3);
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(matches!(
            RunConfig::from_json_str(r#"{"stages": [], "retries": 3}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            RunConfig::from_json_str("{}").unwrap().executor(),
            Err(ConfigError::NoStages)
        ));
        let config = RunConfig::from_json_str(
            r#"{"stages": [{"duration": "1s", "target": 1}], "tick": "0ms"}"#,
        )
        .unwrap();
        assert!(matches!(config.executor(), Err(ConfigError::ZeroTick)));
        let config = RunConfig::from_json_str(
            r#"{"stages": [{"duration": "1s", "target": 1}], "thresholds": {"errors": ["rate 0.1"]}}"#,
        )
        .unwrap();
        assert!(matches!(
            config.thresholds(),
            Err(ConfigError::Threshold(ThresholdError::MissingComparator { .. }))
        ));
    }

    #[tokio::test]
    async fn reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SCRIPT.as_bytes()).unwrap();

        let config = RunConfig::from_path(file.path()).await.unwrap();
        assert_eq!(config.stages[0].duration, "30s");
        assert_eq!(config.ramp, Ramp::Linear);

        let missing = RunConfig::from_path(file.path().with_extension("nope")).await;
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
