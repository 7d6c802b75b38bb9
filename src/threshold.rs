//! Declarative pass/fail criteria over aggregated metrics.
//!
//! An expression has the form `AGGREGATOR COMPARATOR LITERAL`, for example `p(95)<2000`
//! or `rate < 0.1`. Expressions are parsed when the threshold set is built, so a typo
//! fails the run before any load is generated.
//!
//! | Metric kind | Aggregators                              |
//! |-------------|------------------------------------------|
//! | Trend       | `p(N)`, `avg`, `med`, `min`, `max`, `count` |
//! | Rate        | `rate` (fraction of true), `count` (samples) |
//! | Counter     | `count` (sum), `rate` (sum per second)   |
//!
//! Evaluation is fail-closed: a threshold only passes with a [`Verdict::Passed`].
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};
use thiserror::Error;

use crate::registry::{MetricSnapshot, RegistrySnapshot};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ThresholdError {
    #[error("threshold on `{metric}`: `{expression}` has no comparator (expected one of <, <=, >, >=, ==)")]
    MissingComparator { metric: String, expression: String },
    #[error("threshold on `{metric}`: unknown aggregator `{aggregator}`")]
    UnknownAggregator { metric: String, aggregator: String },
    #[error("threshold on `{metric}`: percentile `{value}` must be a number between 0 and 100")]
    InvalidPercentile { metric: String, value: String },
    #[error("threshold on `{metric}`: `{literal}` is not a finite number")]
    InvalidLiteral { metric: String, literal: String },
    #[error("threshold metric name must not be empty")]
    EmptyMetricName,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Aggregator {
    Percentile(f64),
    Rate,
    Avg,
    Med,
    Max,
    Min,
    Count,
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregator::Percentile(p) => write!(f, "p({p})"),
            Aggregator::Rate => f.write_str("rate"),
            Aggregator::Avg => f.write_str("avg"),
            Aggregator::Med => f.write_str("med"),
            Aggregator::Max => f.write_str("max"),
            Aggregator::Min => f.write_str("min"),
            Aggregator::Count => f.write_str("count"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Comparator {
    // two-character operators first so `<=` is not read as `<`
    const TOKENS: [(&'static str, Comparator); 5] = [
        ("<=", Comparator::Le),
        (">=", Comparator::Ge),
        ("==", Comparator::Eq),
        ("<", Comparator::Lt),
        (">", Comparator::Gt),
    ];

    pub fn holds(self, actual: f64, expected: f64) -> bool {
        match self {
            Comparator::Lt => actual < expected,
            Comparator::Le => actual <= expected,
            Comparator::Gt => actual > expected,
            Comparator::Ge => actual >= expected,
            Comparator::Eq => (actual - expected).abs() < f64::EPSILON,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed criterion on one metric. Only [`Threshold::parse`] builds one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Threshold {
    pub metric: String,
    pub expression: String,
    pub aggregator: Aggregator,
    pub comparator: Comparator,
    pub value: f64,
}

impl Threshold {
    pub fn parse(metric: impl Into<String>, expression: &str) -> Result<Self, ThresholdError> {
        let metric = metric.into();
        if metric.trim().is_empty() {
            return Err(ThresholdError::EmptyMetricName);
        }
        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();

        let (index, token, comparator) = Comparator::TOKENS
            .iter()
            .filter_map(|(token, cmp)| compact.find(token).map(|i| (i, *token, *cmp)))
            // leftmost match wins, ties go to the longer token listed first
            .min_by_key(|(i, _, _)| *i)
            .ok_or_else(|| ThresholdError::MissingComparator {
                metric: metric.clone(),
                expression: expression.to_owned(),
            })?;

        let aggregator = parse_aggregator(&metric, &compact[..index])?;
        let literal = &compact[index + token.len()..];
        let value = literal
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ThresholdError::InvalidLiteral {
                metric: metric.clone(),
                literal: literal.to_owned(),
            })?;

        Ok(Self {
            metric,
            expression: expression.trim().to_owned(),
            aggregator,
            comparator,
            value,
        })
    }

    pub fn evaluate(&self, snapshot: &RegistrySnapshot, elapsed: Duration) -> Verdict {
        let Some(metric) = snapshot.get(&self.metric) else {
            return Verdict::NoData;
        };
        match self.actual(metric, elapsed) {
            Ok(Some(actual)) if self.comparator.holds(actual, self.value) => {
                Verdict::Passed { actual }
            }
            Ok(Some(actual)) => Verdict::Failed { actual },
            Ok(None) => Verdict::NoData,
            Err(reason) => Verdict::Invalid { reason },
        }
    }

    fn actual(&self, metric: &MetricSnapshot, elapsed: Duration) -> Result<Option<f64>, String> {
        let value = match (metric, self.aggregator) {
            (MetricSnapshot::Trend(t), Aggregator::Percentile(p)) => t.percentile(p),
            (MetricSnapshot::Trend(t), Aggregator::Avg) => t.avg(),
            (MetricSnapshot::Trend(t), Aggregator::Med) => t.median(),
            (MetricSnapshot::Trend(t), Aggregator::Min) => t.min(),
            (MetricSnapshot::Trend(t), Aggregator::Max) => t.max(),
            (MetricSnapshot::Trend(t), Aggregator::Count) => {
                (!t.is_empty()).then(|| t.len() as f64)
            }
            (MetricSnapshot::Rate(r), Aggregator::Rate) => r.fraction(),
            (MetricSnapshot::Rate(r), Aggregator::Count) => {
                (r.total > 0).then(|| r.total as f64)
            }
            (MetricSnapshot::Counter(c), Aggregator::Count) => Some(c.sum),
            (MetricSnapshot::Counter(c), Aggregator::Rate) => {
                let secs = elapsed.as_secs_f64();
                (secs > 0.0).then(|| c.sum / secs)
            }
            (metric, aggregator) => {
                return Err(format!(
                    "`{aggregator}` does not apply to {} metric `{}`",
                    metric.kind(),
                    self.metric
                ));
            }
        };
        Ok(value)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}{}{}",
            self.metric, self.aggregator, self.comparator, self.value
        )
    }
}

fn parse_aggregator(metric: &str, raw: &str) -> Result<Aggregator, ThresholdError> {
    let aggregator = match raw {
        "rate" => Aggregator::Rate,
        "avg" => Aggregator::Avg,
        "med" => Aggregator::Med,
        "max" => Aggregator::Max,
        "min" => Aggregator::Min,
        "count" => Aggregator::Count,
        _ => {
            let Some(inner) = raw.strip_prefix("p(").and_then(|r| r.strip_suffix(')')) else {
                return Err(ThresholdError::UnknownAggregator {
                    metric: metric.to_owned(),
                    aggregator: raw.to_owned(),
                });
            };
            let p = inner
                .parse::<f64>()
                .ok()
                .filter(|p| (0.0..=100.0).contains(p))
                .ok_or_else(|| ThresholdError::InvalidPercentile {
                    metric: metric.to_owned(),
                    value: inner.to_owned(),
                })?;
            Aggregator::Percentile(p)
        }
    };
    Ok(aggregator)
}

/// Outcome of evaluating one threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    Passed { actual: f64 },
    Failed { actual: f64 },
    /// The metric does not exist or holds no samples.
    NoData,
    /// The aggregator cannot be computed for the metric's kind.
    Invalid { reason: String },
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Passed { .. })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Passed { actual } => write!(f, "passed (actual {actual:.2})"),
            Verdict::Failed { actual } => write!(f, "FAILED (actual {actual:.2})"),
            Verdict::NoData => f.write_str("FAILED (no data)"),
            Verdict::Invalid { reason } => write!(f, "FAILED ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub verdict: Verdict,
}

impl ThresholdResult {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }
}

/// Every threshold of a run.
///
/// Deserializes from the same `{metric: [expression, ...]}` map as
/// [`ThresholdSet::from_map`], so every expression goes through [`Threshold::parse`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "BTreeMap<String, Vec<String>>")]
pub struct ThresholdSet {
    thresholds: Vec<Threshold>,
}

impl ThresholdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `{metric: [expression, ...]}` map.
    pub fn from_map<I, M, E, S>(map: I) -> Result<Self, ThresholdError>
    where
        I: IntoIterator<Item = (M, E)>,
        M: Into<String>,
        E: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for (metric, expressions) in map {
            let metric = metric.into();
            for expression in expressions {
                set.push(Threshold::parse(metric.clone(), expression.as_ref())?);
            }
        }
        Ok(set)
    }

    /// Parse and add one expression.
    pub fn with(mut self, metric: &str, expression: &str) -> Result<Self, ThresholdError> {
        self.push(Threshold::parse(metric, expression)?);
        Ok(self)
    }

    pub fn push(&mut self, threshold: Threshold) {
        self.thresholds.push(threshold);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Threshold> {
        self.thresholds.iter()
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn evaluate(&self, snapshot: &RegistrySnapshot, elapsed: Duration) -> Vec<ThresholdResult> {
        self.thresholds
            .iter()
            .map(|t| ThresholdResult {
                metric: t.metric.clone(),
                expression: t.expression.clone(),
                verdict: t.evaluate(snapshot, elapsed),
            })
            .collect()
    }
}

impl From<Vec<Threshold>> for ThresholdSet {
    fn from(thresholds: Vec<Threshold>) -> Self {
        Self { thresholds }
    }
}

impl TryFrom<BTreeMap<String, Vec<String>>> for ThresholdSet {
    type Error = ThresholdError;

    fn try_from(map: BTreeMap<String, Vec<String>>) -> Result<Self, Self::Error> {
        Self::from_map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn registry_with_durations(samples: &[f64]) -> Registry {
        let registry = Registry::new();
        let trend = registry.trend("http_req_duration").unwrap();
        samples.iter().for_each(|s| trend.add(*s));
        registry
    }

    #[test]
    fn parses_all_forms() {
        let t = Threshold::parse("http_req_duration", "p(95)<2000").unwrap();
        assert_eq!(t.aggregator, Aggregator::Percentile(95.0));
        assert_eq!(t.comparator, Comparator::Lt);
        assert_eq!(t.value, 2000.0);

        let t = Threshold::parse("errors", " rate <= 0.1 ").unwrap();
        assert_eq!(
            (t.aggregator, t.comparator, t.value),
            (Aggregator::Rate, Comparator::Le, 0.1)
        );
        assert_eq!(t.expression, "rate <= 0.1");

        for (expr, cmp) in [
            ("avg>1", Comparator::Gt),
            ("med>=1", Comparator::Ge),
            ("count==3", Comparator::Eq),
            ("p(99.9) < 1", Comparator::Lt),
        ] {
            assert_eq!(Threshold::parse("m", expr).unwrap().comparator, cmp);
        }
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(matches!(
            Threshold::parse("m", "p(95) 2000"),
            Err(ThresholdError::MissingComparator { .. })
        ));
        assert!(matches!(
            Threshold::parse("m", "p95<2000"),
            Err(ThresholdError::UnknownAggregator { .. })
        ));
        assert!(matches!(
            Threshold::parse("m", "p(101)<2000"),
            Err(ThresholdError::InvalidPercentile { .. })
        ));
        assert!(matches!(
            Threshold::parse("m", "rate<abc"),
            Err(ThresholdError::InvalidLiteral { .. })
        ));
        assert!(matches!(
            Threshold::parse("m", "rate<inf"),
            Err(ThresholdError::InvalidLiteral { .. })
        ));
        assert_eq!(
            Threshold::parse("", "rate<1"),
            Err(ThresholdError::EmptyMetricName)
        );

        let map = BTreeMap::from([(
            "http_req_duration".to_string(),
            vec!["p(95)<2000".to_string(), "p(95) 2000".to_string()],
        )]);
        assert!(ThresholdSet::try_from(map).is_err());
    }

    #[test]
    fn p95_over_limit_fails() {
        let registry = registry_with_durations(&[100.0, 150.0, 1900.0, 2100.0, 120.0]);
        let set = ThresholdSet::new()
            .with("http_req_duration", "p(95)<2000")
            .unwrap()
            .with("http_req_duration", "med<200")
            .unwrap();

        let results = set.evaluate(&registry.snapshot(), Duration::from_secs(1));
        assert_eq!(results[0].verdict, Verdict::Failed { actual: 2100.0 });
        assert_eq!(results[1].verdict, Verdict::Passed { actual: 150.0 });
    }

    #[test]
    fn rate_thresholds() {
        let registry = Registry::new();
        let errors = registry.rate("errors").unwrap();
        [false, false, false, true].into_iter().for_each(|v| errors.add(v));

        let set = ThresholdSet::new().with("errors", "rate<0.1").unwrap();
        let results = set.evaluate(&registry.snapshot(), Duration::from_secs(1));
        assert_eq!(results[0].verdict, Verdict::Failed { actual: 0.25 });
    }

    #[test]
    fn counter_aggregators() {
        let registry = Registry::new();
        let reqs = registry.counter("http_reqs").unwrap();
        (0..20).for_each(|_| reqs.add(1.0));

        let set = ThresholdSet::new()
            .with("http_reqs", "count==20")
            .unwrap()
            .with("http_reqs", "rate>=2")
            .unwrap();
        let results = set.evaluate(&registry.snapshot(), Duration::from_secs(10));
        assert_eq!(results[0].verdict, Verdict::Passed { actual: 20.0 });
        assert_eq!(results[1].verdict, Verdict::Passed { actual: 2.0 });
    }

    #[test]
    fn missing_and_empty_metrics_have_no_data() {
        let registry = Registry::new();
        registry.rate("errors").unwrap();

        let set = ThresholdSet::new()
            .with("errors", "rate<0.1")
            .unwrap()
            .with("nope", "avg<1")
            .unwrap();
        let results = set.evaluate(&registry.snapshot(), Duration::from_secs(1));
        assert!(results.iter().all(|r| r.verdict == Verdict::NoData));
        assert!(results.iter().all(|r| !r.passed()));
    }

    #[test]
    fn count_of_an_empty_metric_has_no_data() {
        let registry = Registry::new();
        registry.rate("errors").unwrap();
        registry.trend("response_time").unwrap();

        let set = ThresholdSet::new()
            .with("errors", "count<10")
            .unwrap()
            .with("response_time", "count<10")
            .unwrap();
        let results = set.evaluate(&registry.snapshot(), Duration::from_secs(1));
        assert_eq!(results[0].verdict, Verdict::NoData);
        assert_eq!(results[1].verdict, Verdict::NoData);

        registry.rate("errors").unwrap().add(false);
        let results = set.evaluate(&registry.snapshot(), Duration::from_secs(1));
        assert_eq!(results[0].verdict, Verdict::Passed { actual: 1.0 });
    }

    #[test]
    fn deserializing_goes_through_parse() {
        let set: ThresholdSet = serde_json::from_str(
            r#"{"http_req_duration": ["p(95)<2000"], "errors": ["rate<0.1", "count>0"]}"#,
        )
        .unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.iter().any(|t| t.aggregator == Aggregator::Percentile(95.0)));

        let err = serde_json::from_str::<ThresholdSet>(r#"{"http_req_duration": ["p(150)<2000"]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("percentile `150`"), "{err}");

        // parsed fields cannot be supplied directly
        let raw = r#"{"thresholds": [{
            "metric": "http_req_duration",
            "expression": "p(95)",
            "aggregator": {"Percentile": 150.0},
            "comparator": "Lt",
            "value": 1.0
        }]}"#;
        assert!(serde_json::from_str::<ThresholdSet>(raw).is_err());
    }

    #[test]
    fn aggregator_kind_mismatch_is_invalid() {
        let registry = Registry::new();
        registry.rate("errors").unwrap().add(true);
        let set = ThresholdSet::new().with("errors", "p(95)<1").unwrap();
        let results = set.evaluate(&registry.snapshot(), Duration::from_secs(1));
        assert!(matches!(results[0].verdict, Verdict::Invalid { .. }));
    }
}
