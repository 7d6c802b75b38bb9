use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::{
    error::BoxError,
    executor::RunResult,
    registry::MetricSnapshot,
    threshold::{ThresholdResult, ThresholdSet},
};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report to {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("report sink failed: {0}")]
    Sink(#[source] BoxError),
}

/// End-of-run view of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricSummary {
    Counter {
        count: f64,
        /// Per second of run time.
        rate: f64,
    },
    Rate {
        rate: Option<f64>,
        passes: u64,
        fails: u64,
    },
    Trend {
        count: usize,
        avg: Option<f64>,
        min: Option<f64>,
        med: Option<f64>,
        max: Option<f64>,
        p90: Option<f64>,
        p95: Option<f64>,
    },
}

impl MetricSummary {
    fn from_snapshot(metric: &MetricSnapshot, elapsed: Duration) -> Self {
        match metric {
            MetricSnapshot::Counter(c) => {
                let secs = elapsed.as_secs_f64();
                MetricSummary::Counter {
                    count: c.sum,
                    rate: if secs > 0.0 { c.sum / secs } else { 0.0 },
                }
            }
            MetricSnapshot::Rate(r) => MetricSummary::Rate {
                rate: r.fraction(),
                passes: r.trues,
                fails: r.falses(),
            },
            MetricSnapshot::Trend(t) => MetricSummary::Trend {
                count: t.len(),
                avg: t.avg(),
                min: t.min(),
                med: t.median(),
                max: t.max(),
                p90: t.percentile(90.0),
                p95: t.percentile(95.0),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

impl CheckSummary {
    pub fn rate(&self) -> Option<f64> {
        let total = self.passes + self.fails;
        (total > 0).then(|| self.passes as f64 / total as f64)
    }
}

/// Everything there is to know about a finished run. Built once, then handed to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub scenario: String,
    pub duration_ms: f64,
    pub peak_vus: usize,
    pub aborted: bool,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub checks: Vec<CheckSummary>,
    pub thresholds: Vec<ThresholdResult>,
    /// `true` when every threshold passed. A run without thresholds passes.
    pub passed: bool,
}

impl RunSummary {
    pub fn assemble(scenario: &str, result: &RunResult, thresholds: &ThresholdSet) -> Self {
        let metrics = result
            .snapshot
            .metrics
            .iter()
            .map(|(name, metric)| {
                (
                    name.clone(),
                    MetricSummary::from_snapshot(metric, result.elapsed),
                )
            })
            .collect();
        let checks = result
            .snapshot
            .checks
            .iter()
            .map(|(name, tally)| CheckSummary {
                name: name.clone(),
                passes: tally.passes,
                fails: tally.fails,
            })
            .collect();
        let thresholds = thresholds.evaluate(&result.snapshot, result.elapsed);
        let passed = thresholds.iter().all(ThresholdResult::passed);

        Self {
            scenario: scenario.to_owned(),
            duration_ms: result.elapsed.as_secs_f64() * 1000.0,
            peak_vus: result.peak_vus,
            aborted: result.aborted,
            metrics,
            checks,
            thresholds,
            passed,
        }
    }
}

fn mark(passed: bool) -> char {
    if passed { '✓' } else { '✗' }
}

struct Opt(Option<f64>);

impl fmt::Display for Opt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{v:.2}"),
            None => f.write_str("-"),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "scenario: {} ({:.1}s, peak {} VUs{})",
            self.scenario,
            self.duration_ms / 1000.0,
            self.peak_vus,
            if self.aborted { ", aborted" } else { "" }
        )?;

        if !self.checks.is_empty() {
            writeln!(f, "\nchecks")?;
            for check in &self.checks {
                writeln!(
                    f,
                    "  {} {:<40} {:>7}  ✓ {} ✗ {}",
                    mark(check.fails == 0),
                    check.name,
                    check
                        .rate()
                        .map_or_else(|| "-".to_owned(), |r| format!("{:.2}%", r * 100.0)),
                    check.passes,
                    check.fails
                )?;
            }
        }

        writeln!(f, "\nmetrics")?;
        let width = self.metrics.keys().map(String::len).max().unwrap_or(0) + 2;
        for (name, metric) in &self.metrics {
            write!(f, "  {:.<width$}: ", name)?;
            match metric {
                MetricSummary::Counter { count, rate } => {
                    writeln!(f, "{count} {rate:.2}/s")?;
                }
                MetricSummary::Rate { rate, passes, fails } => {
                    writeln!(
                        f,
                        "{} ✓ {passes} ✗ {fails}",
                        rate.map_or_else(|| "-".to_owned(), |r| format!("{:.2}%", r * 100.0))
                    )?;
                }
                MetricSummary::Trend {
                    avg,
                    min,
                    med,
                    max,
                    p90,
                    p95,
                    ..
                } => {
                    writeln!(
                        f,
                        "avg={} min={} med={} max={} p(90)={} p(95)={}",
                        Opt(*avg),
                        Opt(*min),
                        Opt(*med),
                        Opt(*max),
                        Opt(*p90),
                        Opt(*p95)
                    )?;
                }
            }
        }

        if !self.thresholds.is_empty() {
            writeln!(f, "\nthresholds")?;
            for t in &self.thresholds {
                writeln!(
                    f,
                    "  {} {} {}: {}",
                    mark(t.passed()),
                    t.metric,
                    t.expression,
                    t.verdict
                )?;
            }
        }

        write!(
            f,
            "\nresult: {}",
            if self.passed { "PASSED" } else { "FAILED" }
        )
    }
}

/// A [`Reporter`] consumes a [`RunSummary`] and performs side effects: printing it,
/// writing it to a file, or sending it to a service.
///
/// Reporters are the I/O boundary of the crate. The summary itself is plain data, so
/// the same run can feed any number of sinks, see [`handoff`].
///
/// # Example
/// ```rust
/// use async_trait::async_trait;
/// use stampede::report::{ReportError, Reporter, RunSummary};
///
/// struct Verdict;
///
/// #[async_trait]
/// impl Reporter for Verdict {
///     async fn report(&self, summary: &RunSummary) -> Result<(), ReportError> {
///         println!("{} passed: {}", summary.scenario, summary.passed);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, summary: &RunSummary) -> Result<(), ReportError>;
}

/// Hand the summary to every sink. A failing sink does not prevent the others from
/// running; the first error is returned once all of them had their turn.
pub async fn handoff(summary: &RunSummary, sinks: &[&dyn Reporter]) -> Result<(), ReportError> {
    let mut first = None;
    for sink in sinks {
        if let Err(e) = sink.report(summary).await {
            tracing::error!("Report sink failed: {e}");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Prints the plain-text summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutReporter;

#[async_trait]
impl Reporter for StdoutReporter {
    async fn report(&self, summary: &RunSummary) -> Result<(), ReportError> {
        println!("{summary}");
        Ok(())
    }
}

/// Writes the summary as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonReporter {
    path: PathBuf,
}

impl JsonReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn report(&self, summary: &RunSummary) -> Result<(), ReportError> {
        let json = serde_json::to_vec_pretty(summary)?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|source| ReportError::Io {
                path: self.path.clone(),
                source,
            })?;
        tracing::info!("Summary written to {}", self.path.display());
        Ok(())
    }
}
