//! Metric registry: the only state shared between virtual users.
//!
//! A [`Registry`] is a cheap, clonable handle to one run's metrics. Metrics are created
//! once by name and kind, then receive samples from any number of virtual users. Each
//! metric sits behind its own lock, so concurrent records on different metrics never
//! contend and records on the same metric are serialized without losing samples.
//!
//! ```rust
//! use stampede::registry::{MetricKind, Registry};
//!
//! let registry = Registry::new();
//! let errors = registry.rate("errors").unwrap();
//! errors.add(false);
//! errors.add(true);
//!
//! let snapshot = registry.snapshot();
//! let rate = snapshot.get("errors").unwrap().as_rate().unwrap();
//! assert_eq!(rate.fraction(), Some(0.5));
//! assert!(registry.register("errors", MetricKind::Trend).is_err());
//! ```
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use thiserror::Error;

use crate::aggregate::{Aggregate, Counter, Rate, Trend, TrendSnapshot};

/// Names of the metrics every registry starts with.
pub mod builtin {
    /// Counter: completed iterations, failed ones included.
    pub const ITERATIONS: &str = "iterations";
    /// Trend: wall time of each iteration in milliseconds, sleep excluded.
    pub const ITERATION_DURATION: &str = "iteration_duration";
    /// Counter: iterations whose function returned an error or panicked.
    pub const ITERATION_FAILURES: &str = "iteration_failures";
    /// Rate: outcome of every evaluated check.
    pub const CHECKS: &str = "checks";
    /// Trend: active virtual users, sampled on every scheduler tick.
    pub const VUS: &str = "vus";
    /// Counter: HTTP requests issued through an instrumented client.
    pub const HTTP_REQS: &str = "http_reqs";
    /// Trend: HTTP request duration in milliseconds.
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    /// Rate: HTTP requests that failed at the transport level or returned a status >= 400.
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        })
    }
}

/// A single observation. Rates take booleans, counters and trends take numbers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Bool(bool),
    Number(f64),
}

impl From<bool> for Sample {
    fn from(value: bool) -> Self {
        Sample::Bool(value)
    }
}

impl From<f64> for Sample {
    fn from(value: f64) -> Self {
        Sample::Number(value)
    }
}

impl From<u64> for Sample {
    fn from(value: u64) -> Self {
        Sample::Number(value as f64)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("metric `{name}` is already registered as a {existing}, cannot register it as a {requested}")]
    DuplicateMetric {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },
    #[error("metric `{0}` is not registered")]
    UnknownMetric(String),
    #[error("metric `{name}` is a {kind} and cannot record {sample:?}")]
    SampleMismatch {
        name: String,
        kind: MetricKind,
        sample: Sample,
    },
    #[error("metric names must not be empty")]
    EmptyName,
}

/// Raw, mergeable state of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricData {
    Counter(Counter),
    Rate(Rate),
    Trend(Trend),
}

impl MetricData {
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => MetricData::Counter(Counter::new()),
            MetricKind::Rate => MetricData::Rate(Rate::new()),
            MetricKind::Trend => MetricData::Trend(Trend::new()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricData::Counter(_) => MetricKind::Counter,
            MetricData::Rate(_) => MetricKind::Rate,
            MetricData::Trend(_) => MetricKind::Trend,
        }
    }

    /// Returns the rejected sample when its shape does not fit this metric.
    fn consume(&mut self, sample: Sample) -> Result<(), Sample> {
        match (self, sample) {
            (MetricData::Counter(c), Sample::Number(v)) => c.consume(&v),
            (MetricData::Trend(t), Sample::Number(v)) => t.consume(&v),
            (MetricData::Rate(r), Sample::Bool(v)) => r.consume(&v),
            (_, sample) => return Err(sample),
        }
        Ok(())
    }

    fn snapshot(&self) -> MetricSnapshot {
        match self {
            MetricData::Counter(c) => MetricSnapshot::Counter(c.clone()),
            MetricData::Rate(r) => MetricSnapshot::Rate(r.clone()),
            MetricData::Trend(t) => MetricSnapshot::Trend(t.snapshot()),
        }
    }
}

/// Frozen view of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricSnapshot {
    Counter(Counter),
    Rate(Rate),
    Trend(TrendSnapshot),
}

impl MetricSnapshot {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSnapshot::Counter(_) => MetricKind::Counter,
            MetricSnapshot::Rate(_) => MetricKind::Rate,
            MetricSnapshot::Trend(_) => MetricKind::Trend,
        }
    }

    pub fn as_counter(&self) -> Option<&Counter> {
        match self {
            MetricSnapshot::Counter(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_rate(&self) -> Option<&Rate> {
        match self {
            MetricSnapshot::Rate(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_trend(&self) -> Option<&TrendSnapshot> {
        match self {
            MetricSnapshot::Trend(t) => Some(t),
            _ => None,
        }
    }
}

/// Pass/fail tally of one named check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTally {
    pub passes: u64,
    pub fails: u64,
}

/// Immutable read of every metric and check tally at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub metrics: BTreeMap<String, MetricSnapshot>,
    pub checks: BTreeMap<String, CheckTally>,
}

impl RegistrySnapshot {
    pub fn get(&self, name: &str) -> Option<&MetricSnapshot> {
        self.metrics.get(name)
    }

    /// Sum of a counter, `0.0` when the counter does not exist.
    pub fn counter_sum(&self, name: &str) -> f64 {
        self.get(name)
            .and_then(MetricSnapshot::as_counter)
            .map_or(0.0, |c| c.sum)
    }
}

#[derive(Debug)]
struct Slot {
    kind: MetricKind,
    data: Mutex<MetricData>,
}

impl Slot {
    fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            data: Mutex::new(MetricData::new(kind)),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    metrics: RwLock<BTreeMap<String, Arc<Slot>>>,
    checks: Mutex<BTreeMap<String, CheckTally>>,
    frozen: AtomicBool,
}

/// Shared handle to the metrics of one run. Cloning is cheap and every clone sees the
/// same metrics.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry holding the built-in iteration, check and concurrency metrics.
    pub fn new() -> Self {
        let registry = Self {
            inner: Arc::new(Inner::default()),
        };
        {
            let mut metrics = registry.inner.metrics.write();
            for (name, kind) in [
                (builtin::ITERATIONS, MetricKind::Counter),
                (builtin::ITERATION_DURATION, MetricKind::Trend),
                (builtin::ITERATION_FAILURES, MetricKind::Counter),
                (builtin::CHECKS, MetricKind::Rate),
                (builtin::VUS, MetricKind::Trend),
            ] {
                metrics.insert(name.to_owned(), Arc::new(Slot::new(kind)));
            }
        }
        registry
    }

    /// Create `name` as a metric of `kind`. Registering an existing name again with the
    /// same kind is a no-op.
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<(), RegistryError> {
        self.slot(name, kind).map(|_| ())
    }

    pub fn counter(&self, name: &str) -> Result<CounterHandle, RegistryError> {
        self.handle(name, MetricKind::Counter).map(CounterHandle)
    }

    pub fn rate(&self, name: &str) -> Result<RateHandle, RegistryError> {
        self.handle(name, MetricKind::Rate).map(RateHandle)
    }

    pub fn trend(&self, name: &str) -> Result<TrendHandle, RegistryError> {
        self.handle(name, MetricKind::Trend).map(TrendHandle)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.metrics.read().contains_key(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.inner.metrics.read().get(name).map(|s| s.kind)
    }

    /// Append a sample to a registered metric.
    pub fn record(&self, name: &str, sample: impl Into<Sample>) -> Result<(), RegistryError> {
        let slot = self
            .inner
            .metrics
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownMetric(name.to_owned()))?;
        push(&self.inner, name, &slot, sample.into())
    }

    /// Count one evaluation of the check `name`, also feeding the built-in `checks` rate.
    pub fn record_check(&self, name: &str, passed: bool) {
        if self.is_frozen() {
            tracing::debug!(check = name, "registry frozen, dropping check result");
            return;
        }
        {
            let mut checks = self.inner.checks.lock();
            let tally = checks.entry(name.to_owned()).or_default();
            if passed {
                tally.passes += 1;
            } else {
                tally.fails += 1;
            }
        }
        if let Err(e) = self.record(builtin::CHECKS, passed) {
            tracing::error!("failed to record check result: {e}");
        }
    }

    /// Stop accepting samples. Called once at the end of a run.
    pub fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let metrics = self
            .inner
            .metrics
            .read()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.data.lock().snapshot()))
            .collect();
        let checks = self.inner.checks.lock().clone();
        RegistrySnapshot { metrics, checks }
    }

    fn handle(&self, name: &str, kind: MetricKind) -> Result<Handle, RegistryError> {
        Ok(Handle {
            name: name.into(),
            slot: self.slot(name, kind)?,
            registry: Arc::clone(&self.inner),
        })
    }

    fn slot(&self, name: &str, kind: MetricKind) -> Result<Arc<Slot>, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let existing = self.inner.metrics.read().get(name).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => Arc::clone(
                self.inner
                    .metrics
                    .write()
                    .entry(name.to_owned())
                    .or_insert_with(|| Arc::new(Slot::new(kind))),
            ),
        };
        if slot.kind != kind {
            return Err(RegistryError::DuplicateMetric {
                name: name.to_owned(),
                existing: slot.kind,
                requested: kind,
            });
        }
        Ok(slot)
    }
}

fn push(inner: &Inner, name: &str, slot: &Slot, sample: Sample) -> Result<(), RegistryError> {
    if inner.frozen.load(Ordering::Acquire) {
        tracing::debug!(metric = name, "registry frozen, dropping sample");
        return Ok(());
    }
    slot.data
        .lock()
        .consume(sample)
        .map_err(|sample| RegistryError::SampleMismatch {
            name: name.to_owned(),
            kind: slot.kind,
            sample,
        })
}

#[derive(Debug, Clone)]
struct Handle {
    name: Arc<str>,
    slot: Arc<Slot>,
    registry: Arc<Inner>,
}

impl Handle {
    fn push(&self, sample: Sample) {
        // the kind was checked when the handle was created
        if let Err(e) = push(&self.registry, &self.name, &self.slot, sample) {
            tracing::error!("{e}");
        }
    }
}

/// Typed handle to a counter, the equivalent of a script-level `new Counter(name)`.
#[derive(Debug, Clone)]
pub struct CounterHandle(Handle);

impl CounterHandle {
    pub fn add(&self, value: f64) {
        self.0.push(Sample::Number(value));
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }
}

/// Typed handle to a rate.
#[derive(Debug, Clone)]
pub struct RateHandle(Handle);

impl RateHandle {
    pub fn add(&self, value: bool) {
        self.0.push(Sample::Bool(value));
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }
}

/// Typed handle to a trend.
#[derive(Debug, Clone)]
pub struct TrendHandle(Handle);

impl TrendHandle {
    pub fn add(&self, value: f64) {
        self.0.push(Sample::Number(value));
    }

    /// Record a duration in milliseconds, the unit every timing trend uses.
    pub fn add_duration(&self, value: Duration) {
        self.add(value.as_nanos() as f64 / 1_000_000.0);
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }
}
