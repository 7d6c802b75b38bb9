use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt::Debug;

/// The `Aggregate` trait defines how raw samples are collected and combined into a
/// mergeable representation that preserves the information needed for later analysis.
///
/// Aggregates store compact raw data (sums, counts, retained samples). Derived values such
/// as percentiles are computed from a frozen copy at the end of a run, see
/// [`TrendSnapshot`] and [`crate::report::RunSummary`].
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: virtual users record in arbitrary
///   interleavings and partial aggregates may be combined in any order.
/// - `consume` is on the hot path of every iteration, keep it cheap.
///
/// # Example
/// ```rust
/// use stampede::aggregate::{Aggregate, Rate};
///
/// let mut rate = Rate::new();
/// rate.aggregate(&[true, true, false, true]);
/// assert_eq!(rate.fraction(), Some(0.75));
/// ```
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialEq + Send + Sync + Debug + Clone,
{
    /// The sample type this aggregate summarizes.
    type Sample;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple samples into the current instance.
    fn aggregate(&mut self, samples: &[Self::Sample]) {
        samples.iter().for_each(|s| self.consume(s));
    }

    /// Incorporate a single sample.
    fn consume(&mut self, sample: &Self::Sample);

    /// Combine two aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Running sum of numeric samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub sum: f64,
    pub count: u64,
}

impl Aggregate for Counter {
    type Sample = f64;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, sample: &f64) {
        self.sum += sample;
        self.count += 1;
    }

    fn merge(&mut self, other: Self) {
        self.sum += other.sum;
        self.count += other.count;
    }
}

/// Fraction of `true` samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub trues: u64,
    pub total: u64,
}

impl Rate {
    /// `None` until at least one sample was recorded.
    pub fn fraction(&self) -> Option<f64> {
        (self.total > 0).then(|| self.trues as f64 / self.total as f64)
    }

    pub fn falses(&self) -> u64 {
        self.total - self.trues
    }
}

impl Aggregate for Rate {
    type Sample = bool;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, sample: &bool) {
        self.trues += u64::from(*sample);
        self.total += 1;
    }

    fn merge(&mut self, other: Self) {
        self.trues += other.trues;
        self.total += other.total;
    }
}

/// Distribution of numeric samples.
///
/// Every sample is retained so that percentiles are exact rather than bucketed. Memory
/// grows linearly with the number of samples, which is fine for the request volumes a
/// single load generator produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub samples: Vec<f64>,
}

impl Trend {
    /// Freeze the distribution into a sorted view supporting order statistics.
    pub fn snapshot(&self) -> TrendSnapshot {
        let mut samples = self.samples.clone();
        samples.sort_by(f64::total_cmp);
        TrendSnapshot { samples }
    }
}

impl Aggregate for Trend {
    type Sample = f64;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, sample: &f64) {
        self.samples.push(*sample);
    }

    fn merge(&mut self, mut other: Self) {
        self.samples.append(&mut other.samples);
    }
}

/// A sorted, immutable copy of a [`Trend`].
///
/// Percentiles use the **nearest-rank** method: for `n` samples the `p`-th percentile is
/// the sample at rank `ceil(p / 100 * n)` (1-based, clamped to `[1, n]`). The result is
/// always one of the recorded samples, never an interpolated value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSnapshot {
    samples: Vec<f64>,
}

impl TrendSnapshot {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn sum(&self) -> f64 {
        self.samples.iter().sum()
    }

    pub fn min(&self) -> Option<f64> {
        self.samples.first().copied()
    }

    pub fn max(&self) -> Option<f64> {
        self.samples.last().copied()
    }

    pub fn avg(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.sum() / self.len() as f64)
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// Nearest-rank percentile, `p` in `[0, 100]`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.is_empty() || !(0.0..=100.0).contains(&p) {
            return None;
        }
        let n = self.samples.len();
        // p * n first keeps integral percentiles exact
        let rank = (p * n as f64 / 100.0).ceil() as usize;
        Some(self.samples[rank.clamp(1, n) - 1])
    }
}
