//! Named boolean assertions over an iteration's result.
//!
//! A failed check is data, not an error: it is counted in the registry and never changes
//! control flow unless the iteration code looks at the returned [`CheckOutcome`].
//!
//! ```rust
//! use stampede::{check::Checks, registry::Registry};
//!
//! let registry = Registry::new();
//! let checks = Checks::new()
//!     .check("is even", |n: &u32| n % 2 == 0)
//!     .check("is small", |n: &u32| *n < 10);
//!
//! let outcome = checks.evaluate(&12, &registry);
//! assert!(!outcome.all_passed());
//! assert_eq!(outcome.failed().count(), 1);
//! ```
use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
};

use crate::{error::BoxError, registry::Registry};

/// A single named assertion.
pub trait Predicate<R: ?Sized>: Send + Sync {
    fn evaluate(&self, value: &R) -> Result<bool, BoxError>;
}

impl<R, F> Predicate<R> for F
where
    R: ?Sized,
    F: Fn(&R) -> bool + Send + Sync,
{
    fn evaluate(&self, value: &R) -> Result<bool, BoxError> {
        Ok(self(value))
    }
}

/// Adapts a closure that can fail (e.g. while parsing a body) into a [`Predicate`].
pub struct Fallible<F>(pub F);

impl<R, F, E> Predicate<R> for Fallible<F>
where
    R: ?Sized,
    F: Fn(&R) -> Result<bool, E> + Send + Sync,
    E: Into<BoxError>,
{
    fn evaluate(&self, value: &R) -> Result<bool, BoxError> {
        (self.0)(value).map_err(Into::into)
    }
}

/// Ordered list of named predicates.
pub struct Checks<R: ?Sized> {
    predicates: Vec<(String, Box<dyn Predicate<R>>)>,
}

impl<R: ?Sized> Default for Checks<R> {
    fn default() -> Self {
        Self {
            predicates: Vec::new(),
        }
    }
}

impl<R: ?Sized> fmt::Debug for Checks<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.predicates.iter().map(|(name, _)| name))
            .finish()
    }
}

impl<R: ?Sized> Checks<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check<F>(self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.check_with(name, predicate)
    }

    pub fn try_check<F, E>(self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&R) -> Result<bool, E> + Send + Sync + 'static,
        E: Into<BoxError> + 'static,
    {
        self.check_with(name, Fallible(predicate))
    }

    pub fn check_with<P>(mut self, name: impl Into<String>, predicate: P) -> Self
    where
        P: Predicate<R> + 'static,
    {
        self.predicates.push((name.into(), Box::new(predicate)));
        self
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Evaluate every predicate against `value` and record each result into `registry`.
    ///
    /// Predicates are independent: one that errors or panics counts as failed and the
    /// rest still run.
    pub fn evaluate(&self, value: &R, registry: &Registry) -> CheckOutcome {
        let results = self
            .predicates
            .iter()
            .map(|(name, predicate)| {
                let passed = match catch_unwind(AssertUnwindSafe(|| predicate.evaluate(value))) {
                    Ok(Ok(passed)) => passed,
                    Ok(Err(e)) => {
                        tracing::debug!(check = %name, "check errored: {e}");
                        false
                    }
                    Err(_) => {
                        tracing::debug!(check = %name, "check panicked");
                        false
                    }
                };
                registry.record_check(name, passed);
                CheckResult {
                    name: name.clone(),
                    passed,
                }
            })
            .collect();
        CheckOutcome { results }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
}

/// Results of one [`Checks::evaluate`] call, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    pub results: Vec<CheckResult>,
}

impl CheckOutcome {
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn passed(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| r.passed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}
