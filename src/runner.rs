use futures::FutureExt;
use std::{any::Any, future::Future, panic::AssertUnwindSafe, time::Duration};
use tokio::{sync::watch, time::Instant};

use crate::{
    error::{BoxError, IterationResult},
    registry::{CounterHandle, Registry, RegistryError, TrendHandle, builtin},
};

/// What happened to a single iteration.
#[derive(Debug)]
pub enum IterationOutcome {
    Completed { duration: Duration },
    Failed { duration: Duration, error: IterationError },
}

impl IterationOutcome {
    pub fn duration(&self) -> Duration {
        match self {
            IterationOutcome::Completed { duration } | IterationOutcome::Failed { duration, .. } => {
                *duration
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, IterationOutcome::Failed { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IterationError {
    #[error("iteration returned an error: {0}")]
    Returned(#[source] BoxError),
    #[error("iteration panicked: {0}")]
    Panicked(String),
}

/// Runs the iteration function once per cycle on behalf of one virtual user.
///
/// Failures are isolated here: an `Err` or a panic from the iteration function is turned
/// into [`IterationOutcome::Failed`], counted, and logged, and the caller simply moves on
/// to the next iteration.
#[derive(Debug, Clone)]
pub struct IterationRunner {
    sleep: Duration,
    iterations: CounterHandle,
    durations: TrendHandle,
    failures: CounterHandle,
}

impl IterationRunner {
    pub fn new(registry: &Registry, sleep: Duration) -> Result<Self, RegistryError> {
        Ok(Self {
            sleep,
            iterations: registry.counter(builtin::ITERATIONS)?,
            durations: registry.trend(builtin::ITERATION_DURATION)?,
            failures: registry.counter(builtin::ITERATION_FAILURES)?,
        })
    }

    pub async fn run_once<F, Fut>(&self, action: &F) -> IterationOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = IterationResult>,
    {
        let start = Instant::now();
        // building the future may panic too, so it happens inside the guarded block
        let result = AssertUnwindSafe(async { action().await })
            .catch_unwind()
            .await;
        let duration = start.elapsed();

        self.iterations.add(1.0);
        self.durations.add_duration(duration);

        let error = match result {
            Ok(Ok(())) => return IterationOutcome::Completed { duration },
            Ok(Err(e)) => IterationError::Returned(e),
            Err(panic) => IterationError::Panicked(panic_message(panic.as_ref())),
        };
        self.failures.add(1.0);
        tracing::warn!("{error}");
        IterationOutcome::Failed { duration, error }
    }

    /// Wait out the inter-iteration sleep. Returns early with `false` when the worker has
    /// been told to stop.
    pub(crate) async fn pause(&self, stop: &mut StopSignal) -> bool {
        if stop.is_set() {
            return false;
        }
        if self.sleep.is_zero() {
            // give the scheduler a chance to run even for tight loops
            tokio::task::yield_now().await;
            return !stop.is_set();
        }
        tokio::select! {
            _ = tokio::time::sleep(self.sleep) => !stop.is_set(),
            _ = stop.wait() => false,
        }
    }
}

/// Tells a worker to stop after its current iteration. Set either for this worker alone
/// (`retire`, when the scheduler scales down) or for every worker (`shutdown`).
#[derive(Debug, Clone)]
pub(crate) struct StopSignal {
    retire: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl StopSignal {
    pub(crate) fn new(retire: watch::Receiver<bool>, shutdown: watch::Receiver<bool>) -> Self {
        Self { retire, shutdown }
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.retire.borrow() || *self.shutdown.borrow()
    }

    /// Resolves once either flag is raised. A dropped sender counts as a stop.
    pub(crate) async fn wait(&mut self) {
        tokio::select! {
            _ = self.retire.wait_for(|b| *b) => {}
            _ = self.shutdown.wait_for(|b| *b) => {}
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[tokio::test(start_paused = true)]
    async fn failures_are_counted_and_isolated() {
        let registry = Registry::new();
        let runner = IterationRunner::new(&registry, Duration::ZERO).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let action = {
            let calls = calls.clone();
            move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let result: IterationResult = if n == 2 { Err("boom".into()) } else { Ok(()) };
                    result
                }
            }
        };

        let mut failed = 0;
        for _ in 0..5 {
            let outcome = runner.run_once(&action).await;
            assert!(outcome.duration() >= Duration::from_millis(10));
            failed += usize::from(outcome.is_failed());
        }
        assert_eq!(failed, 1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counter_sum(builtin::ITERATIONS), 5.0);
        assert_eq!(snapshot.counter_sum(builtin::ITERATION_FAILURES), 1.0);
        let durations = snapshot
            .get(builtin::ITERATION_DURATION)
            .unwrap()
            .as_trend()
            .unwrap();
        assert_eq!(durations.len(), 5);
        assert!(durations.min().is_some_and(|ms| ms >= 10.0));
    }

    #[tokio::test]
    async fn panics_are_caught() {
        let registry = Registry::new();
        let runner = IterationRunner::new(&registry, Duration::ZERO).unwrap();

        fn explode() -> IterationResult {
            panic!("bad index")
        }

        let outcome = runner.run_once(&|| async { explode() }).await;
        match outcome {
            IterationOutcome::Failed {
                error: IterationError::Panicked(msg),
                ..
            } => assert_eq!(msg, "bad index"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            registry.snapshot().counter_sum(builtin::ITERATION_FAILURES),
            1.0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pause_sleeps_unless_stopped() {
        let registry = Registry::new();
        let runner = IterationRunner::new(&registry, Duration::from_secs(1)).unwrap();
        let (retire_tx, retire_rx) = watch::channel(false);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut stop = StopSignal::new(retire_rx, shutdown_rx);

        let start = Instant::now();
        assert!(runner.pause(&mut stop).await);
        assert!(start.elapsed() >= Duration::from_secs(1));

        let pause = tokio::spawn({
            let runner = runner.clone();
            let mut stop = stop.clone();
            async move { runner.pause(&mut stop).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        retire_tx.send_replace(true);
        assert!(!pause.await.unwrap());
        assert!(!runner.pause(&mut stop).await);
    }

    #[test]
    fn panic_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "unknown panic payload");
    }
}
