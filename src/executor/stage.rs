use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::{
    future::{self, Future},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::watch,
    task::{AbortHandle, JoinHandle},
    time::Instant,
};
use typed_builder::TypedBuilder;

use super::{Executor, ExecutorError, RunResult};
use crate::{
    error::IterationResult,
    registry::builtin,
    runner::{IterationRunner, StopSignal},
    scenario::Scenario,
};

/// A stage defines a target number of virtual users and how long to ramp to it.
///
/// Use `Stage::new(Duration::from_secs(30), 5)` to ramp to 5 virtual users over 30s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    /// Concurrent virtual users
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// How the target moves between stage boundaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ramp {
    /// Interpolate from the previous target to the stage target.
    #[default]
    Linear,
    /// Hold the stage target for the whole stage.
    Step,
}

/// Target concurrency `elapsed` into the run. Past the last stage the last target holds.
pub fn concurrency_at(elapsed: Duration, stages: &[Stage], ramp: Ramp) -> usize {
    let mut stage_start = Duration::ZERO;
    let mut from = 0;
    for stage in stages {
        let stage_end = stage_start + stage.duration;
        if elapsed < stage_end {
            return match ramp {
                Ramp::Step => stage.target,
                Ramp::Linear => {
                    // interpolation factor [0..1)
                    let t = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                    let vus = from as f64 + (stage.target as f64 - from as f64) * t;
                    vus.floor().max(0.0) as usize
                }
            };
        }
        stage_start = stage_end;
        from = stage.target;
    }
    from
}

pub fn total_duration(stages: &[Stage]) -> Duration {
    stages.iter().map(|s| s.duration).sum()
}

pub fn max_target(stages: &[Stage]) -> usize {
    stages.iter().map(|s| s.target).max().unwrap_or(0)
}

/// Index of the stage running `elapsed` into the run, `None` once all stages are over.
pub fn stage_at(elapsed: Duration, stages: &[Stage]) -> Option<usize> {
    let mut stage_end = Duration::ZERO;
    stages.iter().position(|s| {
        stage_end += s.duration;
        elapsed < stage_end
    })
}

/// Executor that ramps a pool of virtual users through a list of stages.
///
/// - `tick` is the scheduler granularity: how often the target is recomputed and the
///   `vus` trend sampled.
/// - `sleep` is the pause each virtual user takes between two iterations.
/// - `graceful_stop` bounds how long the end of the run waits for in-flight iterations.
///   `None` waits for all of them.
#[derive(Debug, Clone, TypedBuilder)]
pub struct StageExecutor {
    pub stages: Vec<Stage>,
    #[builder(default)]
    pub ramp: Ramp,
    #[builder(default)]
    pub sleep: Duration,
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
    #[builder(default, setter(strip_option))]
    pub graceful_stop: Option<Duration>,
}

impl StageExecutor {
    fn validate(&self) -> Result<(), ExecutorError> {
        if self.stages.is_empty() {
            return Err(ExecutorError::NoStages);
        }
        if self.tick.is_zero() {
            return Err(ExecutorError::ZeroTick);
        }
        Ok(())
    }

    /// Run the scenario until the stages are over or `abort` resolves, whichever comes
    /// first. Either way in-flight iterations get up to `graceful_stop` to finish.
    ///
    /// The scenario's registry is frozen when this returns, so a scenario runs once.
    pub async fn exec_until<F, Fut, A>(
        &self,
        scenario: &Scenario<F, Fut>,
        abort: A,
    ) -> Result<RunResult, ExecutorError>
    where
        F: Fn() -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = IterationResult> + Send + 'static,
        A: Future + Send,
    {
        self.validate()?;
        let registry = &scenario.registry;
        if registry.is_frozen() {
            return Err(ExecutorError::AlreadyRan(scenario.name.clone()));
        }
        let runner = IterationRunner::new(registry, self.sleep)?;
        let vus = registry.trend(builtin::VUS)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let gauge = ActiveGauge::default();
        let mut pool = WorkerPool::new(scenario.action.clone(), runner, shutdown_rx, gauge.clone());

        let total = total_duration(&self.stages);
        tracing::info!(
            "Running scenario {}: {} stage(s), {:?}, up to {} virtual user(s)",
            scenario.name,
            self.stages.len(),
            total,
            max_target(&self.stages)
        );

        let start = Instant::now();
        let end = start + total;
        let mut next_tick = start;
        let mut current_stage = None;
        let mut aborted = false;
        tokio::pin!(abort);

        loop {
            let elapsed = start.elapsed();
            if elapsed >= total {
                break;
            }
            let stage = stage_at(elapsed, &self.stages);
            if stage != current_stage {
                if let Some(i) = stage {
                    tracing::info!(
                        "Stage {}/{}: {} virtual user(s) over {:?}",
                        i + 1,
                        self.stages.len(),
                        self.stages[i].target,
                        self.stages[i].duration
                    );
                }
                current_stage = stage;
            }

            pool.reconcile(concurrency_at(elapsed, &self.stages, self.ramp));
            vus.add(gauge.current() as f64);

            next_tick += self.tick;
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick.min(end)) => {}
                _ = &mut abort => {
                    tracing::info!("Run aborted, stopping virtual users...");
                    aborted = true;
                    break;
                }
            }
        }

        tracing::info!("Stages done, waiting for in-flight iterations...");
        shutdown_tx.send_replace(true);
        let stragglers = pool.drain(self.graceful_stop).await;
        registry.freeze();
        let elapsed = start.elapsed();

        tracing::info!(
            "Done running scenario {} in {:?} (peak {} virtual user(s), {} aborted)",
            scenario.name,
            elapsed,
            gauge.peak(),
            stragglers
        );
        Ok(RunResult {
            snapshot: registry.snapshot(),
            elapsed,
            peak_vus: gauge.peak(),
            aborted,
        })
    }
}

impl<F, Fut> Executor<F, Fut> for StageExecutor
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = IterationResult> + Send + 'static,
{
    type Error = ExecutorError;

    async fn exec(&self, scenario: &Scenario<F, Fut>) -> Result<RunResult, Self::Error> {
        self.exec_until(scenario, future::pending::<()>()).await
    }
}

/// Number of running virtual users and the highest it has been.
#[derive(Debug, Clone, Default)]
struct ActiveGauge {
    inner: Arc<GaugeInner>,
}

#[derive(Debug, Default)]
struct GaugeInner {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ActiveGauge {
    fn enter(&self) -> GaugeGuard {
        let now = self.inner.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak.fetch_max(now, Ordering::AcqRel);
        GaugeGuard(self.clone())
    }

    fn current(&self) -> usize {
        self.inner.current.load(Ordering::Acquire)
    }

    fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }
}

/// Held by a worker task for its whole life, dropped on exit or abort.
struct GaugeGuard(ActiveGauge);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.inner.current.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Worker {
    id: usize,
    retire: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct WorkerPool<F> {
    action: F,
    runner: IterationRunner,
    shutdown: watch::Receiver<bool>,
    gauge: ActiveGauge,
    active: Vec<Worker>,
    /// Retired workers still finishing their last iteration.
    draining: Vec<Worker>,
    next_id: usize,
}

impl<F, Fut> WorkerPool<F>
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = IterationResult> + Send + 'static,
{
    fn new(
        action: F,
        runner: IterationRunner,
        shutdown: watch::Receiver<bool>,
        gauge: ActiveGauge,
    ) -> Self {
        Self {
            action,
            runner,
            shutdown,
            gauge,
            active: Vec::new(),
            draining: Vec::new(),
            next_id: 0,
        }
    }

    fn live(&self) -> usize {
        self.active.len() + self.draining.len()
    }

    fn reconcile(&mut self, target: usize) {
        self.draining.retain(|w| !w.handle.is_finished());

        while self.active.len() > target {
            let Some(worker) = self.active.pop() else {
                break;
            };
            tracing::debug!("Retiring virtual user {}", worker.id);
            worker.retire.send_replace(true);
            self.draining.push(worker);
        }

        for _ in 0..target.saturating_sub(self.live()) {
            self.spawn();
        }
    }

    fn spawn(&mut self) {
        let id = self.next_id;
        self.next_id += 1;
        let (retire_tx, retire_rx) = watch::channel(false);
        let stop = StopSignal::new(retire_rx, self.shutdown.clone());
        let guard = self.gauge.enter();
        tracing::debug!("Starting virtual user {id}");
        let handle = tokio::spawn(worker_loop(
            id,
            self.action.clone(),
            self.runner.clone(),
            stop,
            guard,
        ));
        self.active.push(Worker {
            id,
            retire: retire_tx,
            handle,
        });
    }

    /// Wait for every worker to exit. Returns how many had to be aborted because
    /// `graceful_stop` ran out.
    async fn drain(self, graceful_stop: Option<Duration>) -> usize {
        let handles: Vec<JoinHandle<()>> = self
            .active
            .into_iter()
            .chain(self.draining)
            .map(|w| w.handle)
            .collect();
        let aborts: Vec<AbortHandle> = handles.iter().map(JoinHandle::abort_handle).collect();

        let joined = join_all(handles);
        let results = match graceful_stop {
            None => joined.await,
            Some(limit) => match tokio::time::timeout(limit, joined).await {
                Ok(results) => results,
                Err(_) => {
                    let stragglers = aborts.iter().filter(|h| !h.is_finished()).count();
                    aborts.iter().for_each(AbortHandle::abort);
                    tracing::warn!(
                        "Graceful stop of {limit:?} elapsed, aborted {stragglers} in-flight iteration(s)"
                    );
                    return stragglers;
                }
            },
        };

        for res in results {
            if let Err(e) = res {
                tracing::error!("Virtual user task failed: {e}");
            }
        }
        0
    }
}

async fn worker_loop<F, Fut>(
    id: usize,
    action: F,
    runner: IterationRunner,
    mut stop: StopSignal,
    _guard: GaugeGuard,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = IterationResult>,
{
    let mut iterations = 0u64;
    while !stop.is_set() {
        runner.run_once(&action).await;
        iterations += 1;
        if !runner.pause(&mut stop).await {
            break;
        }
    }
    tracing::debug!("Virtual user {id} stopped after {iterations} iteration(s)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::BoxError, registry::Registry};
    use futures::future::BoxFuture;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    type Iteration = BoxFuture<'static, IterationResult>;

    fn sleepy(
        registry: Registry,
        iteration: Duration,
    ) -> Scenario<impl Fn() -> Iteration + Send + Sync + Clone + 'static, Iteration> {
        Scenario::builder()
            .name("sleepy")
            .action(move || -> Iteration {
                Box::pin(async move {
                    tokio::time::sleep(iteration).await;
                    Ok(())
                })
            })
            .registry(registry)
            .build()
    }

    #[test]
    fn linear_interpolation() {
        let stages = [
            Stage::new(secs(10), 10),
            Stage::new(secs(10), 10),
            Stage::new(secs(10), 0),
        ];
        let at = |s: u64| concurrency_at(secs(s), &stages, Ramp::Linear);
        assert_eq!(at(0), 0);
        assert_eq!(at(5), 5);
        assert_eq!(at(10), 10);
        assert_eq!(at(15), 10);
        assert_eq!(at(25), 5);
        assert_eq!(at(30), 0);
        assert_eq!(at(100), 0);
        // floor, never rounds up past the ramp
        assert_eq!(concurrency_at(ms(9_990), &stages, Ramp::Linear), 9);
    }

    #[test]
    fn step_holds_stage_target() {
        let stages = [Stage::new(secs(5), 2), Stage::new(secs(5), 0)];
        assert_eq!(concurrency_at(Duration::ZERO, &stages, Ramp::Step), 2);
        assert_eq!(concurrency_at(ms(4_999), &stages, Ramp::Step), 2);
        assert_eq!(concurrency_at(secs(5), &stages, Ramp::Step), 0);
    }

    #[test]
    fn zero_length_stage_jumps() {
        let stages = [Stage::new(Duration::ZERO, 5), Stage::new(secs(10), 5)];
        assert_eq!(concurrency_at(Duration::ZERO, &stages, Ramp::Linear), 5);
        assert_eq!(concurrency_at(secs(9), &stages, Ramp::Linear), 5);
        assert_eq!(stage_at(Duration::ZERO, &stages), Some(1));
    }

    #[test]
    fn stage_helpers() {
        let stages = [
            Stage::new(secs(30), 5),
            Stage::new(secs(60), 10),
            Stage::new(secs(120), 15),
            Stage::new(secs(60), 5),
            Stage::new(secs(30), 0),
        ];
        assert_eq!(total_duration(&stages), secs(300));
        assert_eq!(max_target(&stages), 15);
        assert_eq!(stage_at(secs(45), &stages), Some(1));
        assert_eq!(stage_at(secs(300), &stages), None);
        assert_eq!(max_target(&[]), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_stays_within_targets() {
        let registry = Registry::new();
        let scenario = sleepy(registry, ms(150));
        let executor = StageExecutor::builder()
            .stages(vec![
                Stage::new(secs(1), 4),
                Stage::new(secs(1), 8),
                Stage::new(secs(1), 2),
                Stage::new(secs(1), 0),
            ])
            .build();

        let result = executor.exec(&scenario).await.unwrap();
        assert!(result.peak_vus <= 8);
        assert!(result.peak_vus > 0);
        assert!(!result.aborted);

        let vus = result.snapshot.get(builtin::VUS).unwrap().as_trend().unwrap();
        assert!(vus.max().unwrap() <= 8.0);
        assert!(result.snapshot.counter_sum(builtin::ITERATIONS) > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_retires_workers() {
        let registry = Registry::new();
        let scenario = sleepy(registry, ms(100));
        let executor = StageExecutor::builder()
            .stages(vec![Stage::new(secs(1), 4), Stage::new(secs(1), 1)])
            .ramp(Ramp::Step)
            .build();

        let result = executor.exec(&scenario).await.unwrap();
        assert_eq!(result.peak_vus, 4);
        let vus = result.snapshot.get(builtin::VUS).unwrap().as_trend().unwrap();
        assert_eq!(vus.max(), Some(4.0));
        assert_eq!(vus.min(), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_iterations_keep_running() {
        let registry = Registry::new();
        let scenario = Scenario::builder()
            .name("always fails")
            .action(|| async {
                tokio::time::sleep(ms(100)).await;
                Err::<(), BoxError>("nope".into())
            })
            .registry(registry)
            .build();
        let executor = StageExecutor::builder()
            .stages(vec![Stage::new(secs(1), 1)])
            .ramp(Ramp::Step)
            .build();

        let result = executor.exec(&scenario).await.unwrap();
        let iterations = result.snapshot.counter_sum(builtin::ITERATIONS);
        assert!(iterations >= 9.0);
        assert_eq!(
            result.snapshot.counter_sum(builtin::ITERATION_FAILURES),
            iterations
        );
    }

    #[tokio::test(start_paused = true)]
    async fn abort_ends_run_early() {
        let scenario = sleepy(Registry::new(), ms(100));
        let executor = StageExecutor::builder()
            .stages(vec![Stage::new(secs(60), 3)])
            .ramp(Ramp::Step)
            .build();

        let start = Instant::now();
        let result = executor
            .exec_until(&scenario, tokio::time::sleep(secs(1)))
            .await
            .unwrap();
        assert!(result.aborted);
        assert!(start.elapsed() < secs(2));
        assert!(scenario.registry.is_frozen());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_in_flight_iterations() {
        let scenario = sleepy(Registry::new(), secs(10));
        let executor = StageExecutor::builder()
            .stages(vec![Stage::new(secs(1), 2)])
            .ramp(Ramp::Step)
            .build();

        let result = executor.exec(&scenario).await.unwrap();
        assert!(result.elapsed >= secs(10));
        assert_eq!(result.snapshot.counter_sum(builtin::ITERATIONS), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_aborts_stragglers() {
        let scenario = sleepy(Registry::new(), secs(10));
        let executor = StageExecutor::builder()
            .stages(vec![Stage::new(secs(1), 2)])
            .ramp(Ramp::Step)
            .graceful_stop(ms(500))
            .build();

        let result = executor.exec(&scenario).await.unwrap();
        assert!(result.elapsed < secs(2));
        assert_eq!(result.snapshot.counter_sum(builtin::ITERATIONS), 0.0);
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected() {
        let scenario = sleepy(Registry::new(), ms(1));
        let no_stages = StageExecutor::builder().stages(vec![]).build();
        assert!(matches!(
            no_stages.exec(&scenario).await,
            Err(ExecutorError::NoStages)
        ));
        let zero_tick = StageExecutor::builder()
            .stages(vec![Stage::new(secs(1), 1)])
            .tick(Duration::ZERO)
            .build();
        assert!(matches!(
            zero_tick.exec(&scenario).await,
            Err(ExecutorError::ZeroTick)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_runs_once() {
        let scenario = sleepy(Registry::new(), ms(10));
        let executor = StageExecutor::builder()
            .stages(vec![Stage::new(ms(100), 1)])
            .build();
        executor.exec(&scenario).await.unwrap();
        assert!(matches!(
            executor.exec(&scenario).await,
            Err(ExecutorError::AlreadyRan(_))
        ));
    }
}
