use std::{future::Future, marker::PhantomData};

use typed_builder::TypedBuilder;

use crate::{
    error::IterationResult,
    executor::Executor,
    registry::Registry,
    report::RunSummary,
    threshold::ThresholdSet,
};

/// A named iteration function plus the metrics and criteria it is judged by.
///
/// The action is what one virtual user does per iteration. It gets no arguments: anything
/// it needs (an HTTP client, metric handles from [`Scenario::registry`]) is captured by the
/// closure and cloned into every virtual user.
///
/// ```rust,ignore
/// let registry = Registry::new();
/// let errors = registry.rate("errors")?;
///
/// let scenario = Scenario::builder()
///     .name("smoke")
///     .action(move || {
///         let errors = errors.clone();
///         async move {
///             errors.add(false);
///             Ok(())
///         }
///     })
///     .registry(registry)
///     .thresholds(ThresholdSet::new().with("errors", "rate<0.1")?)
///     .build();
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct Scenario<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = IterationResult> + Send + 'static,
{
    #[builder(setter(into))]
    pub name: String,
    pub action: F,
    /// Where every sample of this scenario ends up. Frozen once the scenario has run.
    #[builder(default)]
    pub registry: Registry,
    #[builder(default)]
    pub thresholds: ThresholdSet,
    #[builder(default, setter(skip))]
    future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Scenario<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = IterationResult> + Send + 'static,
{
    /// Run the scenario on `executor` and judge the result against its thresholds.
    pub async fn run<E>(&self, executor: &E) -> Result<RunSummary, E::Error>
    where
        E: Executor<F, Fut>,
    {
        let result = executor.exec(self).await?;
        let summary = RunSummary::assemble(&self.name, &result, &self.thresholds);
        if summary.passed {
            tracing::info!("Scenario {} passed all thresholds", self.name);
        } else {
            tracing::warn!("Scenario {} failed one or more thresholds", self.name);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ConstantExecutor, StageExecutor};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn run_judges_thresholds() {
        let registry = Registry::new();
        let errors = registry.rate("errors").unwrap();
        let scenario = Scenario::builder()
            .name("judged")
            .action(move || {
                let errors = errors.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    errors.add(false);
                    Ok(())
                }
            })
            .registry(registry)
            .thresholds(
                ThresholdSet::new()
                    .with("errors", "rate<0.1")
                    .unwrap()
                    .with("iterations", "count>100")
                    .unwrap(),
            )
            .build();

        let executor = ConstantExecutor::builder()
            .vus(2)
            .duration(Duration::from_secs(1))
            .build();
        let summary = scenario.run(&executor).await.unwrap();

        assert_eq!(summary.scenario, "judged");
        assert!(summary.thresholds[0].passed());
        assert!(!summary.thresholds[1].passed());
        assert!(!summary.passed);
    }

    #[tokio::test]
    async fn executor_errors_surface() {
        let scenario = Scenario::builder()
            .name("empty")
            .action(|| async { Ok(()) })
            .build();
        let executor = StageExecutor::builder().stages(vec![]).build();
        assert!(scenario.run(&executor).await.is_err());
    }
}
