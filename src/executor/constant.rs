use std::{future::Future, time::Duration};
use typed_builder::TypedBuilder;

use super::{Executor, ExecutorError, Ramp, RunResult, Stage, StageExecutor};
use crate::{error::IterationResult, scenario::Scenario};

/// A fixed number of virtual users looping for a fixed duration.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ConstantExecutor {
    pub vus: usize,
    pub duration: Duration,
    #[builder(default)]
    pub sleep: Duration,
    #[builder(default, setter(strip_option))]
    pub graceful_stop: Option<Duration>,
}

impl ConstantExecutor {
    fn as_stages(&self) -> StageExecutor {
        StageExecutor {
            stages: vec![Stage::new(self.duration, self.vus)],
            ramp: Ramp::Step,
            sleep: self.sleep,
            tick: Duration::from_millis(100),
            graceful_stop: self.graceful_stop,
        }
    }

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
        self.as_stages().exec_until(scenario, abort).await
    }
}

impl<F, Fut> Executor<F, Fut> for ConstantExecutor
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = IterationResult> + Send + 'static,
{
    type Error = ExecutorError;

    async fn exec(&self, scenario: &Scenario<F, Fut>) -> Result<RunResult, Self::Error> {
        self.as_stages().exec(scenario).await
    }
}
