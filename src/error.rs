use thiserror::Error;

use crate::{
    config::ConfigError, executor::ExecutorError, registry::RegistryError, report::ReportError,
    threshold::ThresholdError,
};

/// Error type that iteration functions and check predicates may return.
///
/// Any `std::error::Error` converts into it with `?`, and so does a plain `String` or `&str`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What an iteration function resolves to. An `Err` is recorded as an iteration failure
/// and never stops the run.
pub type IterationResult = Result<(), BoxError>;

/// Errors that abort a run before it starts or prevent its summary from being produced.
///
/// Iteration failures, failed checks and failed thresholds are run data, not errors; they
/// are reported through [`crate::report::RunSummary`].
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_tick(tick_ms: u64) -> Result<(), ExecutorError> {
        if tick_ms == 0 {
            return Err(ExecutorError::ZeroTick);
        }
        Ok(())
    }

    fn load_stages() -> Result<(), ConfigError> {
        Err(ConfigError::NoStages)
    }

    fn configure(tick_ms: u64) -> Result<(), Error> {
        check_tick(tick_ms)?;
        load_stages()?;
        Ok(())
    }

    #[test]
    fn module_errors_convert_with_question_mark() {
        assert!(matches!(
            configure(0),
            Err(Error::Executor(ExecutorError::ZeroTick))
        ));
        let err = configure(100).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::NoStages)));
        assert_eq!(err.to_string(), "at least one stage is required");

        let err = Error::from(ThresholdError::EmptyMetricName);
        assert_eq!(err.to_string(), "threshold metric name must not be empty");
    }
}
