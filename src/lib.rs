//! Stampede — a virtual-user load-testing engine for Rust.
//!
//! Stampede runs an async iteration function over and over from a pool of concurrent
//! virtual users whose size follows a staged traffic profile, records what happens into
//! named metrics, and judges the run against declarative thresholds such as
//! `p(95)<2000` on request duration or `rate<0.1` on an error rate.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: the iteration function, the [`Registry`] it records into and the
//!   [`ThresholdSet`] it is judged by.
//! - [`Executor`]: decides how many virtual users run at any instant and for how long.
//!   [`StageExecutor`] ramps through a list of [`Stage`]s, [`ConstantExecutor`] holds a
//!   fixed number of users.
//! - [`Registry`]: named counters, rates and trends shared by every virtual user. The
//!   only mutable state of a run.
//! - [`Checks`]: named assertions over an iteration's result, counted but never fatal.
//! - [`RunSummary`]: the end-of-run view handed to one or more [`Reporter`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! use stampede::{
//!     Executor, Registry, Scenario, StageExecutor, Stage, ThresholdSet,
//!     http::{InstrumentedClient, ReqwestClient},
//!     report::{StdoutReporter, handoff},
//! };
//! use std::time::Duration;
//!
//! let registry = Registry::new();
//! let client = InstrumentedClient::new(ReqwestClient::new(), &registry)?;
//!
//! let scenario = Scenario::builder()
//!     .name("smoke")
//!     .action(move || {
//!         let client = client.clone();
//!         async move {
//!             client.get("http://localhost:3000").await;
//!             Ok(())
//!         }
//!     })
//!     .registry(registry)
//!     .thresholds(ThresholdSet::new().with("http_req_duration", "p(95)<500")?)
//!     .build();
//!
//! let executor = StageExecutor::builder()
//!     .stages(vec![
//!         Stage::new(Duration::from_secs(10), 20),
//!         Stage::new(Duration::from_secs(10), 0),
//!     ])
//!     .sleep(Duration::from_secs(1))
//!     .build();
//!
//! let summary = scenario.run(&executor).await?;
//! handoff(&summary, &[&StdoutReporter]).await?;
//! ```
//!
//! # Feature flags
//! - `http` (default): [`http::ReqwestClient`], an [`http::HttpClient`] backed by `reqwest`.
//!
//! # Logging
//!
//! The crate emits `tracing` events and installs no subscriber. Run and stage lifecycle
//! is logged at `info`, virtual user churn at `debug`, failed iterations at `warn`.

/// Mergeable sample aggregates
pub mod aggregate;
/// Named assertions
pub mod check;
/// File-based run options
pub mod config;
/// Error types shared across the crate
pub mod error;
/// Orchestrators that decide how many virtual users run and when
pub mod executor;
/// HTTP client and built-in request metrics
pub mod http;
/// Shared metric storage
pub mod registry;
/// Run summaries and sinks
pub mod report;
/// Single iterations with failure isolation
pub mod runner;
/// Main module of the crate that glues everything together
pub mod scenario;
/// Pass/fail criteria
pub mod threshold;

pub use aggregate::Aggregate;
pub use check::Checks;
pub use config::RunConfig;
pub use error::{BoxError, Error, IterationResult};
pub use executor::{ConstantExecutor, Executor, Ramp, RunResult, Stage, StageExecutor};
pub use registry::{MetricKind, Registry};
pub use report::{Reporter, RunSummary};
pub use scenario::Scenario;
pub use threshold::{Threshold, ThresholdSet, Verdict};
