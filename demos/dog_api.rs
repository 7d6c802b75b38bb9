//! Load test of the public Dog API: breed list, image search and a random breed lookup
//! per iteration, ramping up to 15 virtual users over five minutes.
//!
//! ```sh
//! RUST_LOG=info cargo run --example dog_api
//! ```
//!
//! Exits with a non-zero status when a threshold fails. Ctrl-C stops the run early and
//! still prints the summary.
use std::{process::ExitCode, sync::Arc, time::Duration};

use rand::seq::SliceRandom;
use serde::Deserialize;
use stampede::{
    Checks, Error, IterationResult, Registry, RunConfig, RunSummary, Scenario,
    http::{InstrumentedClient, ReqwestClient, Response},
    registry::{RateHandle, TrendHandle},
    report::{JsonReporter, StdoutReporter, handoff},
};
use tracing_subscriber::EnvFilter;

const BASE_URL: &str = "https://api.thedogapi.com/v1";

const OPTIONS: &str = r#"{
    "stages": [
        { "duration": "30s", "target": 5 },
        { "duration": "1m", "target": 10 },
        { "duration": "2m", "target": 15 },
        { "duration": "1m", "target": 5 },
        { "duration": "30s", "target": 0 }
    ],
    "thresholds": {
        "http_req_duration": ["p(95)<2000"],
        "http_req_failed": ["rate<0.1"],
        "errors": ["rate<0.1"]
    },
    "sleep": "1s"
}"#;

const SLOW: Duration = Duration::from_millis(2000);

#[derive(Debug, Deserialize)]
struct Breed {
    id: u64,
    name: String,
    #[serde(default)]
    breed_group: Option<String>,
}

/// The checks shared by the list endpoints. `what` names the resource in check names.
fn list_checks(api: &str, what: &str) -> Checks<Response> {
    Checks::new()
        .check(format!("{api} status is 200"), |r: &Response| r.status == 200)
        .check(format!("{api} responds in < 2000ms"), |r: &Response| {
            r.timings.duration < SLOW
        })
        .check(format!("{api} returns JSON"), |r: &Response| {
            r.header("content-type")
                .is_some_and(|ct| ct.contains("application/json"))
        })
        .try_check(format!("{api} returns an array"), |r: &Response| {
            r.json::<serde_json::Value>().map(|v| v.is_array())
        })
        .try_check(format!("{api} has at least one {what}"), |r: &Response| {
            r.json::<Vec<serde_json::Value>>().map(|v| !v.is_empty())
        })
}

fn lookup_checks(id: u64) -> Checks<Response> {
    Checks::new()
        .check("breed lookup status is 200", |r: &Response| r.status == 200)
        .check("breed lookup responds in < 2000ms", |r: &Response| {
            r.timings.duration < SLOW
        })
        .try_check("breed lookup returns the requested breed", move |r: &Response| {
            r.json::<Breed>().map(|b| b.id == id)
        })
}

/// Everything one virtual user needs, cloned into each iteration.
#[derive(Clone)]
struct DogApiUser {
    registry: Registry,
    client: InstrumentedClient<ReqwestClient>,
    errors: RateHandle,
    response_time: TrendHandle,
    breed_checks: Arc<Checks<Response>>,
    image_checks: Arc<Checks<Response>>,
}

impl DogApiUser {
    fn new(registry: Registry) -> Result<Self, Error> {
        Ok(Self {
            client: InstrumentedClient::new(ReqwestClient::new(), &registry)?,
            errors: registry.rate("errors")?,
            response_time: registry.trend("response_time")?,
            breed_checks: Arc::new(list_checks("breeds", "breed")),
            image_checks: Arc::new(list_checks("images", "image")),
            registry,
        })
    }

    async fn iterate(self) -> IterationResult {
        let breeds_res = self.client.get(&format!("{BASE_URL}/breeds")).await;
        self.breed_checks.evaluate(&breeds_res, &self.registry);

        let images_res = self
            .client
            .get(&format!("{BASE_URL}/images/search?limit=5"))
            .await;
        self.image_checks.evaluate(&images_res, &self.registry);

        let breeds = match breeds_res.status {
            200 => breeds_res.json::<Vec<Breed>>().map_err(|e| {
                tracing::error!("Could not parse breeds: {e}");
                e
            }),
            _ => Ok(Vec::new()),
        };

        if let Ok(breeds) = &breeds {
            // the rng is not Send, keep it out of any await
            let pick = breeds.choose(&mut rand::thread_rng()).map(|b| b.id);
            if let Some(id) = pick {
                let lookup = self.client.get(&format!("{BASE_URL}/breeds/{id}")).await;
                lookup_checks(id).evaluate(&lookup, &self.registry);
            }
            if breeds_res.status == 200 {
                tracing::debug!("Found {} dog breeds", breeds.len());
                if let Some(example) = breeds.choose(&mut rand::thread_rng()) {
                    tracing::debug!(
                        "Example breed: {} ({})",
                        example.name,
                        example.breed_group.as_deref().unwrap_or("N/A")
                    );
                }
            }
        }

        self.errors
            .add(breeds_res.status != 200 || images_res.status != 200);
        self.response_time.add_duration(breeds_res.timings.duration);
        self.response_time.add_duration(images_res.timings.duration);

        if images_res.status == 200 {
            match images_res.json::<Vec<serde_json::Value>>() {
                Ok(images) => tracing::debug!("Found {} dog images", images.len()),
                Err(e) => tracing::error!("Could not parse images: {e}"),
            }
        }

        // a body that fails to parse still counts as a failed iteration
        breeds.map(|_| ()).map_err(Into::into)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RunConfig::from_json_str(OPTIONS)?;
    // NEVER build clients inside the action, every virtual user shares this one
    let registry = Registry::new();
    let user = DogApiUser::new(registry.clone())?;

    let scenario = Scenario::builder()
        .name("dog_api")
        .action(move || user.clone().iterate())
        .registry(registry)
        .thresholds(config.thresholds()?)
        .build();

    let result = config
        .executor()?
        .exec_until(&scenario, tokio::signal::ctrl_c())
        .await?;
    let summary = RunSummary::assemble(&scenario.name, &result, &scenario.thresholds);

    let json = JsonReporter::new("dog_api_summary.json");
    handoff(&summary, &[&StdoutReporter, &json]).await?;

    Ok(if summary.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
