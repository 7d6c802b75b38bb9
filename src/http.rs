//! HTTP collaborator for iteration functions.
//!
//! The engine itself never speaks HTTP. Iteration code uses an [`HttpClient`] and, to get
//! the usual `http_reqs`, `http_req_duration` and `http_req_failed` metrics for free,
//! wraps it in an [`InstrumentedClient`].
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;
use tokio::time::Instant;

use crate::registry::{
    CounterHandle, RateHandle, Registry, RegistryError, TrendHandle, builtin,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HttpError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    /// Time from sending the request to having read the whole body.
    pub duration: Duration,
}

/// A fully read HTTP response.
///
/// A request that never got a response is represented with status `0` and `error` set,
/// so checks can still look at it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub timings: Timings,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub error: Option<String>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.timings.duration = duration;
        self
    }

    fn failed_transport(error: HttpError, duration: Duration) -> Self {
        Self {
            timings: Timings { duration },
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Transport failure or a status of 400 and above.
    pub fn is_failed(&self) -> bool {
        self.status == 0 || self.status >= 400
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<Response, HttpError>;
}

#[cfg(feature = "http")]
pub use reqwest_client::ReqwestClient;

#[cfg(feature = "http")]
mod reqwest_client {
    use super::*;

    /// [`HttpClient`] backed by a shared `reqwest::Client`. Clone it into iteration
    /// closures rather than building one per iteration.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestClient {
        client: reqwest::Client,
    }

    impl ReqwestClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    impl From<reqwest::Client> for ReqwestClient {
        fn from(client: reqwest::Client) -> Self {
            Self::with_client(client)
        }
    }

    #[async_trait]
    impl HttpClient for ReqwestClient {
        async fn get(&self, url: &str) -> Result<Response, HttpError> {
            let transport = |e: reqwest::Error| HttpError::Transport {
                url: url.to_owned(),
                message: e.to_string(),
            };
            let start = Instant::now();
            let res = self.client.get(url).send().await.map_err(transport)?;
            let status = res.status().as_u16();
            let headers = res
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_owned(), v.to_owned()))
                })
                .collect();
            let body = res.bytes().await.map_err(transport)?.to_vec();
            Ok(Response {
                status,
                timings: Timings {
                    duration: start.elapsed(),
                },
                headers,
                body,
                error: None,
            })
        }
    }
}

/// Wraps a client and records the built-in HTTP metrics for every request.
#[derive(Debug, Clone)]
pub struct InstrumentedClient<C> {
    inner: C,
    reqs: CounterHandle,
    duration: TrendHandle,
    failed: RateHandle,
}

impl<C: HttpClient> InstrumentedClient<C> {
    pub fn new(inner: C, registry: &Registry) -> Result<Self, RegistryError> {
        Ok(Self {
            inner,
            reqs: registry.counter(builtin::HTTP_REQS)?,
            duration: registry.trend(builtin::HTTP_REQ_DURATION)?,
            failed: registry.rate(builtin::HTTP_REQ_FAILED)?,
        })
    }

    /// Never fails: a transport error comes back as a status `0` response.
    pub async fn get(&self, url: &str) -> Response {
        let start = Instant::now();
        let response = match self.inner.get(url).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("{e}");
                Response::failed_transport(e, start.elapsed())
            }
        };
        self.reqs.add(1.0);
        self.duration.add_duration(response.timings.duration);
        self.failed.add(response.is_failed());
        response
    }
}
