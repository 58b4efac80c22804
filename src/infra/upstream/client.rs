//! HTTP fetch client: the single chokepoint for upstream traffic.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use crate::config::UpstreamSettings;
use crate::infra::error::InfraError;

use super::{Backoff, FetchError, RequestPacer, RetryPolicy, Upstream};

const METRIC_FETCH_ATTEMPTS: &str = "ukiyo_fetch_attempts_total";
const METRIC_FETCH_RETRIES: &str = "ukiyo_fetch_retries_total";

/// Performs paced GET requests with classified retry.
///
/// Every attempt, including each retry, claims a slot from the shared
/// [`RequestPacer`] first, so the upstream never sees a burst even while
/// backing off.
#[derive(Debug, Clone)]
pub struct FetchClient {
    http: reqwest::Client,
    pacer: Arc<RequestPacer>,
    policy: RetryPolicy,
}

enum AttemptOutcome {
    Success(Bytes),
    Fatal(FetchError),
    Transient(String),
}

impl FetchClient {
    pub fn new(
        settings: &UpstreamSettings,
        pacer: Arc<RequestPacer>,
    ) -> Result<Self, InfraError> {
        let http = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| {
                InfraError::configuration(format!("failed to build HTTP client: {err}"))
            })?;

        Ok(Self {
            http,
            pacer,
            policy: RetryPolicy::from(settings),
        })
    }

    #[cfg(test)]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[instrument(skip(self))]
    async fn get(&self, url: &str) -> Result<Bytes, FetchError> {
        let mut backoff = Backoff::new(self.policy.clone());
        let mut attempts: u32 = 0;

        loop {
            self.pacer.acquire().await;
            attempts += 1;
            counter!(METRIC_FETCH_ATTEMPTS).increment(1);

            let reason = match self.attempt(url).await {
                AttemptOutcome::Success(bytes) => {
                    debug!(url, attempts, bytes = bytes.len(), "Upstream fetch succeeded");
                    return Ok(bytes);
                }
                AttemptOutcome::Fatal(err) => return Err(err),
                AttemptOutcome::Transient(reason) => reason,
            };

            match backoff.next_delay() {
                Some(delay) => {
                    counter!(METRIC_FETCH_RETRIES).increment(1);
                    warn!(
                        url,
                        attempts,
                        reason,
                        delay_ms = delay.as_millis() as u64,
                        "Transient upstream failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(url, attempts, reason, "Upstream retry budget exhausted");
                    return Err(FetchError::Unavailable { attempts });
                }
            }
        }
    }

    async fn attempt(&self, url: &str) -> AttemptOutcome {
        let response = match self.http.get(url).send().await {
            Ok(response) => response,
            Err(err) => return AttemptOutcome::Transient(err.to_string()),
        };

        let status = response.status();
        if status.is_success() {
            return match response.bytes().await {
                Ok(bytes) => AttemptOutcome::Success(bytes),
                Err(err) => AttemptOutcome::Transient(format!("body read failed: {err}")),
            };
        }

        if status == StatusCode::NOT_FOUND {
            return AttemptOutcome::Fatal(FetchError::NotFound);
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return AttemptOutcome::Transient(format!("status {status}"));
        }
        if status.is_client_error() {
            return AttemptOutcome::Fatal(FetchError::BadRequest {
                status: status.as_u16(),
            });
        }
        AttemptOutcome::Transient(format!("unexpected status {status}"))
    }
}

#[async_trait]
impl Upstream for FetchClient {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        self.get(url).await
    }
}
