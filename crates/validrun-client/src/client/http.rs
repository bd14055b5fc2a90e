//! HTTP layer: status mapping, retry, credential refresh, SubmitOutcome.
//!
//! This is the ONLY place for status code handling. client/mod.rs never
//! interprets status codes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::auth::{AuthSession, Credential};
use crate::error::{RegistryError, RegistryResult};
use crate::types::{RegistryConfig, Submission, SubmitRequest};

use super::helpers::{backoff_delay, error_detail, parse_retry_after, Endpoint};

/// Header carrying the submission idempotency key.
pub(crate) const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Outcome of a result submission.
#[derive(Debug)]
pub(crate) enum SubmitOutcome {
    /// Registry stored a new result.
    Created(Submission),
    /// Registry already held a result under this idempotency key (409).
    Duplicate(Submission),
}

/// One logical request, re-sendable verbatim across retries.
#[derive(Debug, Clone)]
struct ApiRequest<'a> {
    method: Method,
    endpoint: Endpoint<'a>,
    query: &'a [(&'a str, &'a str)],
    body: Option<&'a SubmitRequest>,
}

/// HTTP backend for making requests (holds reqwest client, auth, config).
#[derive(Debug, Clone)]
pub(crate) struct HttpBackend {
    pub(crate) client: reqwest::Client,
    pub(crate) base_url: Url,
    pub(crate) auth: AuthSession,
    pub(crate) config: RegistryConfig,
    pub(crate) attempts: Arc<AtomicU64>,
}

impl HttpBackend {
    /// GET an entity or a filtered collection and decode it.
    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint<'_>,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> RegistryResult<T> {
        let request = ApiRequest {
            method: Method::GET,
            endpoint,
            query,
            body: None,
        };
        let response = self.send(&request, timeout).await?;
        decode(response).await
    }

    /// POST a result; 409 with a submission id counts as a duplicate, not an error.
    pub(crate) async fn submit(
        &self,
        body: &SubmitRequest,
        timeout: Duration,
    ) -> RegistryResult<SubmitOutcome> {
        let request = ApiRequest {
            method: Method::POST,
            endpoint: Endpoint::Results,
            query: &[],
            body: Some(body),
        };
        let response = self.send(&request, timeout).await?;

        if response.status() == StatusCode::CONFLICT {
            let text = response.text().await.unwrap_or_default();
            return match serde_json::from_str::<Submission>(&text) {
                Ok(existing) => Ok(SubmitOutcome::Duplicate(existing)),
                Err(_) => Err(RegistryError::Validation {
                    message: format!(
                        "conflicting submission: {}",
                        error_detail(&text, "HTTP 409")
                    ),
                }),
            };
        }

        decode(response).await.map(SubmitOutcome::Created)
    }

    /// Send with bounded exponential-backoff retry on transient failures.
    ///
    /// After `max_attempts` attempts a retryable error becomes
    /// `RegistryError::Transient`. Permanent errors return immediately.
    async fn send(
        &self,
        request: &ApiRequest<'_>,
        timeout: Duration,
    ) -> RegistryResult<reqwest::Response> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.send_authenticated(request, timeout).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = backoff_delay(attempt, &e, &self.config);

                    warn!(
                        error = %e,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying request"
                    );

                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, attempts = attempt, "giving up after transient failures");
                    return Err(RegistryError::Transient {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt, with a single refresh-and-resend if the registry answers 401.
    async fn send_authenticated(
        &self,
        request: &ApiRequest<'_>,
        timeout: Duration,
    ) -> RegistryResult<reqwest::Response> {
        let credential = self.auth.credential(timeout).await?;

        match self.send_once(request, &credential, timeout).await {
            Err(RegistryError::Unauthorized { .. }) => {
                debug!("registry returned 401, refreshing credential");
                let fresh = self.auth.refresh_rejected(&credential, timeout).await?;

                match self.send_once(request, &fresh, timeout).await {
                    Err(RegistryError::Unauthorized { message }) => Err(RegistryError::rejected(
                        format!("refreshed credential rejected: {}", message),
                    )),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        request: &ApiRequest<'_>,
        credential: &Credential,
        timeout: Duration,
    ) -> RegistryResult<reqwest::Response> {
        let mut url = request.endpoint.url(&self.base_url)?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query);
        }
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .timeout(timeout)
            .header(AUTHORIZATION, credential.header_value());

        if let Some(body) = request.body {
            builder = builder
                .header(IDEMPOTENCY_KEY, body.idempotency_key.as_str())
                .json(body);
        }

        let response = builder.send().await?;
        let status = response.status();

        match status.as_u16() {
            200..=299 => Ok(response),

            409 if request.body.is_some() => Ok(response),

            400 => {
                let body = response.text().await.unwrap_or_default();
                Err(RegistryError::Validation {
                    message: error_detail(&body, "HTTP 400"),
                })
            }

            401 => Err(RegistryError::Unauthorized {
                message: "invalid or expired token".to_string(),
            }),

            403 => Err(RegistryError::auth("forbidden: credential lacks access")),

            404 => Err(request.endpoint.not_found()),

            429 => {
                let retry_after =
                    parse_retry_after(response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()));
                Err(RegistryError::RateLimited { retry_after })
            }

            500..=599 => {
                let body = response.text().await.unwrap_or_default();
                Err(RegistryError::Server {
                    status: status.as_u16(),
                    message: error_detail(&body, status.canonical_reason().unwrap_or("")),
                })
            }

            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(RegistryError::InvalidResponse {
                    message: format!(
                        "unexpected HTTP {}: {}",
                        status.as_u16(),
                        error_detail(&body, "")
                    ),
                })
            }
        }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> RegistryResult<T> {
    response
        .json()
        .await
        .map_err(|e| RegistryError::InvalidResponse {
            message: format!("failed to parse response body: {}", e),
        })
}
