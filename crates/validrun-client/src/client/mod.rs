//! Registry gateway: model/test lookup and result submission.
//!
//! Public API: no status code knowledge. All HTTP/status mapping in http.rs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, info};

use crate::auth::{AuthConfig, AuthSession};
use crate::error::{RegistryError, RegistryResult};
use crate::types::{
    EntityKind, ModelDescriptor, RegistryConfig, ResultSummary, Submission, SubmitRequest,
    TestDescriptor,
};

mod helpers;
mod http;

use helpers::{parse_base_url, Endpoint};
use http::{HttpBackend, SubmitOutcome};

pub const REGISTRY_USER_AGENT: &str = concat!("validrun-client/", env!("CARGO_PKG_VERSION"));

/// Remote validation registry as seen by the orchestrator.
///
/// Implementations own retry, rate-limit, and credential handling; callers
/// only see the final outcome of each call.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn fetch_model(&self, id: &str, timeout: Duration) -> RegistryResult<ModelDescriptor>;

    async fn fetch_test(&self, id: &str, timeout: Duration) -> RegistryResult<TestDescriptor>;

    /// Look up a test by catalogue alias and version.
    async fn fetch_test_by_alias(
        &self,
        alias: &str,
        version: &str,
        timeout: Duration,
    ) -> RegistryResult<TestDescriptor>;

    /// Submit a score. Must be safe to resend with the same idempotency key.
    async fn submit_result(
        &self,
        request: &SubmitRequest,
        timeout: Duration,
    ) -> RegistryResult<Submission>;
}

#[async_trait]
impl<T: Registry + ?Sized> Registry for Arc<T> {
    async fn fetch_model(&self, id: &str, timeout: Duration) -> RegistryResult<ModelDescriptor> {
        (**self).fetch_model(id, timeout).await
    }

    async fn fetch_test(&self, id: &str, timeout: Duration) -> RegistryResult<TestDescriptor> {
        (**self).fetch_test(id, timeout).await
    }

    async fn fetch_test_by_alias(
        &self,
        alias: &str,
        version: &str,
        timeout: Duration,
    ) -> RegistryResult<TestDescriptor> {
        (**self).fetch_test_by_alias(alias, version, timeout).await
    }

    async fn submit_result(
        &self,
        request: &SubmitRequest,
        timeout: Duration,
    ) -> RegistryResult<Submission> {
        (**self).submit_result(request, timeout).await
    }
}

/// HTTP client for the validation registry.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: HttpBackend,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig, auth: AuthSession) -> RegistryResult<Self> {
        let base_url = parse_base_url(&config.url)?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(REGISTRY_USER_AGENT));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(default_headers)
            .build()
            .map_err(|e| RegistryError::Config {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http: HttpBackend {
                client,
                base_url,
                auth,
                config,
                attempts: Arc::new(AtomicU64::new(0)),
            },
        })
    }

    /// Build from `VALIDRUN_*` environment variables.
    pub fn from_env() -> RegistryResult<Self> {
        let auth = AuthSession::from_config(&AuthConfig::from_env())?;
        Self::new(RegistryConfig::from_env(), auth)
    }

    /// Look up a stored result by the id the registry assigned on submission.
    pub async fn get_result(
        &self,
        submission_id: &str,
        timeout: Duration,
    ) -> RegistryResult<ResultSummary> {
        debug!(submission_id, "fetching result");
        self.http
            .get_json(Endpoint::Result(submission_id), &[], timeout)
            .await
    }

    /// Stored results for one test, in the order the registry returns them.
    pub async fn list_results(
        &self,
        test_id: &str,
        timeout: Duration,
    ) -> RegistryResult<Vec<ResultSummary>> {
        debug!(test_id, "listing results");
        self.http
            .get_json(Endpoint::Results, &[("testId", test_id)], timeout)
            .await
    }

    /// Look up a model by its catalogue alias.
    pub async fn fetch_model_by_alias(
        &self,
        alias: &str,
        timeout: Duration,
    ) -> RegistryResult<ModelDescriptor> {
        debug!(alias, "fetching model by alias");
        let matches: Vec<ModelDescriptor> = self
            .http
            .get_json(Endpoint::Models, &[("alias", alias)], timeout)
            .await?;
        first_match(matches, EntityKind::Model, alias)
    }

    pub fn base_url(&self) -> &str {
        self.http.base_url.as_str()
    }

    pub fn auth(&self) -> &AuthSession {
        &self.http.auth
    }

    /// HTTP requests sent so far, retries and re-sends included.
    pub fn attempts(&self) -> u64 {
        self.http.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn fetch_model(&self, id: &str, timeout: Duration) -> RegistryResult<ModelDescriptor> {
        debug!(model_id = id, "fetching model");
        self.http.get_json(Endpoint::Model(id), &[], timeout).await
    }

    async fn fetch_test(&self, id: &str, timeout: Duration) -> RegistryResult<TestDescriptor> {
        debug!(test_id = id, "fetching test");
        self.http.get_json(Endpoint::Test(id), &[], timeout).await
    }

    async fn fetch_test_by_alias(
        &self,
        alias: &str,
        version: &str,
        timeout: Duration,
    ) -> RegistryResult<TestDescriptor> {
        debug!(alias, version, "fetching test by alias");
        let matches: Vec<TestDescriptor> = self
            .http
            .get_json(
                Endpoint::Tests,
                &[("alias", alias), ("version", version)],
                timeout,
            )
            .await?;
        first_match(matches, EntityKind::Test, &format!("{}@{}", alias, version))
    }

    async fn submit_result(
        &self,
        request: &SubmitRequest,
        timeout: Duration,
    ) -> RegistryResult<Submission> {
        debug!(
            run_id = %request.run_id,
            idempotency_key = %request.idempotency_key,
            "submitting result"
        );

        match self.http.submit(request, timeout).await? {
            SubmitOutcome::Created(submission) => Ok(submission),
            SubmitOutcome::Duplicate(submission) => {
                info!(
                    run_id = %request.run_id,
                    submission_id = %submission.submission_id,
                    "registry already holds this submission"
                );
                Ok(submission)
            }
        }
    }
}

/// The single entry of an alias lookup. No entry is `NotFound`; more than one
/// means the registry does not treat the alias as unique.
fn first_match<T>(matches: Vec<T>, kind: EntityKind, reference: &str) -> RegistryResult<T> {
    if matches.len() > 1 {
        return Err(RegistryError::InvalidResponse {
            message: format!("{} {} is ambiguous: {} matches", kind, reference, matches.len()),
        });
    }
    matches.into_iter().next().ok_or_else(|| RegistryError::NotFound {
        kind,
        id: reference.to_string(),
    })
}
