//! Data model shared by the gateway, cache, ledger, and orchestrator.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RunError, RunFailure};
use crate::fingerprint::Fingerprint;

/// Free-form metadata attached to catalogue entries.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Run parameters. Ordered so that fingerprints are deterministic.
pub type Parameters = BTreeMap<String, serde_json::Value>;

/// Kind of registry entity an identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Model,
    Test,
    Result,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::Test => write!(f, "test"),
            Self::Result => write!(f, "result"),
        }
    }
}

/// Model descriptor returned by `GET /models/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Globally unique identifier.
    pub id: String,

    pub name: String,

    pub owner: String,

    /// Version tag of the model instance.
    pub version: String,

    /// User-assigned short name in the catalogue.
    #[serde(default)]
    pub alias: Option<String>,

    #[serde(default)]
    pub metadata: Metadata,
}

/// Test descriptor returned by `GET /tests/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDescriptor {
    /// Globally unique identifier.
    pub id: String,

    pub name: String,

    /// Input format tag the test accepts.
    pub input_format: String,

    /// Identifier of the scoring method (e.g. "z_score").
    pub scoring_method: String,

    pub version: String,

    #[serde(default)]
    pub alias: Option<String>,

    #[serde(default)]
    pub metadata: Metadata,
}

/// Either kind of catalogue entry, as stored in the metadata cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    Model(ModelDescriptor),
    Test(TestDescriptor),
}

impl Descriptor {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Model(_) => EntityKind::Model,
            Self::Test(_) => EntityKind::Test,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Model(m) => &m.id,
            Self::Test(t) => &t.id,
        }
    }
}

impl From<ModelDescriptor> for Descriptor {
    fn from(model: ModelDescriptor) -> Self {
        Self::Model(model)
    }
}

impl From<TestDescriptor> for Descriptor {
    fn from(test: TestDescriptor) -> Self {
        Self::Test(test)
    }
}

/// A test addressed by its catalogue alias and version instead of its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestAlias {
    pub alias: String,
    pub version: String,
}

/// A request to run one test against one model.
///
/// The test is named either by `test_id` or, when that is empty, by
/// `test_alias`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub model_id: String,
    #[serde(default)]
    pub test_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_alias: Option<TestAlias>,
    #[serde(default)]
    pub parameters: Parameters,
}

impl RunRequest {
    pub fn new(model_id: impl Into<String>, test_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            test_id: test_id.into(),
            ..Default::default()
        }
    }

    /// Request naming the test by alias and version.
    pub fn by_test_alias(
        model_id: impl Into<String>,
        alias: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            test_alias: Some(TestAlias {
                alias: alias.into(),
                version: version.into(),
            }),
            ..Default::default()
        }
    }

    /// Add a run parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Reject requests without a model or test reference.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.model_id.trim().is_empty() {
            return Err(RunError::InvalidRequest {
                reason: "model_id is required".to_string(),
            });
        }
        if !self.test_id.trim().is_empty() {
            return Ok(());
        }
        match &self.test_alias {
            Some(a) if !a.alias.trim().is_empty() && !a.version.trim().is_empty() => Ok(()),
            Some(_) => Err(RunError::InvalidRequest {
                reason: "test alias and version are both required".to_string(),
            }),
            None => Err(RunError::InvalidRequest {
                reason: "test_id or test alias is required".to_string(),
            }),
        }
    }

    /// The test reference used for fingerprinting and cache lookup: the id
    /// when set, else `alias:<alias>@<version>`.
    pub fn test_key(&self) -> String {
        match &self.test_alias {
            Some(a) if self.test_id.trim().is_empty() => format!("alias:{}@{}", a.alias, a.version),
            _ => self.test_id.clone(),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.model_id, &self.test_key(), &self.parameters)
    }
}

/// Payload of a score. Opaque to this crate beyond equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ScoreValue {
    Numeric(f64),
    Categorical(String),
    Structured(serde_json::Value),
}

/// Output of a scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Score type tag (e.g. "ZScore", "BooleanScore").
    pub score_type: String,

    pub value: ScoreValue,

    /// Free-form log text produced while judging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,

    /// Extra data the scorer wants stored with the result (figures, paths, ...).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub related_data: serde_json::Value,
}

impl ScoreResult {
    pub fn numeric(score_type: impl Into<String>, value: f64) -> Self {
        Self {
            score_type: score_type.into(),
            value: ScoreValue::Numeric(value),
            log: None,
            related_data: serde_json::Value::Null,
        }
    }

    pub fn categorical(score_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            score_type: score_type.into(),
            value: ScoreValue::Categorical(value.into()),
            log: None,
            related_data: serde_json::Value::Null,
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }
}

/// Lifecycle of a run.
///
/// ```text
/// Pending -> Scored -> Submitting -> Submitted
///    \          \           \
///     +----------+-----------+--> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Scored,
    Submitting,
    Submitted,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Submitted | Self::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Pending, Scored) | (Scored, Submitting) | (Submitting, Submitted) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Scored => "scored",
            Self::Submitting => "submitting",
            Self::Submitted => "submitted",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// State of one run, owned by the orchestrator and mirrored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub model_id: String,
    /// Resolved test id. Holds the alias key until the test is resolved.
    pub test_id: String,
    pub fingerprint: Fingerprint,

    /// Key the registry deduplicates submissions on. The run id of the first
    /// run for this fingerprint that produced a score.
    pub idempotency_key: String,

    pub state: RunState,
    pub score: Option<ScoreResult>,
    pub submission_id: Option<String>,

    /// Submission cycles started by the orchestrator.
    pub attempt_count: u32,

    pub last_error: Option<RunFailure>,

    /// Every state this run has been in, oldest first.
    pub history: Vec<RunState>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Fresh record in `Pending` with a new run id.
    pub fn pending(request: &RunRequest, fingerprint: Fingerprint) -> Self {
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            run_id,
            model_id: request.model_id.clone(),
            test_id: request.test_key(),
            fingerprint,
            idempotency_key: run_id.to_string(),
            state: RunState::Pending,
            score: None,
            submission_id: None,
            attempt_count: 0,
            last_error: None,
            history: vec![RunState::Pending],
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting anything but a forward step or a diversion to `Failed`.
    pub fn advance(&mut self, next: RunState) -> Result<(), RunError> {
        if !self.state.can_advance_to(next) {
            return Err(RunError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Divert to `Failed` with the given reason.
    pub fn fail(&mut self, reason: RunFailure) -> Result<(), RunError> {
        self.advance(RunState::Failed)?;
        self.last_error = Some(reason);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Body of `POST /results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub run_id: Uuid,
    pub model_id: String,
    pub test_id: String,
    pub score: ScoreResult,
    pub idempotency_key: String,
}

/// Response of `POST /results`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub submission_id: String,
}

/// Stored result, from `GET /results/{submissionId}` or a `GET /results` listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub submission_id: String,
    pub model_id: String,
    pub test_id: String,
    pub score: ScoreResult,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URL for the registry API.
    #[serde(default = "default_registry_url")]
    pub url: String,

    /// Default request timeout in seconds (per-call timeouts override it).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Total attempts per request for transient failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Cap for any single backoff delay, including Retry-After.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Randomize backoff delays (full jitter).
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_registry_url() -> String {
    "https://validation.example.org/api/v2".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            timeout_secs: default_timeout(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RegistryConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `VALIDRUN_REGISTRY_URL` | Registry base URL |
    /// | `VALIDRUN_REGISTRY_TIMEOUT` | Request timeout in seconds |
    /// | `VALIDRUN_MAX_ATTEMPTS` | Attempts per request |
    /// | `VALIDRUN_RETRY_BASE_MS` | Backoff base delay |
    /// | `VALIDRUN_RETRY_MAX_MS` | Backoff delay cap |
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("VALIDRUN_REGISTRY_URL").unwrap_or_else(|_| default_registry_url()),
            timeout_secs: env_parse("VALIDRUN_REGISTRY_TIMEOUT").unwrap_or_else(default_timeout),
            max_attempts: env_parse("VALIDRUN_MAX_ATTEMPTS").unwrap_or_else(default_max_attempts),
            retry_base_delay_ms: env_parse("VALIDRUN_RETRY_BASE_MS")
                .unwrap_or_else(default_retry_base_delay_ms),
            retry_max_delay_ms: env_parse("VALIDRUN_RETRY_MAX_MS")
                .unwrap_or_else(default_retry_max_delay_ms),
            jitter: default_jitter(),
        }
    }

    /// Set the base URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the total attempts per request.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set backoff base delay, in milliseconds.
    pub fn with_retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.retry_base_delay_ms = ms;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
