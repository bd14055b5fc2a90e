//! Client for a remote validation registry.
//!
//! Resolves model and test descriptors, invokes a pluggable scorer, and
//! submits the score back to the registry exactly once per input:
//!
//! - HTTP gateway with bearer auth, bounded retry and jittered backoff
//! - Credential refresh (static token or client-credentials exchange)
//! - TTL-bounded descriptor cache shared across runs
//! - In-process result ledger keyed by input fingerprint
//! - Tests addressed by id or by catalogue alias and version
//! - Run orchestrator driving `Pending -> Scored -> Submitting -> Submitted`
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use validrun_client::{
//!     ModelDescriptor, Orchestrator, OrchestratorConfig, Parameters, RegistryClient,
//!     RunRequest, ScoreResult, Scorer, ScoringError, TestDescriptor,
//! };
//!
//! struct Constant;
//!
//! #[async_trait]
//! impl Scorer for Constant {
//!     async fn score(
//!         &self,
//!         _model: &ModelDescriptor,
//!         test: &TestDescriptor,
//!         _parameters: &Parameters,
//!     ) -> Result<ScoreResult, ScoringError> {
//!         Ok(ScoreResult::numeric(test.scoring_method.clone(), 0.5))
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RegistryClient::from_env()?;
//! let orchestrator = Orchestrator::new(client, Constant, OrchestratorConfig::from_env());
//!
//! let request = RunRequest::new("model-42", "test-7")
//!     .with_parameter("seed", serde_json::json!(1));
//! let record = orchestrator.execute(request, Duration::from_secs(10)).await?;
//! println!("{} -> {}", record.run_id, record.state);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `VALIDRUN_REGISTRY_URL` | Registry base URL (default: `https://validation.example.org/api/v2`) |
//! | `VALIDRUN_REGISTRY_TIMEOUT` | Client-wide request timeout in seconds (capped at half the token lifetime; default: 30) |
//! | `VALIDRUN_MAX_ATTEMPTS` | Attempts per registry call, first included (default: 3) |
//! | `VALIDRUN_RETRY_BASE_MS` | Base backoff delay (default: 500) |
//! | `VALIDRUN_RETRY_MAX_MS` | Backoff cap (default: 30000) |
//! | `VALIDRUN_TOKEN` | Static bearer token |
//! | `VALIDRUN_TOKEN_URL` | Client-credentials token endpoint |
//! | `VALIDRUN_CLIENT_ID` / `VALIDRUN_CLIENT_SECRET` | Client-credentials pair |
//! | `VALIDRUN_TOKEN_SKEW_SECS` | Refresh this long before expiry (capped at half the token lifetime; default: 30) |
//! | `VALIDRUN_CACHE_TTL_SECS` | Descriptor cache TTL (default: 300) |
//! | `VALIDRUN_SUBMIT_RETRIES` | Extra submission cycles on transient failure (default: 1) |

pub mod auth;
pub mod cache;
pub mod client;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod orchestrator;
pub mod types;

// Re-export main types
pub use auth::{AuthConfig, AuthSession, ClientCredentials, Credential, StaticToken, TokenExchange};
pub use cache::MetadataCache;
pub use client::{Registry, RegistryClient, REGISTRY_USER_AGENT};
pub use error::{RegistryError, RegistryResult, RunError, RunFailure, ScoringError};
pub use fingerprint::Fingerprint;
pub use ledger::{Claim, ResultLedger};
pub use orchestrator::{Orchestrator, OrchestratorConfig, Scorer};
pub use types::{
    Descriptor, EntityKind, Metadata, ModelDescriptor, Parameters, RegistryConfig, ResultSummary,
    RunRecord, RunRequest, RunState, ScoreResult, ScoreValue, Submission, SubmitRequest,
    TestAlias, TestDescriptor,
};
