//! Run orchestration: resolve, score, submit.
//!
//! [`Orchestrator::execute`] turns a [`RunRequest`] into a [`RunRecord`] that
//! ends in `Submitted` or `Failed`. Operational failures are returned as data
//! on the record; only a malformed request fails the call itself.
//!
//! # Idempotency
//!
//! Runs are keyed by the fingerprint of (model, test, parameters). While an
//! `execute` call runs it holds the ledger claim for that fingerprint, so
//! concurrent calls for the same inputs queue behind it and then see its
//! result:
//!
//! | Latest record for the fingerprint | Behaviour |
//! |-----------------------------------|-----------|
//! | none | fresh run |
//! | `Submitted` | returned unchanged, nothing is called |
//! | `Pending` / `Scored` / `Submitting` | left by a cancelled call; resumed from that state |
//! | `Failed` with a score | new run reusing the score and idempotency key |
//! | `Failed` without a score | fresh run |
//!
//! Every transition is written to the ledger only after the step that
//! justifies it has finished, so dropping an `execute` future leaves the
//! record at its last completed state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{MetadataCache, DEFAULT_TTL};
use crate::client::Registry;
use crate::error::{RegistryError, RunError, RunFailure, ScoringError};
use crate::fingerprint::Fingerprint;
use crate::ledger::ResultLedger;
use crate::types::{
    env_parse, Descriptor, EntityKind, ModelDescriptor, Parameters, RunRecord, RunRequest,
    RunState, ScoreResult, SubmitRequest, TestDescriptor,
};

/// Produces a score for a model under a test. Retry policy, if any, is the scorer's own.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(
        &self,
        model: &ModelDescriptor,
        test: &TestDescriptor,
        parameters: &Parameters,
    ) -> Result<ScoreResult, ScoringError>;
}

#[async_trait]
impl<T: Scorer + ?Sized> Scorer for Arc<T> {
    async fn score(
        &self,
        model: &ModelDescriptor,
        test: &TestDescriptor,
        parameters: &Parameters,
    ) -> Result<ScoreResult, ScoringError> {
        (**self).score(model, test, parameters).await
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long resolved descriptors stay cached.
    pub cache_ttl: Duration,

    /// Extra submission cycles after the gateway exhausts its own retries.
    pub submit_outer_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_TTL,
            submit_outer_retries: 1,
        }
    }
}

impl OrchestratorConfig {
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `VALIDRUN_CACHE_TTL_SECS` | Descriptor cache TTL (default: 300) |
    /// | `VALIDRUN_SUBMIT_RETRIES` | Outer submission retries (default: 1) |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_ttl: env_parse("VALIDRUN_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            submit_outer_retries: env_parse("VALIDRUN_SUBMIT_RETRIES")
                .unwrap_or(defaults.submit_outer_retries),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_submit_outer_retries(mut self, retries: u32) -> Self {
        self.submit_outer_retries = retries;
        self
    }
}

/// Drives runs from request to submitted result.
#[derive(Debug)]
pub struct Orchestrator<R, S> {
    registry: R,
    scorer: S,
    cache: MetadataCache,
    ledger: ResultLedger,
    config: OrchestratorConfig,
}

impl<R: Registry, S: Scorer> Orchestrator<R, S> {
    pub fn new(registry: R, scorer: S, config: OrchestratorConfig) -> Self {
        Self {
            registry,
            scorer,
            cache: MetadataCache::new(),
            ledger: ResultLedger::new(),
            config,
        }
    }

    /// Use a cache shared with other orchestrators.
    pub fn with_cache(mut self, cache: MetadataCache) -> Self {
        self.cache = cache;
        self
    }

    /// Use a ledger shared with other orchestrators.
    pub fn with_ledger(mut self, ledger: ResultLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    pub fn ledger(&self) -> &ResultLedger {
        &self.ledger
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Current record for a run, in flight or finished.
    pub async fn status(&self, run_id: Uuid) -> Option<RunRecord> {
        self.ledger.get(run_id).await
    }

    /// Run `request` to a terminal record. `timeout` bounds each network call.
    pub async fn execute(
        &self,
        request: RunRequest,
        timeout: Duration,
    ) -> Result<RunRecord, RunError> {
        request.validate()?;

        let fingerprint = request.fingerprint();
        let _claim = self.ledger.claim(&fingerprint).await;

        let mut record = match self.ledger.find(&fingerprint).await {
            Some(existing) if existing.state == RunState::Submitted => {
                info!(
                    run_id = %existing.run_id,
                    submission_id = existing.submission_id.as_deref().unwrap_or(""),
                    "run already submitted, returning existing record"
                );
                return Ok(existing);
            }
            Some(existing) if !existing.is_terminal() => {
                info!(run_id = %existing.run_id, state = %existing.state, "resuming interrupted run");
                existing
            }
            Some(failed) => self.start_after_failure(&request, fingerprint, failed).await?,
            None => self.start(&request, fingerprint).await,
        };

        if record.state == RunState::Pending {
            let (model, test) = match self.resolve(&request, timeout).await {
                Ok(pair) => pair,
                Err(e) => return self.finish_failed(record, RunFailure::from(&e)).await,
            };

            debug!(run_id = %record.run_id, scoring_method = %test.scoring_method, "invoking scorer");
            match self.scorer.score(&model, &test, &request.parameters).await {
                Ok(score) => {
                    record.test_id = test.id;
                    record.score = Some(score);
                    record.advance(RunState::Scored)?;
                    self.commit(&record).await;
                }
                Err(e) => return self.finish_failed(record, RunFailure::from(&e)).await,
            }
        }

        self.submit(record, timeout).await
    }

    async fn start(&self, request: &RunRequest, fingerprint: Fingerprint) -> RunRecord {
        let record = RunRecord::pending(request, fingerprint);
        debug!(
            run_id = %record.run_id,
            model_id = %record.model_id,
            test_id = %record.test_id,
            "created run"
        );
        self.commit(&record).await;
        record
    }

    /// New run after a failed one. A score that was already produced is reused
    /// together with its idempotency key, so a submission that did land before
    /// the failure is deduplicated by the registry.
    async fn start_after_failure(
        &self,
        request: &RunRequest,
        fingerprint: Fingerprint,
        failed: RunRecord,
    ) -> Result<RunRecord, RunError> {
        let mut record = RunRecord::pending(request, fingerprint);

        if let Some(score) = failed.score {
            info!(
                run_id = %record.run_id,
                previous_run_id = %failed.run_id,
                "retrying submission of previously scored run"
            );
            record.idempotency_key = failed.idempotency_key;
            record.test_id = failed.test_id;
            record.score = Some(score);
            record.advance(RunState::Scored)?;
        } else {
            debug!(previous_run_id = %failed.run_id, "previous run failed before scoring");
        }

        self.commit(&record).await;
        Ok(record)
    }

    async fn resolve(
        &self,
        request: &RunRequest,
        timeout: Duration,
    ) -> Result<(ModelDescriptor, TestDescriptor), RegistryError> {
        let registry = &self.registry;
        let ttl = self.config.cache_ttl;

        let model_id = request.model_id.as_str();
        let model = self
            .cache
            .get_or_fetch(EntityKind::Model, model_id, ttl, move || async move {
                registry
                    .fetch_model(model_id, timeout)
                    .await
                    .map(Descriptor::from)
            })
            .await?;

        // Alias lookups are cached under the alias key, not the resolved id.
        let test_key = request.test_key();
        let test_ref = test_key.as_str();
        let alias = request
            .test_alias
            .as_ref()
            .filter(|_| request.test_id.trim().is_empty());
        let test = self
            .cache
            .get_or_fetch(EntityKind::Test, test_ref, ttl, move || async move {
                let test = match alias {
                    Some(a) => registry.fetch_test_by_alias(&a.alias, &a.version, timeout).await,
                    None => registry.fetch_test(test_ref, timeout).await,
                };
                test.map(Descriptor::from)
            })
            .await?;

        match (model, test) {
            (Descriptor::Model(model), Descriptor::Test(test)) => Ok((model, test)),
            _ => Err(RegistryError::InvalidResponse {
                message: "descriptor kind mismatch in metadata cache".to_string(),
            }),
        }
    }

    /// Submit the scored record, with up to `submit_outer_retries` extra cycles
    /// on transient failure.
    async fn submit(&self, mut record: RunRecord, timeout: Duration) -> Result<RunRecord, RunError> {
        let Some(score) = record.score.clone() else {
            return Err(RunError::IllegalTransition {
                from: record.state,
                to: RunState::Submitting,
            });
        };

        if record.state == RunState::Scored {
            record.advance(RunState::Submitting)?;
            self.commit(&record).await;
        }

        let request = SubmitRequest {
            run_id: record.run_id,
            model_id: record.model_id.clone(),
            test_id: record.test_id.clone(),
            score,
            idempotency_key: record.idempotency_key.clone(),
        };

        let max_cycles = 1 + self.config.submit_outer_retries;
        let mut cycle = 0;

        loop {
            cycle += 1;
            record.attempt_count += 1;

            match self.registry.submit_result(&request, timeout).await {
                Ok(submission) => {
                    record.submission_id = Some(submission.submission_id);
                    record.advance(RunState::Submitted)?;
                    self.commit(&record).await;
                    info!(
                        run_id = %record.run_id,
                        submission_id = record.submission_id.as_deref().unwrap_or(""),
                        attempts = record.attempt_count,
                        "run submitted"
                    );
                    return Ok(record);
                }
                Err(e) if e.is_transient() && cycle < max_cycles => {
                    warn!(
                        run_id = %record.run_id,
                        error = %e,
                        cycle,
                        max_cycles,
                        "submission failed transiently, retrying"
                    );
                }
                Err(e) => return self.finish_failed(record, RunFailure::from(&e)).await,
            }
        }
    }

    async fn finish_failed(
        &self,
        mut record: RunRecord,
        reason: RunFailure,
    ) -> Result<RunRecord, RunError> {
        warn!(
            run_id = %record.run_id,
            from = %record.state,
            reason = %reason,
            "run failed"
        );
        record.fail(reason)?;
        self.commit(&record).await;
        Ok(record)
    }

    async fn commit(&self, record: &RunRecord) {
        debug!(run_id = %record.run_id, state = %record.state, "committing run state");
        self.ledger.upsert(record.clone()).await;
    }
}
