//! In-process result ledger.
//!
//! Indexes run records by run id and by input fingerprint. The fingerprint
//! index backs the idempotency check: a caller retrying a run it already
//! submitted gets the existing record back instead of a second submission.
//!
//! Nothing here survives a process restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::fingerprint::Fingerprint;
use crate::types::{Parameters, RunRecord};

#[derive(Debug, Default)]
struct LedgerIndex {
    runs: HashMap<Uuid, RunRecord>,
    /// Latest run for each fingerprint.
    latest: HashMap<Fingerprint, Uuid>,
}

/// Exclusive right to create or advance runs for one fingerprint.
///
/// Held by the orchestrator for the whole of an `execute` call.
#[derive(Debug)]
pub struct Claim {
    fingerprint: Fingerprint,
    guard: Option<OwnedMutexGuard<()>>,
    claims: ClaimMap,
}

impl Claim {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The map's handle is the last one unless another caller is waiting.
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if claims
            .get(&self.fingerprint)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            claims.remove(&self.fingerprint);
        }
    }
}

/// Per-fingerprint claim locks. Only touched outside of awaits.
type ClaimMap = Arc<StdMutex<HashMap<Fingerprint, Arc<Mutex<()>>>>>;

/// Shared run index.
#[derive(Debug, Clone, Default)]
pub struct ResultLedger {
    index: Arc<RwLock<LedgerIndex>>,
    claims: ClaimMap,
}

impl ResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the claim on `fingerprint`.
    pub async fn claim(&self, fingerprint: &Fingerprint) -> Claim {
        let lock = {
            let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
            // Locks left by cancelled waiters have no other holder.
            claims.retain(|_, lock| Arc::strong_count(lock) > 1);
            claims.entry(fingerprint.clone()).or_default().clone()
        };
        Claim {
            fingerprint: fingerprint.clone(),
            guard: Some(lock.lock_owned().await),
            claims: self.claims.clone(),
        }
    }

    #[cfg(test)]
    fn claim_locks(&self) -> usize {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Latest record for a fingerprint.
    pub async fn find(&self, fingerprint: &Fingerprint) -> Option<RunRecord> {
        let index = self.index.read().await;
        index
            .latest
            .get(fingerprint)
            .and_then(|run_id| index.runs.get(run_id))
            .cloned()
    }

    /// Latest record for a (model, test, parameters) triple.
    pub async fn find_for(
        &self,
        model_id: &str,
        test_id: &str,
        parameters: &Parameters,
    ) -> Option<RunRecord> {
        self.find(&Fingerprint::compute(model_id, test_id, parameters))
            .await
    }

    /// Record by run id.
    pub async fn get(&self, run_id: Uuid) -> Option<RunRecord> {
        self.index.read().await.runs.get(&run_id).cloned()
    }

    /// Insert or replace a record, pointing its fingerprint at it.
    ///
    /// Both indexes change under one write lock.
    pub async fn upsert(&self, record: RunRecord) {
        let mut index = self.index.write().await;
        index
            .latest
            .insert(record.fingerprint.clone(), record.run_id);
        index.runs.insert(record.run_id, record);
    }

    /// All records, in no particular order.
    pub async fn records(&self) -> Vec<RunRecord> {
        self.index.read().await.runs.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.runs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
