//! Input fingerprints for the result ledger.
//!
//! A fingerprint identifies "the same run" across caller retries: same model,
//! same test, same parameters. Parameters are a `BTreeMap` and `serde_json`
//! objects are key-ordered, so the canonical JSON is stable.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::Parameters;

/// `sha256:<hex>` digest of `{modelId, testId, parameters}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(model_id: &str, test_id: &str, parameters: &Parameters) -> Self {
        let canonical = serde_json::json!({
            "modelId": model_id,
            "testId": test_id,
            "parameters": parameters,
        });
        // Serializing a `Value` cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        Self(sha256_hex_bytes(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn sha256_hex_bytes(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}
