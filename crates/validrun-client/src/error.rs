//! Error types for the validation client.
//!
//! Three layers:
//! - [`RegistryError`]: everything the gateway and the auth session can fail with.
//! - [`ScoringError`]: what a [`Scorer`](crate::orchestrator::Scorer) reports.
//! - [`RunError`]: the only failures `execute` itself returns. Operational
//!   failures are recorded in the run as a [`RunFailure`] instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::EntityKind;

/// Registry and authentication errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// Credential exchange failed, was rejected, or a refreshed token was refused again.
    #[error("authentication failed: {message}")]
    Auth { message: String, rejected: bool },

    /// Registry answered 401. Consumed by the refresh-and-retry path.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Model or test does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Registry rejected the request as malformed (400).
    #[error("validation rejected by registry: {message}")]
    Validation { message: String },

    /// Rate limit exceeded (429).
    #[error("rate limited: retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Server-side failure (5xx).
    #[error("server error: HTTP {status}: {message}")]
    Server { status: u16, message: String },

    /// Request did not complete within its timeout.
    #[error("request timed out: {message}")]
    Timeout { message: String },

    /// Connection-level failure.
    #[error("network error: {message}")]
    Network { message: String },

    /// Retryable failure that persisted through every allowed attempt.
    #[error("transient registry failure after {attempts} attempts: {last}")]
    Transient { attempts: u32, last: String },

    /// Response could not be interpreted.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl RegistryError {
    /// Whether the error is retryable by the gateway's backoff loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Timeout { .. } | Self::Network { .. }
        )
    }

    /// Whether the error is the exhausted-retries transient class.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub(crate) fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
            rejected: false,
        }
    }

    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
            rejected: true,
        }
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                message: err.to_string(),
            }
        } else {
            Self::Network {
                message: err.to_string(),
            }
        }
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Failure reported by a scorer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("scoring failed: {message}")]
pub struct ScoringError {
    pub message: String,
}

impl ScoringError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors that fail `execute` outright instead of producing a run record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    /// Caller supplied a malformed run request.
    #[error("invalid run request: {reason}")]
    InvalidRequest { reason: String },

    /// A state transition the run state machine forbids.
    #[error("illegal run state transition: {from:?} -> {to:?}")]
    IllegalTransition {
        from: crate::types::RunState,
        to: crate::types::RunState,
    },
}

/// Why a run ended in `Failed`. Stored on the record and returned as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },

    #[error("registry rejected submission: {message}")]
    Validation { message: String },

    #[error("registry unavailable: {message}")]
    Transient { message: String },

    #[error("scoring failed: {message}")]
    Scoring { message: String },

    #[error("invalid registry response: {message}")]
    InvalidResponse { message: String },
}

impl From<&RegistryError> for RunFailure {
    fn from(err: &RegistryError) -> Self {
        match err {
            RegistryError::Auth { message, .. } | RegistryError::Unauthorized { message } => {
                Self::Auth {
                    message: message.clone(),
                }
            }
            RegistryError::NotFound { kind, id } => Self::NotFound {
                entity: *kind,
                id: id.clone(),
            },
            RegistryError::Validation { message } => Self::Validation {
                message: message.clone(),
            },
            RegistryError::InvalidResponse { message } | RegistryError::Config { message } => {
                Self::InvalidResponse {
                    message: message.clone(),
                }
            }
            // Retryable classes only reach here if a caller bypassed the retry loop.
            other => Self::Transient {
                message: other.to_string(),
            },
        }
    }
}

impl From<&ScoringError> for RunFailure {
    fn from(err: &ScoringError) -> Self {
        Self::Scoring {
            message: err.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(RegistryError::RateLimited { retry_after: None }.is_retryable());
        assert!(RegistryError::Server {
            status: 503,
            message: "down".into()
        }
        .is_retryable());
        assert!(RegistryError::Timeout {
            message: "slow".into()
        }
        .is_retryable());
        assert!(!RegistryError::Validation {
            message: "bad".into()
        }
        .is_retryable());
        assert!(!RegistryError::NotFound {
            kind: EntityKind::Model,
            id: "m".into()
        }
        .is_retryable());
        assert!(!RegistryError::Transient {
            attempts: 3,
            last: "x".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_run_failure_from_registry_error() {
        let failure = RunFailure::from(&RegistryError::NotFound {
            kind: EntityKind::Test,
            id: "t-1".into(),
        });
        assert_eq!(
            failure,
            RunFailure::NotFound {
                entity: EntityKind::Test,
                id: "t-1".into()
            }
        );

        let failure = RunFailure::from(&RegistryError::Transient {
            attempts: 3,
            last: "HTTP 503".into(),
        });
        assert!(matches!(failure, RunFailure::Transient { .. }));

        let failure = RunFailure::from(&RegistryError::rejected("revoked"));
        assert_eq!(
            failure,
            RunFailure::Auth {
                message: "revoked".into()
            }
        );
    }

    #[test]
    fn test_run_failure_serializes_with_kind_tag() {
        let failure = RunFailure::Scoring {
            message: "model crashed".into(),
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "scoring");
        assert_eq!(json["message"], "model crashed");
    }
}
