//! Pure helpers: endpoint URLs, backoff, header and body parsing (no HTTP, no status logic).

use std::time::Duration;

use rand::Rng;
use url::Url;

use crate::error::{RegistryError, RegistryResult};
use crate::types::{EntityKind, RegistryConfig};

/// Registry endpoints this client talks to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Endpoint<'a> {
    Models,
    Model(&'a str),
    Tests,
    Test(&'a str),
    Results,
    Result(&'a str),
}

impl Endpoint<'_> {
    /// Absolute URL under `base`. Ids are percent-encoded as single path segments.
    pub(crate) fn url(&self, base: &Url) -> RegistryResult<Url> {
        let mut url = base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| RegistryError::Config {
                message: format!("registry URL cannot be a base: {}", base),
            })?;
            segments.pop_if_empty();
            match *self {
                Self::Models => segments.extend(["models"]),
                Self::Model(id) => segments.extend(["models", id]),
                Self::Tests => segments.extend(["tests"]),
                Self::Test(id) => segments.extend(["tests", id]),
                Self::Results => segments.extend(["results"]),
                Self::Result(id) => segments.extend(["results", id]),
            };
        }
        Ok(url)
    }

    /// Error for a 404 on this endpoint.
    pub(crate) fn not_found(&self) -> RegistryError {
        match *self {
            Self::Model(id) => RegistryError::NotFound {
                kind: EntityKind::Model,
                id: id.to_string(),
            },
            Self::Test(id) => RegistryError::NotFound {
                kind: EntityKind::Test,
                id: id.to_string(),
            },
            Self::Result(id) => RegistryError::NotFound {
                kind: EntityKind::Result,
                id: id.to_string(),
            },
            Self::Models | Self::Tests | Self::Results => RegistryError::InvalidResponse {
                message: "collection endpoint not found (404)".to_string(),
            },
        }
    }
}

/// Parse the base URL from config.
pub(crate) fn parse_base_url(raw: &str) -> RegistryResult<Url> {
    let url = Url::parse(raw).map_err(|e| RegistryError::Config {
        message: format!("invalid registry URL {:?}: {}", raw, e),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RegistryError::Config {
            message: format!("unsupported registry URL scheme: {}", url.scheme()),
        });
    }
    Ok(url)
}

/// Delay before retry number `retry` (1-based) after `err`.
///
/// Retry-After from a 429 wins over the exponential schedule; both are capped
/// at `retry_max_delay_ms`. With jitter on, the exponential delay is drawn
/// uniformly from `[0, delay]` and Retry-After is scaled by 0.9..=1.1.
pub(crate) fn backoff_delay(retry: u32, err: &RegistryError, config: &RegistryConfig) -> Duration {
    let cap = Duration::from_millis(config.retry_max_delay_ms);

    if let RegistryError::RateLimited {
        retry_after: Some(retry_after),
    } = err
    {
        let capped = (*retry_after).min(cap);
        if !config.jitter {
            return capped;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.9_f64..=1.1_f64);
        let ms = ((capped.as_millis() as f64) * factor).round() as u64;
        return Duration::from_millis(ms).min(cap);
    }

    let exponent = retry.saturating_sub(1).min(20);
    let base = config.retry_base_delay_ms.saturating_mul(1_u64 << exponent);
    let delay = Duration::from_millis(base).min(cap);

    if config.jitter {
        Duration::from_millis(rand::thread_rng().gen_range(0..=delay.as_millis() as u64))
    } else {
        delay
    }
}

/// Retry-After in delta-seconds form.
pub(crate) fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Error detail from a response body: the JSON `detail`/`message`/`error`
/// field if present, else the first 200 characters of the body.
pub(crate) fn error_detail(body: &str, fallback: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        for field in ["detail", "message", "error"] {
            if let Some(text) = json.get(field).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    if body.trim().is_empty() {
        fallback.to_string()
    } else {
        body.chars().take(200).collect()
    }
}
