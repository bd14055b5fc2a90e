//! Bearer-token authentication against the identity provider.
//!
//! [`AuthSession`] holds the current [`Credential`] and hands out a valid one
//! on demand. Refreshes go through a [`TokenExchange`]:
//! - [`StaticToken`]: a pre-issued token (from config or env), never expires
//! - [`ClientCredentials`]: OAuth2 client-credentials exchange at a token endpoint
//!
//! Refresh is serialized: the held credential sits behind an async mutex that
//! stays locked for the duration of an exchange, so concurrent callers wait
//! for the single in-flight refresh and then observe its outcome.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::types::env_parse;

/// Bearer token plus its expiry. Only leaves the session as a header value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: Option<Instant>,
    /// Upper bound on the refresh reserve, half the issued lifetime.
    max_skew: Duration,
}

impl Credential {
    /// Credential valid for `ttl` from now.
    ///
    /// A lifetime too large to represent as an `Instant` never expires.
    pub fn new(token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            token: token.into(),
            expires_at: Instant::now().checked_add(ttl),
            max_skew: ttl / 2,
        }
    }

    /// Credential without an expiry.
    pub fn non_expiring(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
            max_skew: Duration::ZERO,
        }
    }

    /// Value for the `Authorization` header.
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Whether the credential is still usable, keeping `skew` in reserve.
    ///
    /// The reserve never exceeds half the credential's lifetime, so a token
    /// issued for less than `skew` is still used until its midpoint.
    pub fn is_valid(&self, skew: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(at) => at.saturating_duration_since(Instant::now()) > skew.min(self.max_skew),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// One authentication exchange with the identity boundary.
#[async_trait]
pub trait TokenExchange: Send + Sync + fmt::Debug {
    async fn exchange(&self, timeout: Duration) -> RegistryResult<Credential>;
}

/// Pre-issued token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

#[async_trait]
impl TokenExchange for StaticToken {
    async fn exchange(&self, _timeout: Duration) -> RegistryResult<Credential> {
        Ok(Credential::non_expiring(self.0.clone()))
    }
}

/// Token endpoint response.
#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    token_type: Option<String>,
}

/// OAuth2 client-credentials exchange.
#[derive(Clone)]
pub struct ClientCredentials {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl ClientCredentials {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenExchange for ClientCredentials {
    async fn exchange(&self, timeout: Duration) -> RegistryResult<Credential> {
        let response = self
            .client
            .post(&self.token_url)
            .timeout(timeout)
            .json(&serde_json::json!({
                "grant_type": "client_credentials",
                "client_id": self.client_id,
                "client_secret": self.client_secret,
            }))
            .send()
            .await
            .map_err(|e| RegistryError::auth(format!("token request failed: {}", e)))?;

        let status = response.status();

        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::rejected(format!(
                "identity provider rejected credentials: HTTP {} - {}",
                status, body
            )));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::auth(format!(
                "token exchange failed: HTTP {} - {}",
                status, body
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            RegistryError::auth(format!("failed to parse token response: {}", e))
        })?;

        info!(
            expires_in = token.expires_in,
            token_type = token.token_type.as_deref().unwrap_or("Bearer"),
            "obtained registry access token"
        );

        Ok(Credential::new(
            token.access_token,
            Duration::from_secs(token.expires_in),
        ))
    }
}

/// Where credentials come from.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Pre-issued bearer token.
    pub token: Option<String>,

    /// Token endpoint for the client-credentials exchange.
    pub token_url: Option<String>,

    pub client_id: Option<String>,

    pub client_secret: Option<String>,

    /// Treat credentials as expired this long before their real expiry.
    pub expiry_skew: Duration,
}

impl AuthConfig {
    /// Read from environment.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `VALIDRUN_TOKEN` | Static bearer token |
    /// | `VALIDRUN_TOKEN_URL` | Identity provider token endpoint |
    /// | `VALIDRUN_CLIENT_ID` | Client id for the exchange |
    /// | `VALIDRUN_CLIENT_SECRET` | Client secret for the exchange |
    /// | `VALIDRUN_TOKEN_SKEW_SECS` | Expiry safety margin (default: 30) |
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            token: non_empty("VALIDRUN_TOKEN"),
            token_url: non_empty("VALIDRUN_TOKEN_URL"),
            client_id: non_empty("VALIDRUN_CLIENT_ID"),
            client_secret: non_empty("VALIDRUN_CLIENT_SECRET"),
            expiry_skew: Duration::from_secs(env_parse("VALIDRUN_TOKEN_SKEW_SECS").unwrap_or(30)),
        }
    }

    /// Pick the exchange this config describes.
    ///
    /// Client credentials win over a static token when both are present.
    pub fn exchange(&self) -> RegistryResult<Arc<dyn TokenExchange>> {
        if let (Some(url), Some(id), Some(secret)) =
            (&self.token_url, &self.client_id, &self.client_secret)
        {
            return Ok(Arc::new(ClientCredentials::new(url, id, secret)));
        }
        if let Some(token) = &self.token {
            return Ok(Arc::new(StaticToken::new(token)));
        }
        Err(RegistryError::Config {
            message: "no credentials configured: set VALIDRUN_TOKEN or VALIDRUN_TOKEN_URL/VALIDRUN_CLIENT_ID/VALIDRUN_CLIENT_SECRET".into(),
        })
    }
}

/// Holds the session credential and refreshes it on demand.
#[derive(Debug, Clone)]
pub struct AuthSession {
    exchange: Arc<dyn TokenExchange>,
    held: Arc<Mutex<Option<Credential>>>,
    skew: Duration,
    exchanges: Arc<AtomicU64>,
}

impl AuthSession {
    pub fn new(exchange: Arc<dyn TokenExchange>) -> Self {
        Self {
            exchange,
            held: Arc::new(Mutex::new(None)),
            skew: Duration::from_secs(30),
            exchanges: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_config(config: &AuthConfig) -> RegistryResult<Self> {
        Ok(Self::new(config.exchange()?).with_expiry_skew(config.expiry_skew))
    }

    /// Session backed by a static token.
    pub fn static_token(token: impl Into<String>) -> Self {
        Self::new(Arc::new(StaticToken::new(token)))
    }

    pub fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Number of exchanges performed so far (initial acquisition included).
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::SeqCst)
    }

    /// A non-expired credential, refreshing if the held one is absent or stale.
    pub async fn credential(&self, timeout: Duration) -> RegistryResult<Credential> {
        let mut held = self.held.lock().await;

        if let Some(current) = held.as_ref() {
            if current.is_valid(self.skew) {
                return Ok(current.clone());
            }
            debug!("held credential expired, refreshing");
        }

        self.refresh_locked(&mut held, timeout).await
    }

    /// Refresh after the registry answered 401 to `rejected`.
    ///
    /// A registry 401 on a credential we considered valid is a revocation: the
    /// held copy is dropped before the exchange, so a failed exchange leaves
    /// no credential behind. If another caller already replaced `rejected`,
    /// that newer credential is returned without a second exchange.
    pub async fn refresh_rejected(
        &self,
        rejected: &Credential,
        timeout: Duration,
    ) -> RegistryResult<Credential> {
        let mut held = self.held.lock().await;

        if let Some(current) = held.as_ref() {
            if current != rejected && current.is_valid(self.skew) {
                debug!("credential already refreshed by another caller");
                return Ok(current.clone());
            }
        }

        warn!("registry rejected credential, discarding and refreshing");
        *held = None;
        self.refresh_locked(&mut held, timeout).await
    }

    /// Drop the held credential.
    pub async fn clear(&self) {
        *self.held.lock().await = None;
    }

    async fn refresh_locked(
        &self,
        held: &mut Option<Credential>,
        timeout: Duration,
    ) -> RegistryResult<Credential> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);

        match self.exchange.exchange(timeout).await {
            Ok(fresh) => {
                *held = Some(fresh.clone());
                Ok(fresh)
            }
            Err(e) => {
                if matches!(e, RegistryError::Auth { rejected: true, .. }) {
                    *held = None;
                }
                warn!(error = %e, "credential refresh failed");
                Err(e)
            }
        }
    }
}
