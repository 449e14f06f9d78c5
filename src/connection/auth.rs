//! Authentication handling for query service sessions.
//!
//! This module provides secure credential management, the bearer [`Token`]
//! type, and the [`TokenProvider`] that caches tokens and coalesces refreshes.

use crate::error::{AuthError, TransportError};
use crate::resilience::RetryPolicy;
use crate::transport::TokenSource;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Secure credentials container.
///
/// This struct ensures credentials are never accidentally logged or displayed.
#[derive(Clone)]
pub struct Credentials {
    client_id: String,
    client_secret: Arc<SecureString>,
    username: Option<String>,
    password: Option<Arc<SecureString>>,
}

impl Credentials {
    /// Create client credentials.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: Arc::new(SecureString::new(client_secret.into())),
            username: None,
            password: None,
        }
    }

    /// Add a user name and password, switching to the password grant.
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(Arc::new(SecureString::new(password.into())));
        self
    }

    /// Get the client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Get the user name, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Get the client secret (for internal use only).
    pub(crate) fn client_secret(&self) -> &str {
        self.client_secret.as_str()
    }

    /// Get the password (for internal use only).
    pub(crate) fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.as_str())
    }

    /// OAuth grant type matching these credentials.
    pub fn grant_type(&self) -> &'static str {
        if self.username.is_some() {
            "password"
        } else {
            "client_credentials"
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(username) => write!(
                f,
                "Credentials(client_id: {}, username: {})",
                self.client_id, username
            ),
            None => write!(f, "Credentials(client_id: {})", self.client_id),
        }
    }
}

/// Secure string that zeros memory on drop and never displays its contents.
struct SecureString {
    data: Vec<u8>,
}

impl SecureString {
    fn new(s: String) -> Self {
        Self {
            data: s.into_bytes(),
        }
    }

    fn as_str(&self) -> &str {
        std::str::from_utf8(&self.data).unwrap_or_default()
    }
}

impl Drop for SecureString {
    fn drop(&mut self) {
        for byte in &mut self.data {
            *byte = 0;
        }
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureString(<redacted>)")
    }
}

/// Bearer token for the query service.
///
/// Tokens are immutable; a refresh produces a new token.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    token_type: String,
    access_token: String,
    expires_at: DateTime<Utc>,
    instance_url: Option<String>,
}

impl Token {
    pub fn new(
        token_type: impl Into<String>,
        access_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token_type: token_type.into(),
            access_token: access_token.into(),
            expires_at,
            instance_url: None,
        }
    }

    /// A `Bearer` token.
    pub fn bearer(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self::new("Bearer", access_token, expires_at)
    }

    /// Set the service URL the token was issued for.
    pub fn with_instance_url(mut self, url: impl Into<String>) -> Self {
        self.instance_url = Some(url.into());
        self
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub(crate) fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn instance_url(&self) -> Option<&str> {
        self.instance_url.as_deref()
    }

    /// Whether the token is still usable `skew` before its expiry.
    pub fn is_fresh(&self, skew: Duration) -> bool {
        let skew = chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::zero());
        Utc::now() < self.expires_at - skew
    }

    /// Value of the `authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// Tenant the token was issued for, from the JWT `audienceTenantId` claim.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidResponse` if the token is not a JWT or the
    /// claim is missing.
    pub fn tenant_id(&self) -> Result<String, AuthError> {
        let payload = self
            .access_token
            .split('.')
            .nth(1)
            .ok_or_else(|| AuthError::InvalidResponse("token is not a JWT".to_string()))?;
        let decoded = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| AuthError::InvalidResponse(format!("invalid JWT payload: {}", e)))?;
        let claims: serde_json::Value = serde_json::from_slice(&decoded)
            .map_err(|e| AuthError::InvalidResponse(format!("invalid JWT claims: {}", e)))?;

        claims
            .get("audienceTenantId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AuthError::InvalidResponse("JWT has no audienceTenantId claim".to_string()))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("token_type", &self.token_type)
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("instance_url", &self.instance_url)
            .finish()
    }
}

/// Exchanges credentials for a token with an identity provider.
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    /// Perform one exchange.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Rejected` if the credentials were refused and
    /// `AuthError::ExchangeFailed` if the provider could not be reached.
    async fn exchange(&self, credentials: &Credentials) -> Result<Token, AuthError>;
}

type SharedExchange = Shared<BoxFuture<'static, Result<Arc<Token>, AuthError>>>;

/// Supplies valid bearer tokens.
///
/// The cached token is swapped atomically and never mutated. When it is
/// missing or about to expire, concurrent callers share a single exchange.
pub struct TokenProvider {
    exchange: Arc<dyn CredentialExchange>,
    credentials: Credentials,
    cached: Arc<ArcSwapOption<Token>>,
    in_flight: Mutex<Option<(u64, SharedExchange)>>,
    next_flight: AtomicU64,
    exchanges: Arc<AtomicU64>,
    skew: Duration,
    retry: RetryPolicy,
}

impl TokenProvider {
    /// Default refresh margin before expiry.
    pub const DEFAULT_SKEW: Duration = Duration::from_secs(60);

    pub fn new(exchange: Arc<dyn CredentialExchange>, credentials: Credentials) -> Self {
        Self {
            exchange,
            credentials,
            cached: Arc::new(ArcSwapOption::empty()),
            in_flight: Mutex::new(None),
            next_flight: AtomicU64::new(0),
            exchanges: Arc::new(AtomicU64::new(0)),
            skew: Self::DEFAULT_SKEW,
            retry: RetryPolicy::default()
                .with_max_attempts(4)
                .with_backoff(Duration::from_secs(1), Duration::from_secs(30)),
        }
    }

    /// Set the refresh margin before expiry.
    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Set the retry policy for failed exchanges.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Number of exchanges performed so far.
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::SeqCst)
    }

    /// The cached token, if it is still fresh.
    pub fn cached_token(&self) -> Option<Arc<Token>> {
        self.cached
            .load_full()
            .filter(|token| token.is_fresh(self.skew))
    }

    /// Return a token valid for at least the configured skew.
    ///
    /// # Errors
    ///
    /// Returns the exchange failure. Every caller waiting on the same exchange
    /// observes the same error.
    pub async fn get_token(&self) -> Result<Arc<Token>, AuthError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let (flight_id, flight) = {
            let mut in_flight = self.in_flight.lock();
            // Re-check under the lock: a flight may have finished meanwhile.
            if let Some(token) = self.cached_token() {
                return Ok(token);
            }
            match in_flight.as_ref() {
                Some((id, flight)) => (*id, flight.clone()),
                None => {
                    let id = self.next_flight.fetch_add(1, Ordering::SeqCst);
                    let flight = self.start_exchange();
                    *in_flight = Some((id, flight.clone()));
                    (id, flight)
                }
            }
        };

        let result = flight.await;

        let mut in_flight = self.in_flight.lock();
        if matches!(in_flight.as_ref(), Some((id, _)) if *id == flight_id) {
            *in_flight = None;
        }
        result
    }

    fn start_exchange(&self) -> SharedExchange {
        let exchange = Arc::clone(&self.exchange);
        let credentials = self.credentials.clone();
        let cached = Arc::clone(&self.cached);
        let exchanges = Arc::clone(&self.exchanges);
        let retry = self.retry.clone();

        async move {
            let mut attempt = 1;
            loop {
                exchanges.fetch_add(1, Ordering::SeqCst);
                debug!(client_id = credentials.client_id(), attempt, "Exchanging credentials for token");
                match exchange.exchange(&credentials).await {
                    Ok(token) => {
                        let token = Arc::new(token);
                        cached.store(Some(Arc::clone(&token)));
                        return Ok(token);
                    }
                    Err(AuthError::ExchangeFailed(message)) if retry.can_retry(attempt) => {
                        let delay = retry.backoff(attempt);
                        warn!(attempt, ?delay, error = %message, "Token exchange failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        cached.store(None);
                        return Err(e);
                    }
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Drop the cached token so the next call exchanges again.
    pub fn invalidate(&self) {
        self.cached.store(None);
    }

    /// Drop the cached token only if it is still `token`.
    ///
    /// A rejection of an old token must not discard a newer one.
    pub fn invalidate_token(&self, token: &Arc<Token>) {
        self.cached.rcu(|current| match current {
            Some(cached) if Arc::ptr_eq(cached, token) => None,
            other => other.clone(),
        });
    }
}

#[async_trait]
impl TokenSource for TokenProvider {
    async fn token(&self) -> Result<Arc<Token>, TransportError> {
        self.get_token().await.map_err(|e| match e {
            AuthError::ExchangeFailed(message) => TransportError::Unavailable(message),
            other => TransportError::Unauthenticated(other.to_string()),
        })
    }

    fn reject(&self, token: &Arc<Token>) {
        self.invalidate_token(token);
    }
}

impl fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProvider")
            .field("credentials", &self.credentials)
            .field("skew", &self.skew)
            .field("exchanges", &self.exchange_count())
            .finish()
    }
}

/// Hands out a fixed token; for pre-issued tokens and tests.
#[derive(Debug, Clone)]
pub struct StaticTokenExchange {
    token: Token,
}

impl StaticTokenExchange {
    pub fn new(token: Token) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialExchange for StaticTokenExchange {
    async fn exchange(&self, _credentials: &Credentials) -> Result<Token, AuthError> {
        Ok(self.token.clone())
    }
}
