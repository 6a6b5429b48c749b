#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    clippy::unused_self,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_extern_crates
)]

//! # Auth Module
//!
//! Holds the gateway's single bearer token to the upstream broker, refreshing
//! it ahead of expiry so every caller observes a valid token without racing
//! the refresh itself.
//!
//! States: `Unauthenticated -> Authenticating -> Authenticated -> Refreshing
//! -> Authenticated | Failed`. [`AuthModule::ensure_valid_token`] is the only
//! entry point callers need: it returns the cached token while it is still
//! fresh, coalesces concurrent callers onto one in-flight refresh, and
//! retries a failed login/refresh with backoff up to
//! [`AuthConfig::max_retry_attempts`] before bubbling up.

use std::env;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Username + key pair used to log in to the broker.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub key: String,
}

impl Credentials {
    /// Loads credentials from `GATEWAY_BROKER_USER` / `GATEWAY_BROKER_KEY`.
    pub fn from_env() -> Result<Self, AuthError> {
        let username = env::var("GATEWAY_BROKER_USER")
            .map_err(|_| AuthError::MissingCredentials("GATEWAY_BROKER_USER"))?;
        let key = env::var("GATEWAY_BROKER_KEY")
            .map_err(|_| AuthError::MissingCredentials("GATEWAY_BROKER_KEY"))?;
        Ok(Self { username, key })
    }
}

/// Result of a successful login or refresh call against the broker.
#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in_secs: i64,
}

/// Broker-specific login/refresh transport. Implementations wrap the actual
/// HTTP call; this module owns only the state machine and retry policy
/// around them.
#[async_trait]
pub trait BrokerLogin: Send + Sync {
    async fn login(&self, creds: &Credentials) -> Result<TokenResponse, AuthError>;
    async fn refresh(&self, access_token: &str) -> Result<TokenResponse, AuthError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credential env var {0}")]
    MissingCredentials(&'static str),
    #[error("login failed: {0}")]
    LoginFailed(String),
    #[error("refresh failed: {0}")]
    RefreshFailed(String),
    #[error("exhausted {attempts} retry attempt(s)")]
    MaxRetriesExceeded { attempts: u32 },
    #[error("not authenticated")]
    NotAuthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    Failed,
}

/// Tunables for the refresh/retry policy, matching the design defaults.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// How far ahead of `expiresAt` a refresh is triggered.
    pub refresh_buffer: StdDuration,
    pub max_retry_attempts: u32,
    pub backoff_base: StdDuration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: StdDuration::from_secs(5 * 60),
            max_retry_attempts: 5,
            backoff_base: StdDuration::from_millis(500),
        }
    }
}

/// `Authorization` header ready to attach to a REST call.
#[derive(Debug, Clone)]
pub struct AuthHeaders {
    pub authorization: String,
}

impl AuthHeaders {
    pub fn as_pairs(&self) -> Vec<(&'static str, &str)> {
        vec![("Authorization", self.authorization.as_str())]
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<String, AuthError>>>;

struct Inner {
    state: AuthState,
    token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    in_flight: Option<SharedRefresh>,
}

/// The auth state machine, generic over the broker's login transport so
/// tests can swap in a fake.
pub struct AuthModule<B> {
    broker: Arc<B>,
    creds: Credentials,
    config: AuthConfig,
    inner: Arc<RwLock<Inner>>,
}

impl<B> std::fmt::Debug for AuthModule<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthModule")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B> Clone for AuthModule<B> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            creds: self.creds.clone(),
            config: self.config.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<B> AuthModule<B>
where
    B: BrokerLogin + 'static,
{
    pub fn new(broker: B, creds: Credentials, config: AuthConfig) -> Self {
        Self {
            broker: Arc::new(broker),
            creds,
            config,
            inner: Arc::new(RwLock::new(Inner {
                state: AuthState::Unauthenticated,
                token: None,
                expires_at: None,
                in_flight: None,
            })),
        }
    }

    pub async fn state(&self) -> AuthState {
        self.inner.read().await.state
    }

    /// Returns a valid bearer token, logging in or refreshing as needed.
    /// Concurrent callers observing an expiring token coalesce onto the same
    /// in-flight refresh rather than each starting their own.
    pub async fn ensure_valid_token(&self) -> Result<String, AuthError> {
        {
            let guard = self.inner.read().await;
            if let (Some(token), Some(expires_at)) = (&guard.token, guard.expires_at) {
                let refresh_at = expires_at
                    - chrono::Duration::from_std(self.config.refresh_buffer)
                        .unwrap_or(chrono::Duration::zero());
                if Utc::now() < refresh_at {
                    return Ok(token.clone());
                }
            }
        }
        self.refresh_or_login().await
    }

    pub async fn auth_headers(&self) -> Result<AuthHeaders, AuthError> {
        let token = self.ensure_valid_token().await?;
        Ok(AuthHeaders {
            authorization: format!("Bearer {token}"),
        })
    }

    async fn refresh_or_login(&self) -> Result<String, AuthError> {
        let shared = {
            let mut guard = self.inner.write().await;
            if let (Some(token), Some(expires_at)) = (&guard.token, guard.expires_at) {
                let refresh_at = expires_at
                    - chrono::Duration::from_std(self.config.refresh_buffer)
                        .unwrap_or(chrono::Duration::zero());
                if Utc::now() < refresh_at {
                    return Ok(token.clone());
                }
            }
            if let Some(existing) = guard.in_flight.clone() {
                existing
            } else {
                let had_token = guard.token.is_some();
                guard.state = if had_token {
                    AuthState::Refreshing
                } else {
                    AuthState::Authenticating
                };
                let this = self.clone();
                let fut: BoxFuture<'static, Result<String, AuthError>> =
                    async move { this.retry_loop(had_token).await }.boxed();
                let shared = fut.shared();
                guard.in_flight = Some(shared.clone());
                shared
            }
        };

        let result = shared.await;

        let mut guard = self.inner.write().await;
        guard.in_flight = None;
        result
    }

    /// Retries login/refresh with linear backoff (`backoff_base * attempt`)
    /// up to `max_retry_attempts`, then gives up.
    async fn retry_loop(&self, is_refresh: bool) -> Result<String, AuthError> {
        let mut last_err = None;
        for attempt in 1..=self.config.max_retry_attempts {
            let outcome = if is_refresh {
                let current = self.inner.read().await.token.clone();
                match current {
                    Some(token) => self.broker.refresh(&token).await,
                    None => self.broker.login(&self.creds).await,
                }
            } else {
                self.broker.login(&self.creds).await
            };

            match outcome {
                Ok(response) => {
                    let expires_at =
                        Utc::now() + chrono::Duration::seconds(response.expires_in_secs);
                    let mut guard = self.inner.write().await;
                    guard.token = Some(response.access_token.clone());
                    guard.expires_at = Some(expires_at);
                    guard.state = AuthState::Authenticated;
                    info!(attempt, is_refresh, "auth token obtained");
                    return Ok(response.access_token);
                }
                Err(err) => {
                    warn!(attempt, %err, is_refresh, "auth attempt failed");
                    last_err = Some(err);
                    if attempt < self.config.max_retry_attempts {
                        let backoff = self.config.backoff_base * attempt;
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        let mut guard = self.inner.write().await;
        guard.state = AuthState::Failed;
        debug!(attempts = self.config.max_retry_attempts, "auth retries exhausted");
        let _ = last_err;
        Err(AuthError::MaxRetriesExceeded {
            attempts: self.config.max_retry_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyBroker {
        login_calls: AtomicUsize,
        fail_first_n: usize,
    }

    #[async_trait]
    impl BrokerLogin for FlakyBroker {
        async fn login(&self, _creds: &Credentials) -> Result<TokenResponse, AuthError> {
            let call = self.login_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first_n {
                return Err(AuthError::LoginFailed("upstream unavailable".into()));
            }
            Ok(TokenResponse {
                access_token: format!("token-{call}"),
                expires_in_secs: 3600,
            })
        }

        async fn refresh(&self, _access_token: &str) -> Result<TokenResponse, AuthError> {
            Ok(TokenResponse {
                access_token: "refreshed".into(),
                expires_in_secs: 3600,
            })
        }
    }

    fn creds() -> Credentials {
        Credentials {
            username: "bot".into(),
            key: "key".into(),
        }
    }

    #[tokio::test]
    async fn ensure_valid_token_logs_in_from_unauthenticated() {
        let broker = FlakyBroker {
            login_calls: AtomicUsize::new(0),
            fail_first_n: 0,
        };
        let auth = AuthModule::new(broker, creds(), AuthConfig::default());
        let token = auth.ensure_valid_token().await.unwrap();
        assert_eq!(token, "token-0");
        assert_eq!(auth.state().await, AuthState::Authenticated);
    }

    #[tokio::test]
    async fn cached_token_is_reused_without_another_login() {
        let broker = FlakyBroker {
            login_calls: AtomicUsize::new(0),
            fail_first_n: 0,
        };
        let auth = AuthModule::new(broker, creds(), AuthConfig::default());
        let first = auth.ensure_valid_token().await.unwrap();
        let second = auth.ensure_valid_token().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(auth.broker.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_coalesce_onto_one_login() {
        let broker = FlakyBroker {
            login_calls: AtomicUsize::new(0),
            fail_first_n: 0,
        };
        let auth = AuthModule::new(broker, creds(), AuthConfig::default());

        let a = auth.clone();
        let b = auth.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { a.ensure_valid_token().await }),
            tokio::spawn(async move { b.ensure_valid_token().await }),
        );
        assert_eq!(r1.unwrap().unwrap(), r2.unwrap().unwrap());
        assert_eq!(auth.broker.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let broker = FlakyBroker {
            login_calls: AtomicUsize::new(0),
            fail_first_n: 2,
        };
        let config = AuthConfig {
            backoff_base: StdDuration::from_millis(1),
            ..AuthConfig::default()
        };
        let auth = AuthModule::new(broker, creds(), config);
        let token = auth.ensure_valid_token().await.unwrap();
        assert_eq!(token, "token-2");
    }

    #[tokio::test]
    async fn exhausting_retries_reports_failed_state() {
        let broker = FlakyBroker {
            login_calls: AtomicUsize::new(0),
            fail_first_n: 100,
        };
        let config = AuthConfig {
            max_retry_attempts: 3,
            backoff_base: StdDuration::from_millis(1),
            ..AuthConfig::default()
        };
        let auth = AuthModule::new(broker, creds(), config);
        let err = auth.ensure_valid_token().await.unwrap_err();
        assert_eq!(err, AuthError::MaxRetriesExceeded { attempts: 3 });
        assert_eq!(auth.state().await, AuthState::Failed);
    }

    #[tokio::test]
    async fn auth_headers_are_bearer_formatted() {
        let broker = FlakyBroker {
            login_calls: AtomicUsize::new(0),
            fail_first_n: 0,
        };
        let auth = AuthModule::new(broker, creds(), AuthConfig::default());
        let headers = auth.auth_headers().await.unwrap();
        assert!(headers.authorization.starts_with("Bearer token-"));
    }
}
