//! Bearer token acquisition and caching.
//!
//! Each datacenter owns one [`TokenProvider`]. The HTTP implementation keeps
//! the last token for its TTL and serializes renewals, so a burst of callers
//! hitting an expired token triggers a single call to the auth endpoint.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DeployError, Result};
use crate::loadbalancer::{LoadBalancer, LoadBalancingPolicy, UnavailableReason};

/// Path appended to every auth URL.
pub const AUTH_PATH: &str = "/v1/auth";

#[async_trait]
pub trait TokenProvider: Send + Sync + std::fmt::Debug {
    /// Current token, renewing it if missing or expired.
    async fn token(&self) -> Result<String>;

    /// Force a renewal because `stale` was rejected. If another caller has
    /// already replaced it, the newer token is returned without renewing.
    async fn renew(&self, stale: &str) -> Result<String>;

    /// Drop any cached token.
    fn invalidate(&self);

    fn describe(&self) -> TokenStatus;
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub kind: String,
    pub cached: bool,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_in_secs: Option<u64>,
    pub renewals: u64,
}

/// Fixed token supplied by configuration.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn renew(&self, _stale: &str) -> Result<String> {
        Ok(self.token.clone())
    }

    fn invalidate(&self) {}

    fn describe(&self) -> TokenStatus {
        TokenStatus {
            kind: "static".to_string(),
            cached: true,
            issued_at: None,
            expires_in_secs: None,
            renewals: 0,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(rename = "authToken")]
    auth_token: String,
}

struct CachedToken {
    value: String,
    issued_at: Instant,
    issued_at_utc: DateTime<Utc>,
}

/// Outcome of one request against one auth URL.
enum AuthAttempt {
    Issued(String),
    /// The endpoint answered and refused; other URLs will refuse too.
    Rejected(String),
    /// Network failure or 5xx; the next URL may work.
    Unreachable(String),
}

pub struct HttpTokenProvider {
    client: Client,
    credentials: Credentials,
    auth_urls: LoadBalancer<String>,
    ttl: Duration,
    max_attempts: u32,
    cache: RwLock<Option<CachedToken>>,
    renewal: Mutex<()>,
    renewals: AtomicU64,
}

impl std::fmt::Debug for HttpTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTokenProvider")
            .field("credentials", &self.credentials)
            .field("auth_urls", &self.auth_urls)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl HttpTokenProvider {
    pub fn new(
        name: &str,
        client: Client,
        credentials: Credentials,
        auth_urls: Vec<String>,
        ttl: Duration,
        max_attempts: u32,
    ) -> Result<Self> {
        let urls = auth_urls.into_iter().map(|url| (url.clone(), url)).collect();
        let auth_urls = LoadBalancer::evenly_weighted(format!("{}/auth", name), LoadBalancingPolicy::RoundRobin, urls)?;
        Ok(Self {
            client,
            credentials,
            auth_urls,
            ttl,
            max_attempts: max_attempts.max(1),
            cache: RwLock::new(None),
            renewal: Mutex::new(()),
            renewals: AtomicU64::new(0),
        })
    }

    /// Number of successful renewals since construction.
    pub fn renewals(&self) -> u64 {
        self.renewals.load(Ordering::SeqCst)
    }

    fn cached_if_fresh(&self) -> Option<String> {
        let cache = self.cache.read();
        cache
            .as_ref()
            .filter(|c| c.issued_at.elapsed() < self.ttl)
            .map(|c| c.value.clone())
    }

    /// Caller must hold `self.renewal`.
    async fn renew_locked(&self) -> Result<String> {
        let attempts = self.max_attempts.max(self.auth_urls.len() as u32);
        let mut last_error = String::from("no auth endpoint reachable");

        for attempt in 1..=attempts {
            // Every URL failed once; give them another round while budget remains.
            let url = match self.auth_urls.next() {
                Ok(url) => url,
                Err(_) => {
                    self.auth_urls.reset_all();
                    self.auth_urls.next()?
                }
            };
            debug!("Renewing token against {} (attempt {}/{})", url, attempt, attempts);

            match self.request_token(&url).await {
                AuthAttempt::Issued(token) => {
                    *self.cache.write() = Some(CachedToken {
                        value: token.clone(),
                        issued_at: Instant::now(),
                        issued_at_utc: Utc::now(),
                    });
                    self.renewals.fetch_add(1, Ordering::SeqCst);
                    info!("Token renewed from {}", url);
                    return Ok(token);
                }
                AuthAttempt::Rejected(message) => {
                    self.invalidate();
                    warn!("Token renewal rejected by {}: {}", url, message);
                    return Err(DeployError::auth(message));
                }
                AuthAttempt::Unreachable(message) => {
                    warn!("Auth endpoint {} unreachable: {}", url, message);
                    if let Err(e) = self.auth_urls.mark_unavailable(&url, UnavailableReason::Failover) {
                        warn!("Failed to mark auth endpoint {} unavailable: {}", url, e);
                    }
                    last_error = message;
                }
            }
        }

        self.invalidate();
        self.auth_urls.reset_all();
        Err(DeployError::auth(format!("Token renewal failed: {}", last_error)))
    }

    async fn request_token(&self, base: &str) -> AuthAttempt {
        let url = format!("{}{}", base.trim_end_matches('/'), AUTH_PATH);
        let response = match self.client.post(&url).json(&self.credentials).send().await {
            Ok(response) => response,
            Err(e) => return AuthAttempt::Unreachable(e.to_string()),
        };

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            return match response.json::<AuthResponse>().await {
                Ok(body) if !body.auth_token.is_empty() => AuthAttempt::Issued(body.auth_token),
                Ok(_) => AuthAttempt::Rejected("auth endpoint returned an empty token".to_string()),
                Err(e) => AuthAttempt::Rejected(format!("invalid auth response: {}", e)),
            };
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("auth endpoint returned {}: {}", status, body);
        if status.is_server_error() {
            AuthAttempt::Unreachable(message)
        } else {
            AuthAttempt::Rejected(message)
        }
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn token(&self) -> Result<String> {
        if let Some(token) = self.cached_if_fresh() {
            return Ok(token);
        }

        let _guard = self.renewal.lock().await;
        // Late arrivals find the token renewed by whoever held the lock.
        if let Some(token) = self.cached_if_fresh() {
            return Ok(token);
        }
        self.renew_locked().await
    }

    async fn renew(&self, stale: &str) -> Result<String> {
        let _guard = self.renewal.lock().await;
        if let Some(token) = self.cached_if_fresh() {
            if token != stale {
                return Ok(token);
            }
        }
        self.renew_locked().await
    }

    fn invalidate(&self) {
        *self.cache.write() = None;
    }

    fn describe(&self) -> TokenStatus {
        let cache = self.cache.read();
        let fresh = cache.as_ref().filter(|c| c.issued_at.elapsed() < self.ttl);
        TokenStatus {
            kind: "http".to_string(),
            cached: fresh.is_some(),
            issued_at: fresh.map(|c| c.issued_at_utc),
            expires_in_secs: fresh.map(|c| self.ttl.saturating_sub(c.issued_at.elapsed()).as_secs()),
            renewals: self.renewals(),
        }
    }
}
