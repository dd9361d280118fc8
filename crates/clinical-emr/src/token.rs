//! OAuth2 Token Manager (C6, §4.6): acquire/cache/refresh bearer tokens for
//! the EMR adapter, with per-key request coalescing so a reconnect storm
//! never thundering-herds the token endpoint.

use async_trait::async_trait;
use clinical_core::config::TokenConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Duration};

/// Errors raised acquiring or refreshing a token.
#[derive(Debug, Error, Clone)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    TokenRequestFailed(String),
    #[error("invalid token response: no access_token present")]
    InvalidResponse,
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// The cache key: a token is scoped to exactly this tuple (§4.6 contract).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub endpoint: String,
    pub client_id: String,
    pub scope: String,
    pub audience: Option<String>,
    pub resource: Option<String>,
}

/// Parameters needed to request or refresh a token. `client_secret` is
/// intentionally excluded from `Debug` output.
#[derive(Clone)]
pub struct TokenRequestConfig {
    pub key: TokenKey,
    pub token_url: String,
    pub client_secret: String,
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for TokenRequestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRequestConfig")
            .field("key", &self.key)
            .field("token_url", &self.token_url)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Raw fields parsed from a token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTokenResponse {
    pub access_token: String,
    pub expires_in_s: u64,
}

/// A cached, still-possibly-valid access token.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at_ns: u64,
}

/// The single-shot HTTP/refresh collaborator. Implementations perform the
/// real network round trip; `clinical-emr`'s tests supply a fake.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self, config: &TokenRequestConfig) -> Result<RawTokenResponse, TokenError>;
}

/// `reqwest`-backed client-credentials / refresh-token fetcher.
pub struct ReqwestTokenFetcher {
    client: reqwest::Client,
}

impl ReqwestTokenFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenFetcher for ReqwestTokenFetcher {
    async fn fetch(&self, config: &TokenRequestConfig) -> Result<RawTokenResponse, TokenError> {
        let mut form = vec![
            ("client_id", config.key.client_id.clone()),
            ("client_secret", config.client_secret.clone()),
            ("scope", config.key.scope.clone()),
        ];
        if let Some(refresh) = &config.refresh_token {
            form.push(("grant_type", "refresh_token".to_string()));
            form.push(("refresh_token", refresh.clone()));
        } else {
            form.push(("grant_type", "client_credentials".to_string()));
        }
        if let Some(audience) = &config.key.audience {
            form.push(("audience", audience.clone()));
        }
        if let Some(resource) = &config.key.resource {
            form.push(("resource", resource.clone()));
        }

        let response = self
            .client
            .post(&config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| TokenError::TokenRequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TokenError::TokenRequestFailed(format!(
                "status {}",
                response.status()
            )));
        }

        let parsed: RawTokenResponse = response
            .json()
            .await
            .map_err(|_| TokenError::InvalidResponse)?;
        if parsed.access_token.is_empty() {
            return Err(TokenError::InvalidResponse);
        }

        if let Some(exp) = inspect_expiry(&parsed.access_token) {
            tracing::debug!(exp, "token carries embedded expiry claim");
        }
        Ok(parsed)
    }
}

/// Peek a JWT's `exp` claim without validating its signature — used only
/// for a diagnostic log line, never for trust decisions.
fn inspect_expiry(token: &str) -> Option<i64> {
    #[derive(Deserialize)]
    struct Claims {
        exp: Option<i64>,
    }
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    jsonwebtoken::decode::<Claims>(token, &jsonwebtoken::DecodingKey::from_secret(&[]), &validation)
        .ok()
        .and_then(|data| data.claims.exp)
}

async fn fetch_with_retries<F: TokenFetcher + ?Sized>(
    fetcher: &F,
    config: &TokenRequestConfig,
    retry: &TokenConfig,
) -> Result<RawTokenResponse, TokenError> {
    let mut attempt = 0;
    let mut delay = Duration::from_millis(retry.retry_base_ms);
    loop {
        attempt += 1;
        match fetcher.fetch(config).await {
            Ok(response) => return Ok(response),
            Err(err) if attempt >= retry.retry_max_attempts => {
                tracing::warn!(error = %err, attempt, "token fetch retries exhausted");
                return Err(TokenError::RetriesExhausted { attempts: attempt });
            }
            Err(err) => {
                tracing::debug!(error = %err, attempt, "token fetch failed, retrying");
                sleep(delay).await;
                delay *= retry.retry_multiplier;
            }
        }
    }
}

/// Process-wide token cache with per-key coalescing (§4.6, §5).
pub struct TokenManager<F: TokenFetcher> {
    fetcher: F,
    config: TokenConfig,
    cache: parking_lot::RwLock<HashMap<TokenKey, CachedToken>>,
    locks: AsyncMutex<HashMap<TokenKey, Arc<AsyncMutex<()>>>>,
}

impl<F: TokenFetcher> TokenManager<F> {
    pub fn new(fetcher: F, config: TokenConfig) -> Self {
        Self {
            fetcher,
            config,
            cache: parking_lot::RwLock::new(HashMap::new()),
            locks: AsyncMutex::new(HashMap::new()),
        }
    }

    fn is_fresh(&self, cached: &CachedToken, now_ns: u64) -> bool {
        let margin_ns = self.config.refresh_margin_s.saturating_mul(1_000_000_000);
        now_ns.saturating_add(margin_ns) < cached.expires_at_ns
    }

    async fn key_lock(&self, key: &TokenKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Return a non-expired token for `request.key`, fetching (and
    /// coalescing concurrent fetches for the same key) if the cache is
    /// empty or stale.
    pub async fn get_token(
        &self,
        request: &TokenRequestConfig,
        force_refresh: bool,
        now_ns: u64,
    ) -> Result<CachedToken, TokenError> {
        if !force_refresh {
            if let Some(cached) = self.cache.read().get(&request.key).cloned() {
                if self.is_fresh(&cached, now_ns) {
                    return Ok(cached);
                }
            }
        }

        let lock = self.key_lock(&request.key).await;
        let _guard = lock.lock().await;

        // Re-check: a coalesced caller that arrived first may already have
        // refreshed the cache while we were waiting for the per-key lock.
        if !force_refresh {
            if let Some(cached) = self.cache.read().get(&request.key).cloned() {
                if self.is_fresh(&cached, now_ns) {
                    return Ok(cached);
                }
            }
        }

        let raw = fetch_with_retries(&self.fetcher, request, &self.config).await?;
        let cached = CachedToken {
            access_token: raw.access_token,
            expires_at_ns: now_ns.saturating_add(raw.expires_in_s.saturating_mul(1_000_000_000)),
        };
        self.cache.write().insert(request.key.clone(), cached.clone());
        Ok(cached)
    }

    /// Explicit refresh path (§4.6): always bypasses the cache.
    pub async fn refresh(&self, request: &TokenRequestConfig, now_ns: u64) -> Result<CachedToken, TokenError> {
        self.get_token(request, true, now_ns).await
    }

    pub fn clear(&self, key: &TokenKey) {
        self.cache.write().remove(key);
    }

    pub fn clear_all(&self) {
        self.cache.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key() -> TokenKey {
        TokenKey {
            endpoint: "https://emr.example/fhir".into(),
            client_id: "client-1".into(),
            scope: "patient/*.read".into(),
            audience: None,
            resource: None,
        }
    }

    fn request() -> TokenRequestConfig {
        TokenRequestConfig {
            key: key(),
            token_url: "https://auth.example/token".into(),
            client_secret: "secret".into(),
            refresh_token: None,
        }
    }

    struct CountingFetcher {
        calls: AtomicU32,
        delay_ms: u64,
    }

    #[async_trait]
    impl TokenFetcher for CountingFetcher {
        async fn fetch(&self, _config: &TokenRequestConfig) -> Result<RawTokenResponse, TokenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(RawTokenResponse {
                access_token: "tok-1".into(),
                expires_in_s: 3600,
            })
        }
    }

    #[tokio::test]
    async fn caches_and_skips_refetch_when_fresh() {
        let manager = TokenManager::new(
            CountingFetcher { calls: AtomicU32::new(0), delay_ms: 0 },
            TokenConfig::default(),
        );
        let t1 = manager.get_token(&request(), false, 0).await.unwrap();
        let t2 = manager.get_token(&request(), false, 1_000_000_000).await.unwrap();
        assert_eq!(t1.access_token, t2.access_token);
        assert_eq!(manager.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_always_refetches() {
        let manager = TokenManager::new(
            CountingFetcher { calls: AtomicU32::new(0), delay_ms: 0 },
            TokenConfig::default(),
        );
        manager.get_token(&request(), false, 0).await.unwrap();
        manager.refresh(&request(), 0).await.unwrap();
        assert_eq!(manager.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_coalesce_to_one_fetch() {
        let manager = Arc::new(TokenManager::new(
            CountingFetcher { calls: AtomicU32::new(0), delay_ms: 50 },
            TokenConfig::default(),
        ));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.get_token(&request(), false, 0).await.unwrap()
            }));
        }
        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap());
        }
        assert!(tokens.iter().all(|t| t.access_token == "tok-1"));
        assert_eq!(manager.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_forces_refetch() {
        let manager = TokenManager::new(
            CountingFetcher { calls: AtomicU32::new(0), delay_ms: 0 },
            TokenConfig::default(),
        );
        manager.get_token(&request(), false, 0).await.unwrap();
        manager.clear(&key());
        manager.get_token(&request(), false, 0).await.unwrap();
        assert_eq!(manager.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    struct AlwaysFails;

    #[async_trait]
    impl TokenFetcher for AlwaysFails {
        async fn fetch(&self, _config: &TokenRequestConfig) -> Result<RawTokenResponse, TokenError> {
            Err(TokenError::TokenRequestFailed("boom".into()))
        }
    }

    #[tokio::test]
    async fn retries_exhausted_after_configured_attempts() {
        let mut cfg = TokenConfig::default();
        cfg.retry_base_ms = 1;
        let manager = TokenManager::new(AlwaysFails, cfg);
        let err = manager.get_token(&request(), false, 0).await.unwrap_err();
        assert!(matches!(err, TokenError::RetriesExhausted { attempts: 3 }));
    }
}
