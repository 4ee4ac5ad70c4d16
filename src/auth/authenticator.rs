//! Cache-or-fetch orchestration over the pluggable strategies.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::certificate::CertificateManager;
use super::identity::{IdentityClient, IdentityEndpoints};
use super::models::{AuthParams, AuthenticationMethod, AuthenticationResult};
use super::prompt::{ConsolePrompt, UserPrompt};
use super::resource::decode_claims;
use super::strategies::{AuthContext, AuthStrategy, default_strategies};
use super::token_cache::{CacheKey, TokenCache};
use crate::error::{AuthenticationError, ConfigurationError, Result};
use crate::sanitize::Sanitizer;

pub const DEFAULT_INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Something that can hand out a bearer token and forget it again.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String>;

    /// Drop the held token so the next [`token`](Self::token) call fetches a new one.
    fn invalidate(&self);
}

/// Token acquisition for one resource scope.
///
/// Holds the strategy map, the token cache, and the most recently acquired
/// token. Collaborators (HTTP client, sanitizer, prompt) are injected.
pub struct Authenticator {
    resource_scope: String,
    strategies: HashMap<AuthenticationMethod, Arc<dyn AuthStrategy>>,
    identity: IdentityClient,
    certificates: CertificateManager,
    cache: TokenCache,
    prompt: Arc<dyn UserPrompt>,
    interactive_timeout: Duration,
    current: ArcSwapOption<AuthenticationResult>,
    issued: Mutex<HashSet<CacheKey>>,
}

impl Authenticator {
    pub fn new(resource_scope: impl Into<String>, http: reqwest::Client, sanitizer: Arc<Sanitizer>) -> Self {
        Self {
            resource_scope: resource_scope.into(),
            strategies: default_strategies(),
            identity: IdentityClient::new(http, IdentityEndpoints::default(), sanitizer),
            certificates: CertificateManager::new(),
            cache: TokenCache::disabled(),
            prompt: Arc::new(ConsolePrompt),
            interactive_timeout: DEFAULT_INTERACTIVE_TIMEOUT,
            current: ArcSwapOption::empty(),
            issued: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_endpoints(mut self, endpoints: IdentityEndpoints) -> Self {
        self.identity = self.identity.with_endpoints(endpoints);
        self
    }

    pub fn with_cache(mut self, cache: TokenCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_certificate_manager(mut self, certificates: CertificateManager) -> Self {
        self.certificates = certificates;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn UserPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_interactive_timeout(mut self, timeout: Duration) -> Self {
        self.interactive_timeout = timeout;
        self
    }

    /// Register or replace the strategy for its method.
    pub fn with_strategy(mut self, strategy: Arc<dyn AuthStrategy>) -> Self {
        self.strategies.insert(strategy.method(), strategy);
        self
    }

    pub fn resource_scope(&self) -> &str {
        &self.resource_scope
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    pub fn certificates(&self) -> &CertificateManager {
        &self.certificates
    }

    fn strategy(&self, method: AuthenticationMethod) -> Result<Arc<dyn AuthStrategy>> {
        self.strategies.get(&method).cloned().ok_or_else(|| {
            ConfigurationError::new(format!("no strategy registered for {}", method)).into()
        })
    }

    fn scopes_for(&self, strategy: &dyn AuthStrategy, params: &AuthParams) -> Vec<String> {
        let requested = if params.scopes.is_empty() {
            vec![self.resource_scope.clone()]
        } else {
            params.scopes.clone()
        };
        strategy.scopes(requested)
    }

    /// Cache key the given call would use.
    pub fn cache_key(&self, method: AuthenticationMethod, params: &AuthParams) -> Result<CacheKey> {
        let strategy = self.strategy(method)?;
        let scopes = self.scopes_for(strategy.as_ref(), params);
        let discriminator = strategy.discriminator(params)?;
        Ok(CacheKey::new(
            &params.tenant_id,
            &params.client_id,
            method,
            &scopes,
            discriminator.as_deref(),
        ))
    }

    fn context<'a>(&'a self, params: &'a AuthParams, scopes: &'a [String]) -> AuthContext<'a> {
        AuthContext {
            params,
            scopes,
            identity: &self.identity,
            certificates: &self.certificates,
            cache: &self.cache,
            prompt: self.prompt.as_ref(),
            interactive_timeout: self.interactive_timeout,
        }
    }

    /// Return a cached token when one is still usable, otherwise run the
    /// method's strategy and cache a successful result.
    ///
    /// Provider rejections come back as an unsuccessful result; missing
    /// parameters, certificate problems and transport failures are errors.
    pub async fn authenticate(
        &self,
        method: AuthenticationMethod,
        params: &AuthParams,
    ) -> Result<AuthenticationResult> {
        params.validate_for(method)?;
        let strategy = self.strategy(method)?;
        let scopes = self.scopes_for(strategy.as_ref(), params);
        let discriminator = strategy.discriminator(params)?;
        let key = CacheKey::new(
            &params.tenant_id,
            &params.client_id,
            method,
            &scopes,
            discriminator.as_deref(),
        );

        if let Some(cached) = self.cache.get(&key) {
            debug!("Using cached {} token", method);
            self.remember(&key, &cached);
            return Ok(cached);
        }

        info!("Acquiring token with {}", method);
        let result = strategy.acquire(&self.context(params, &scopes)).await?;
        self.record(method, params, &key, &result);
        Ok(result)
    }

    /// Blocking wrapper around [`authenticate`](Self::authenticate).
    ///
    /// Builds a private current-thread runtime, so it must not be called
    /// from inside an async context.
    pub fn authenticate_blocking(
        &self,
        method: AuthenticationMethod,
        params: &AuthParams,
    ) -> Result<AuthenticationResult> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| AuthenticationError::NetworkFailure(format!("cannot start runtime: {}", e)))?;
        runtime.block_on(self.authenticate(method, params))
    }

    /// The in-memory token, if one was acquired and has not expired.
    pub fn get_current_token(&self) -> Option<String> {
        let current = self.current.load_full()?;
        if current.is_expired() {
            return None;
        }
        current.token().map(str::to_string)
    }

    /// Redeem a refresh token (delegated methods) or re-run the credential
    /// exchange (app-only methods).
    pub async fn refresh_token(
        &self,
        method: AuthenticationMethod,
        params: &AuthParams,
        refresh_token: &str,
    ) -> Result<AuthenticationResult> {
        params.validate_for(method)?;
        let strategy = self.strategy(method)?;
        let scopes = self.scopes_for(strategy.as_ref(), params);
        let key = self.cache_key(method, params)?;

        let result = strategy
            .refresh(&self.context(params, &scopes), refresh_token)
            .await?;
        self.record(method, params, &key, &result);
        Ok(result)
    }

    /// Forget the token for one method/params pair, in memory and on disk.
    pub fn discard(&self, method: AuthenticationMethod, params: &AuthParams) {
        self.current.store(None);
        match self.cache_key(method, params) {
            Ok(key) => {
                self.cache.clear(&key);
                self.issued_keys().remove(&key);
            }
            Err(e) => debug!("Nothing to discard: {}", e),
        }
    }

    /// Drop the in-memory token and every cache record this instance issued.
    pub fn clear_cache(&self) {
        self.current.store(None);
        let keys: Vec<CacheKey> = self.issued_keys().drain().collect();
        for key in &keys {
            self.cache.clear(key);
        }
        debug!("Cleared {} cached token(s)", keys.len());
    }

    fn remember(&self, key: &CacheKey, result: &AuthenticationResult) {
        self.current.store(Some(Arc::new(result.clone())));
        self.issued_keys().insert(key.clone());
    }

    fn record(
        &self,
        method: AuthenticationMethod,
        params: &AuthParams,
        key: &CacheKey,
        result: &AuthenticationResult,
    ) {
        if result.token().is_none() {
            warn!(
                "{} authentication failed: {}",
                method,
                result.error.as_deref().unwrap_or("no token returned")
            );
            return;
        }

        self.cache.set(key, result);
        self.remember(key, result);

        if method.is_delegated() && result.refresh_token.is_some() {
            let user = result
                .token()
                .and_then(signed_in_user)
                .or_else(|| params.username.clone());
            let mut accounts = vec![CacheKey::account(&params.tenant_id, &params.client_id, None)];
            if let Some(user) = user.as_deref() {
                accounts.push(CacheKey::account(&params.tenant_id, &params.client_id, Some(user)));
            }
            for account in accounts {
                self.cache.set(&account, result);
                self.issued_keys().insert(account);
            }
        }
    }

    fn issued_keys(&self) -> std::sync::MutexGuard<'_, HashSet<CacheKey>> {
        self.issued.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Signed-in user named by a delegated access token, when it is a JWT.
fn signed_in_user(token: &str) -> Option<String> {
    decode_claims(token).ok()?.user().map(str::to_string)
}
