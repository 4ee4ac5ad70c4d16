//! Authenticator for a resource API such as Microsoft Graph.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use log::debug;
use std::sync::Arc;

use super::authenticator::{Authenticator, TokenProvider};
use super::models::{AuthParams, AuthenticationMethod, AuthenticationResult, TokenClaims, TokenInfo};
use crate::error::{AuthenticationError, Result};
use crate::sanitize::Sanitizer;

pub const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// [`Authenticator`] bound to one resource, plus local token inspection.
pub struct ResourceAuthenticator {
    inner: Authenticator,
}

impl ResourceAuthenticator {
    pub fn new(inner: Authenticator) -> Self {
        Self { inner }
    }

    /// Authenticator for Microsoft Graph with default collaborators.
    pub fn graph(http: reqwest::Client, sanitizer: Arc<Sanitizer>) -> Self {
        Self::new(Authenticator::new(GRAPH_SCOPE, http, sanitizer))
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.inner
    }

    pub async fn authenticate(
        &self,
        method: AuthenticationMethod,
        params: &AuthParams,
    ) -> Result<AuthenticationResult> {
        self.inner.authenticate(method, params).await
    }

    pub fn authenticate_blocking(
        &self,
        method: AuthenticationMethod,
        params: &AuthParams,
    ) -> Result<AuthenticationResult> {
        self.inner.authenticate_blocking(method, params)
    }

    pub fn get_current_token(&self) -> Option<String> {
        self.inner.get_current_token()
    }

    pub async fn refresh_token(
        &self,
        method: AuthenticationMethod,
        params: &AuthParams,
        refresh_token: &str,
    ) -> Result<AuthenticationResult> {
        self.inner.refresh_token(method, params, refresh_token).await
    }

    pub fn clear_cache(&self) {
        self.inner.clear_cache()
    }

    /// Whether the current token exists and its `exp` claim is in the future.
    ///
    /// Reads the claims without checking the signature. Diagnostics only.
    pub fn validate(&self) -> bool {
        self.get_token_info()
            .map(|info| !info.is_expired)
            .unwrap_or(false)
    }

    pub fn get_token_info(&self) -> Result<TokenInfo> {
        let token = self
            .get_current_token()
            .ok_or(AuthenticationError::NotAuthenticated)?;
        Ok(token_info(&decode_claims(&token)?, Utc::now()))
    }
}

/// Decode the payload segment of a JWT. The signature is not verified.
pub fn decode_claims(token: &str) -> std::result::Result<TokenClaims, AuthenticationError> {
    let payload = token
        .split('.')
        .nth(1)
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| AuthenticationError::InvalidResponse("token is not a JWT".into()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthenticationError::InvalidResponse(format!("token payload is not base64url: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| AuthenticationError::InvalidResponse(format!("token payload is not JSON: {}", e)))
}

pub fn token_info(claims: &TokenClaims, now: DateTime<Utc>) -> TokenInfo {
    let timestamp = |secs: Option<i64>| secs.and_then(|s| DateTime::from_timestamp(s, 0));
    let expires_at = timestamp(claims.exp);

    TokenInfo {
        audience: claims.aud.clone(),
        tenant_id: claims.tid.clone(),
        app_id: claims.appid.clone(),
        user: claims.user().map(str::to_string),
        scopes: claims
            .scp
            .as_deref()
            .map(|scp| scp.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        roles: claims.roles.clone(),
        issued_at: timestamp(claims.iat),
        expires_at,
        is_expired: expires_at.is_none_or(|exp| now >= exp),
    }
}

/// A [`ResourceAuthenticator`] bound to one method and parameter set.
pub struct BoundCredentials {
    authenticator: Arc<ResourceAuthenticator>,
    method: AuthenticationMethod,
    params: AuthParams,
}

impl BoundCredentials {
    pub fn new(authenticator: Arc<ResourceAuthenticator>, method: AuthenticationMethod, params: AuthParams) -> Self {
        Self {
            authenticator,
            method,
            params,
        }
    }

    pub fn method(&self) -> AuthenticationMethod {
        self.method
    }
}

#[async_trait]
impl TokenProvider for BoundCredentials {
    async fn token(&self) -> Result<String> {
        if let Some(token) = self.authenticator.get_current_token() {
            return Ok(token);
        }

        let result = self.authenticator.authenticate(self.method, &self.params).await?;
        match result.token() {
            Some(token) => Ok(token.to_string()),
            None => Err(result.to_error().into()),
        }
    }

    fn invalidate(&self) {
        debug!("Discarding held {} token", self.method);
        self.authenticator.authenticator().discard(self.method, &self.params);
    }
}
