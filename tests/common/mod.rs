#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use m365_admin::auth::{
    Authenticator, IdentityEndpoints, ResourceAuthenticator, SilentPrompt, TokenCache, TokenProvider,
};
use m365_admin::sanitize::Sanitizer;

pub const TENANT: &str = "contoso.onmicrosoft.com";
pub const CLIENT_ID: &str = "8c2b6f0e-4a1d-4c55-9f3e-2d7b1a9e0c44";
pub const FIXTURE_PASSWORD: &str = "fixture-pass";
pub const FIXTURE_THUMBPRINT: &str = "19DD3E74C78A3B4D0EB29DECDBF8944A91924E13";

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures").join(name)
}

pub fn token_path() -> String {
    format!("/{}/oauth2/v2.0/token", TENANT)
}

/// Unsigned JWT carrying `claims`, good enough for claim decoding.
pub fn fake_jwt(claims: Value) -> String {
    format!(
        "eyJhbGciOiJSUzI1NiIsInR5cCI6IkpXVCJ9.{}.c2lnbmF0dXJl",
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

pub fn token_body(access_token: &str) -> Value {
    json!({
        "token_type": "Bearer",
        "expires_in": 3599,
        "access_token": access_token
    })
}

/// Graph authenticator pointed at a mock identity provider.
pub fn graph_authenticator(authority: &str, cache: TokenCache) -> ResourceAuthenticator {
    let inner = Authenticator::new(
        "https://graph.microsoft.com/.default",
        reqwest::Client::new(),
        Arc::new(Sanitizer::new()),
    )
    .with_endpoints(IdentityEndpoints::new(authority).with_imds_endpoint(format!("{}/metadata/identity/oauth2/token", authority)))
    .with_cache(cache)
    .with_prompt(Arc::new(SilentPrompt));
    ResourceAuthenticator::new(inner)
}

/// Hands out `token-1`, then `token-2` after the first invalidation, and so on.
#[derive(Default)]
pub struct RotatingTokens {
    generation: AtomicUsize,
    pub invalidations: AtomicUsize,
}

impl RotatingTokens {
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for RotatingTokens {
    async fn token(&self) -> m365_admin::Result<String> {
        Ok(format!("token-{}", self.generation.load(Ordering::SeqCst) + 1))
    }

    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}
