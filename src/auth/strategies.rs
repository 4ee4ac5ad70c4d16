//! One token acquisition strategy per [`AuthenticationMethod`].

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, Header};
use log::{debug, info, warn};
use rand::RngCore;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::Instant;
use url::Url;

use super::certificate::{CertificateBundle, CertificateManager, file_thumbprint, normalize_thumbprint, signing_key};
use super::identity::{IMDS_API_VERSION, IdentityClient};
use super::models::{AuthParams, AuthenticationMethod, AuthenticationResult};
use super::prompt::UserPrompt;
use super::token_cache::{CacheKey, TokenCache};
use crate::error::{AuthenticationError, CertificateError, ConfigurationError, Result};

pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

const OFFLINE_ACCESS: &str = "offline_access";
const ASSERTION_LIFETIME_MINUTES: i64 = 10;
const SLOW_DOWN_STEP_SECS: u64 = 5;

/// Everything a strategy may touch while acquiring a token.
pub struct AuthContext<'a> {
    pub params: &'a AuthParams,
    pub scopes: &'a [String],
    pub identity: &'a IdentityClient,
    pub certificates: &'a CertificateManager,
    pub cache: &'a TokenCache,
    pub prompt: &'a dyn UserPrompt,
    pub interactive_timeout: Duration,
}

impl AuthContext<'_> {
    fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    fn tenant(&self) -> &str {
        &self.params.tenant_id
    }

    fn client_id(&self) -> &str {
        &self.params.client_id
    }
}

#[async_trait]
pub trait AuthStrategy: Send + Sync {
    fn method(&self) -> AuthenticationMethod;

    /// Final scope list for a request, given the resource default or the
    /// caller's override.
    fn scopes(&self, requested: Vec<String>) -> Vec<String> {
        requested
    }

    /// Non-secret value that separates cache entries of the same method.
    fn discriminator(&self, _params: &AuthParams) -> Result<Option<String>> {
        Ok(None)
    }

    async fn acquire(&self, ctx: &AuthContext<'_>) -> Result<AuthenticationResult>;

    /// App-only methods have no refresh token and simply re-run the exchange.
    async fn refresh(&self, ctx: &AuthContext<'_>, _refresh_token: &str) -> Result<AuthenticationResult> {
        self.acquire(ctx).await
    }
}

/// The built-in strategy for every method.
pub fn default_strategies() -> HashMap<AuthenticationMethod, Arc<dyn AuthStrategy>> {
    let strategies: [Arc<dyn AuthStrategy>; 6] = [
        Arc::new(CertificateStrategy),
        Arc::new(ClientSecretStrategy),
        Arc::new(InteractiveStrategy),
        Arc::new(DeviceCodeStrategy),
        Arc::new(UsernamePasswordStrategy),
        Arc::new(ManagedIdentityStrategy),
    ];
    strategies.into_iter().map(|s| (s.method(), s)).collect()
}

fn with_offline_access(mut scopes: Vec<String>) -> Vec<String> {
    if !scopes.iter().any(|s| s == OFFLINE_ACCESS) {
        scopes.push(OFFLINE_ACCESS.to_string());
    }
    scopes
}

async fn redeem_refresh_token(ctx: &AuthContext<'_>, refresh_token: &str) -> Result<AuthenticationResult> {
    let scope = ctx.scope_string();
    let form = [
        ("grant_type", "refresh_token"),
        ("client_id", ctx.client_id()),
        ("refresh_token", refresh_token),
        ("scope", scope.as_str()),
    ];
    Ok(ctx.identity.request_token(ctx.tenant(), &form).await?)
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    aud: &'a str,
    iss: &'a str,
    sub: &'a str,
    jti: String,
    nbf: i64,
    iat: i64,
    exp: i64,
}

/// Signed RS256 client assertion for the certificate grant.
///
/// The `x5t` header carries the certificate's SHA-1 thumbprint so the
/// provider can pick the registered key.
pub fn client_assertion(
    bundle: &CertificateBundle,
    client_id: &str,
    audience: &str,
    now: DateTime<Utc>,
) -> std::result::Result<String, CertificateError> {
    let mut header = Header::new(Algorithm::RS256);
    header.x5t = Some(bundle.x5t());

    let claims = AssertionClaims {
        aud: audience,
        iss: client_id,
        sub: client_id,
        jti: uuid::Uuid::new_v4().to_string(),
        nbf: now.timestamp(),
        iat: now.timestamp(),
        exp: (now + ChronoDuration::minutes(ASSERTION_LIFETIME_MINUTES)).timestamp(),
    };

    jsonwebtoken::encode(&header, &claims, &signing_key(bundle)?)
        .map_err(|e| CertificateError::Malformed(format!("cannot sign client assertion: {}", e)))
}

/// Client credentials with a signed certificate assertion.
#[derive(Debug, Default, Clone, Copy)]
pub struct CertificateStrategy;

impl CertificateStrategy {
    async fn load(&self, ctx: &AuthContext<'_>) -> Result<CertificateBundle> {
        let params = ctx.params;
        let expected = params
            .certificate_thumbprint
            .as_deref()
            .map(normalize_thumbprint)
            .transpose()?;

        let bundle = match (&params.certificate_path, &expected) {
            (Some(path), _) => {
                let password = params.certificate_password.as_ref().map(|p| p.expose_secret());
                ctx.certificates.load_from_file(path, password).await?
            }
            (None, Some(thumbprint)) => ctx.certificates.load_from_store(thumbprint).await?,
            (None, None) => {
                return Err(ConfigurationError::new(
                    "certificate authentication needs a certificate path or thumbprint",
                )
                .into());
            }
        };

        if let Some(expected) = &expected
            && bundle.thumbprint != *expected
        {
            return Err(CertificateError::Malformed(format!(
                "loaded certificate {} does not match configured thumbprint {}",
                bundle.thumbprint, expected
            ))
            .into());
        }

        bundle.ensure_valid_at(Utc::now())?;
        Ok(bundle)
    }
}

#[async_trait]
impl AuthStrategy for CertificateStrategy {
    fn method(&self) -> AuthenticationMethod {
        AuthenticationMethod::Certificate
    }

    /// Keyed by the thumbprint that will sign, so replacing the file at a
    /// configured path never serves the old certificate's token.
    fn discriminator(&self, params: &AuthParams) -> Result<Option<String>> {
        if let Some(thumbprint) = &params.certificate_thumbprint {
            return Ok(Some(normalize_thumbprint(thumbprint)?));
        }
        let Some(path) = &params.certificate_path else {
            return Ok(None);
        };
        let password = params.certificate_password.as_ref().map(|p| p.expose_secret());
        Ok(Some(file_thumbprint(path, password)?))
    }

    async fn acquire(&self, ctx: &AuthContext<'_>) -> Result<AuthenticationResult> {
        let bundle = self.load(ctx).await?;
        let audience = ctx.identity.endpoints().token_endpoint(ctx.tenant());
        let assertion = client_assertion(&bundle, ctx.client_id(), &audience, Utc::now())?;
        debug!("Requesting token with certificate {}", bundle.thumbprint);

        let scope = ctx.scope_string();
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", ctx.client_id()),
            ("scope", scope.as_str()),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", assertion.as_str()),
        ];
        Ok(ctx.identity.request_token(ctx.tenant(), &form).await?)
    }
}

/// Client credentials with a shared secret.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientSecretStrategy;

#[async_trait]
impl AuthStrategy for ClientSecretStrategy {
    fn method(&self) -> AuthenticationMethod {
        AuthenticationMethod::ClientSecret
    }

    async fn acquire(&self, ctx: &AuthContext<'_>) -> Result<AuthenticationResult> {
        let secret = ctx
            .params
            .client_secret
            .as_ref()
            .ok_or_else(|| ConfigurationError::new("client secret authentication needs a client secret"))?;

        let scope = ctx.scope_string();
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", ctx.client_id()),
            ("client_secret", secret.expose_secret()),
            ("scope", scope.as_str()),
        ];
        Ok(ctx.identity.request_token(ctx.tenant(), &form).await?)
    }
}

/// Silent reacquisition from the account record, else browser sign-in with
/// PKCE over a loopback redirect.
#[derive(Debug, Default, Clone, Copy)]
pub struct InteractiveStrategy;

const SIGNED_IN_PAGE: &str =
    "<html><body><h3>Signed in.</h3><p>You can close this window and return to the terminal.</p></body></html>";
const SIGN_IN_FAILED_PAGE: &str =
    "<html><body><h3>Sign-in failed.</h3><p>Return to the terminal for details.</p></body></html>";

pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn generate_code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

impl InteractiveStrategy {
    async fn silent(&self, ctx: &AuthContext<'_>) -> Option<AuthenticationResult> {
        let user = ctx.params.username.as_deref();
        let account = ctx
            .cache
            .get_record(&CacheKey::account(ctx.tenant(), ctx.client_id(), user))?;
        let refresh_token = account.refresh_token?;

        match redeem_refresh_token(ctx, &refresh_token).await {
            Ok(result) if result.success => {
                info!("Reacquired token silently from the account cache");
                Some(result)
            }
            Ok(result) => {
                debug!(
                    "Silent reacquisition declined: {}",
                    result.error.as_deref().unwrap_or("unknown")
                );
                None
            }
            Err(e) => {
                debug!("Silent reacquisition failed: {}", e);
                None
            }
        }
    }

    async fn browser_sign_in(&self, ctx: &AuthContext<'_>) -> Result<AuthenticationResult> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| AuthenticationError::NetworkFailure(format!("cannot open loopback listener: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| AuthenticationError::NetworkFailure(e.to_string()))?
            .port();
        let redirect_uri = format!("http://127.0.0.1:{}", port);

        let verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&verifier);
        let state = uuid::Uuid::new_v4().simple().to_string();
        let scope = ctx.scope_string();

        let mut query = vec![
            ("client_id", ctx.client_id()),
            ("response_type", "code"),
            ("response_mode", "query"),
            ("redirect_uri", redirect_uri.as_str()),
            ("scope", scope.as_str()),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("state", state.as_str()),
        ];
        if let Some(username) = &ctx.params.username {
            query.push(("login_hint", username.as_str()));
        }
        let authorize_url = Url::parse_with_params(&ctx.identity.endpoints().authorize_endpoint(ctx.tenant()), &query)
            .map_err(|e| ConfigurationError::new(format!("invalid authority host: {}", e)))?;

        ctx.prompt.open_browser(authorize_url.as_str());

        let code = tokio::time::timeout(ctx.interactive_timeout, wait_for_redirect(listener, &state))
            .await
            .map_err(|_| {
                AuthenticationError::InvalidCredentials(format!(
                    "interactive sign-in did not complete within {}s",
                    ctx.interactive_timeout.as_secs()
                ))
            })??;

        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", ctx.client_id()),
            ("code", code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("code_verifier", verifier.as_str()),
            ("scope", scope.as_str()),
        ];
        Ok(ctx.identity.request_token(ctx.tenant(), &form).await?)
    }
}

async fn wait_for_redirect(
    listener: TcpListener,
    expected_state: &str,
) -> std::result::Result<String, AuthenticationError> {
    loop {
        let (mut stream, _) = listener
            .accept()
            .await
            .map_err(|e| AuthenticationError::NetworkFailure(format!("loopback listener failed: {}", e)))?;

        let mut request_line = String::new();
        {
            let mut reader = BufReader::new(&mut stream);
            if reader.read_line(&mut request_line).await.is_err() {
                continue;
            }
        }

        let target = request_line.split_whitespace().nth(1).unwrap_or("/");
        let outcome = parse_redirect(target, expected_state);
        let (status, body) = match &outcome {
            Some(Ok(_)) => ("200 OK", SIGNED_IN_PAGE),
            Some(Err(_)) => ("400 Bad Request", SIGN_IN_FAILED_PAGE),
            None => ("404 Not Found", ""),
        };
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        if let Err(e) = stream.write_all(response.as_bytes()).await {
            debug!("Could not answer sign-in redirect: {}", e);
        }

        if let Some(outcome) = outcome {
            return outcome;
        }
    }
}

/// `None` for requests that are not the sign-in redirect (favicon and the like).
fn parse_redirect(
    target: &str,
    expected_state: &str,
) -> Option<std::result::Result<String, AuthenticationError>> {
    let url = Url::parse(&format!("http://127.0.0.1{}", target)).ok()?;
    let params: HashMap<String, String> = url.query_pairs().into_owned().collect();

    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .map(String::as_str)
            .unwrap_or("sign-in was not completed");
        return Some(Err(AuthenticationError::InvalidCredentials(format!(
            "{}: {}",
            error, description
        ))));
    }

    let code = params.get("code")?;
    if params.get("state").map(String::as_str) != Some(expected_state) {
        return Some(Err(AuthenticationError::InvalidResponse(
            "sign-in redirect carried an unexpected state".into(),
        )));
    }
    Some(Ok(code.clone()))
}

#[async_trait]
impl AuthStrategy for InteractiveStrategy {
    fn method(&self) -> AuthenticationMethod {
        AuthenticationMethod::Interactive
    }

    fn scopes(&self, requested: Vec<String>) -> Vec<String> {
        with_offline_access(requested)
    }

    fn discriminator(&self, params: &AuthParams) -> Result<Option<String>> {
        Ok(params.username.clone())
    }

    async fn acquire(&self, ctx: &AuthContext<'_>) -> Result<AuthenticationResult> {
        if let Some(result) = self.silent(ctx).await {
            return Ok(result);
        }
        self.browser_sign_in(ctx).await
    }

    async fn refresh(&self, ctx: &AuthContext<'_>, refresh_token: &str) -> Result<AuthenticationResult> {
        redeem_refresh_token(ctx, refresh_token).await
    }
}

fn default_device_code_lifetime() -> u64 {
    900
}

fn default_poll_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default = "default_device_code_lifetime")]
    expires_in: u64,
    #[serde(default = "default_poll_interval")]
    interval: u64,
    #[serde(default)]
    message: String,
}

/// Device code flow for hosts without a browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceCodeStrategy;

#[async_trait]
impl AuthStrategy for DeviceCodeStrategy {
    fn method(&self) -> AuthenticationMethod {
        AuthenticationMethod::DeviceCode
    }

    fn scopes(&self, requested: Vec<String>) -> Vec<String> {
        with_offline_access(requested)
    }

    async fn acquire(&self, ctx: &AuthContext<'_>) -> Result<AuthenticationResult> {
        let scope = ctx.scope_string();
        let endpoints = ctx.identity.endpoints();

        let body = ctx
            .identity
            .post_form(
                &endpoints.device_code_endpoint(ctx.tenant()),
                &[("client_id", ctx.client_id()), ("scope", scope.as_str())],
            )
            .await?;
        if body.get("error").is_some() {
            return Ok(ctx.identity.map_logged(&body));
        }

        let device: DeviceCodeResponse = serde_json::from_value(body)
            .map_err(|e| AuthenticationError::InvalidResponse(format!("device code response: {}", e)))?;
        ctx.prompt
            .device_code(&device.message, &device.user_code, &device.verification_uri);

        let token_endpoint = endpoints.token_endpoint(ctx.tenant());
        let deadline = Instant::now() + Duration::from_secs(device.expires_in);
        let mut interval = Duration::from_secs(device.interval);

        loop {
            tokio::time::sleep(interval).await;
            if Instant::now() >= deadline {
                return Ok(AuthenticationResult::failure(
                    "expired_token",
                    Some("the device code expired before sign-in completed".into()),
                ));
            }

            let body = ctx
                .identity
                .post_form(
                    &token_endpoint,
                    &[
                        ("grant_type", DEVICE_CODE_GRANT),
                        ("client_id", ctx.client_id()),
                        ("device_code", device.device_code.as_str()),
                    ],
                )
                .await?;

            match body.get("error").and_then(Value::as_str) {
                Some("authorization_pending") => continue,
                Some("slow_down") => {
                    interval += Duration::from_secs(SLOW_DOWN_STEP_SECS);
                    debug!("Provider asked to slow down, polling every {:?}", interval);
                }
                _ => return Ok(ctx.identity.map_logged(&body)),
            }
        }
    }

    async fn refresh(&self, ctx: &AuthContext<'_>, refresh_token: &str) -> Result<AuthenticationResult> {
        redeem_refresh_token(ctx, refresh_token).await
    }
}

/// Resource owner password flow. Fails for MFA-enabled accounts.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsernamePasswordStrategy;

#[async_trait]
impl AuthStrategy for UsernamePasswordStrategy {
    fn method(&self) -> AuthenticationMethod {
        AuthenticationMethod::UsernamePassword
    }

    fn scopes(&self, requested: Vec<String>) -> Vec<String> {
        with_offline_access(requested)
    }

    fn discriminator(&self, params: &AuthParams) -> Result<Option<String>> {
        Ok(params.username.clone())
    }

    async fn acquire(&self, ctx: &AuthContext<'_>) -> Result<AuthenticationResult> {
        let (Some(username), Some(password)) = (&ctx.params.username, &ctx.params.password) else {
            return Err(ConfigurationError::new(
                "username/password authentication needs both a username and a password",
            )
            .into());
        };
        warn!("Using the username/password flow; prefer certificate or device code authentication");

        let scope = ctx.scope_string();
        let form = [
            ("grant_type", "password"),
            ("client_id", ctx.client_id()),
            ("username", username.as_str()),
            ("password", password.expose_secret()),
            ("scope", scope.as_str()),
        ];
        Ok(ctx.identity.request_token(ctx.tenant(), &form).await?)
    }

    async fn refresh(&self, ctx: &AuthContext<'_>, refresh_token: &str) -> Result<AuthenticationResult> {
        redeem_refresh_token(ctx, refresh_token).await
    }
}

/// Token from the instance metadata service of the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManagedIdentityStrategy;

#[async_trait]
impl AuthStrategy for ManagedIdentityStrategy {
    fn method(&self) -> AuthenticationMethod {
        AuthenticationMethod::ManagedIdentity
    }

    async fn acquire(&self, ctx: &AuthContext<'_>) -> Result<AuthenticationResult> {
        let resource = ctx
            .scopes
            .first()
            .map(|scope| scope.trim_end_matches("/.default"))
            .ok_or_else(|| ConfigurationError::new("managed identity needs a resource scope"))?;

        let mut query = vec![("api-version", IMDS_API_VERSION), ("resource", resource)];
        if !ctx.client_id().trim().is_empty() {
            query.push(("client_id", ctx.client_id()));
        }

        let body = ctx
            .identity
            .get_json(&ctx.identity.endpoints().imds_endpoint, &query, &[("Metadata", "true")])
            .await?;
        Ok(ctx.identity.map_logged(&body))
    }
}
