use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{AuthenticationError, ConfigurationError};

/// Supported ways of obtaining a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationMethod {
    Certificate,
    ClientSecret,
    Interactive,
    DeviceCode,
    /// Resource owner password flow. Discouraged; kept for legacy tenants.
    UsernamePassword,
    ManagedIdentity,
}

impl AuthenticationMethod {
    pub const ALL: [AuthenticationMethod; 6] = [
        AuthenticationMethod::Certificate,
        AuthenticationMethod::ClientSecret,
        AuthenticationMethod::Interactive,
        AuthenticationMethod::DeviceCode,
        AuthenticationMethod::UsernamePassword,
        AuthenticationMethod::ManagedIdentity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthenticationMethod::Certificate => "certificate",
            AuthenticationMethod::ClientSecret => "client_secret",
            AuthenticationMethod::Interactive => "interactive",
            AuthenticationMethod::DeviceCode => "device_code",
            AuthenticationMethod::UsernamePassword => "username_password",
            AuthenticationMethod::ManagedIdentity => "managed_identity",
        }
    }

    /// Methods that act on behalf of a signed-in user.
    pub fn is_delegated(&self) -> bool {
        matches!(
            self,
            AuthenticationMethod::Interactive
                | AuthenticationMethod::DeviceCode
                | AuthenticationMethod::UsernamePassword
        )
    }
}

impl fmt::Display for AuthenticationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthenticationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown authentication method '{}' (expected one of: {})",
                    s,
                    Self::ALL.map(|m| m.as_str()).join(", ")
                )
            })
    }
}

/// Result of one authentication attempt. Immutable once built.
#[derive(Clone, PartialEq)]
pub struct AuthenticationResult {
    pub success: bool,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub scope: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl AuthenticationResult {
    pub fn success(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            access_token: Some(access_token.into()),
            expires_at: Some(expires_at),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            scope: None,
            error: None,
            error_description: None,
        }
    }

    pub fn failure(error: impl Into<String>, description: Option<String>) -> Self {
        Self {
            success: false,
            access_token: None,
            expires_at: None,
            refresh_token: None,
            token_type: "Bearer".to_string(),
            scope: None,
            error: Some(error.into()),
            error_description: description,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: Option<String>) -> Self {
        self.refresh_token = refresh_token;
        self
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    /// True when there is no expiry or it has passed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at,
            None => true,
        }
    }

    /// The access token, if this is a successful result carrying one.
    pub fn token(&self) -> Option<&str> {
        if !self.success {
            return None;
        }
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }

    /// Turn a failed result into the matching typed error.
    pub fn to_error(&self) -> AuthenticationError {
        match (&self.error, &self.error_description) {
            (Some(error), Some(description)) => {
                AuthenticationError::InvalidCredentials(format!("{}: {}", error, description))
            }
            (Some(error), None) => AuthenticationError::InvalidCredentials(error.clone()),
            (None, _) => AuthenticationError::InvalidResponse("no access token returned".into()),
        }
    }
}

impl fmt::Debug for AuthenticationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationResult")
            .field("success", &self.success)
            .field("access_token", &self.access_token.as_ref().map(|_| "[redacted]"))
            .field("expires_at", &self.expires_at)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("error", &self.error)
            .field("error_description", &self.error_description)
            .finish()
    }
}

/// Identity parameters for one authentication call.
///
/// Secrets are wrapped so they never show up in `Debug` output and are
/// never part of a cache key.
#[derive(Debug, Clone, Default)]
pub struct AuthParams {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Option<SecretString>,
    pub certificate_path: Option<PathBuf>,
    pub certificate_password: Option<SecretString>,
    pub certificate_thumbprint: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Overrides the authenticator's default scopes when non-empty.
    pub scopes: Vec<String>,
}

impl AuthParams {
    pub fn new(tenant_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(SecretString::from(secret.into()));
        self
    }

    pub fn with_certificate(mut self, path: impl Into<PathBuf>, password: Option<String>) -> Self {
        self.certificate_path = Some(path.into());
        self.certificate_password = password.map(SecretString::from);
        self
    }

    pub fn with_thumbprint(mut self, thumbprint: impl Into<String>) -> Self {
        self.certificate_thumbprint = Some(thumbprint.into());
        self
    }

    pub fn with_user(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password.map(SecretString::from);
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Check that the parameters a method needs are present.
    pub fn validate_for(&self, method: AuthenticationMethod) -> Result<(), ConfigurationError> {
        if method != AuthenticationMethod::ManagedIdentity {
            if self.tenant_id.trim().is_empty() {
                return Err(ConfigurationError::new("tenant id is required"));
            }
            if self.client_id.trim().is_empty() {
                return Err(ConfigurationError::new("client id is required"));
            }
        }

        match method {
            AuthenticationMethod::Certificate => {
                if self.certificate_path.is_none() && self.certificate_thumbprint.is_none() {
                    return Err(ConfigurationError::new(
                        "certificate authentication needs a certificate path or thumbprint",
                    ));
                }
            }
            AuthenticationMethod::ClientSecret => {
                if self.client_secret.is_none() {
                    return Err(ConfigurationError::new(
                        "client secret authentication needs a client secret",
                    ));
                }
            }
            AuthenticationMethod::UsernamePassword => {
                if self.username.is_none() || self.password.is_none() {
                    return Err(ConfigurationError::new(
                        "username/password authentication needs both a username and a password",
                    ));
                }
            }
            AuthenticationMethod::Interactive
            | AuthenticationMethod::DeviceCode
            | AuthenticationMethod::ManagedIdentity => {}
        }

        Ok(())
    }

    /// Best method the parameters support, in order of preference.
    pub fn infer_method(&self) -> Option<AuthenticationMethod> {
        if self.certificate_path.is_some() || self.certificate_thumbprint.is_some() {
            Some(AuthenticationMethod::Certificate)
        } else if self.client_secret.is_some() {
            Some(AuthenticationMethod::ClientSecret)
        } else if self.username.is_some() && self.password.is_some() {
            Some(AuthenticationMethod::UsernamePassword)
        } else {
            None
        }
    }
}

/// Claims read from an access token for diagnostics only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub appid: Option<String>,
    #[serde(default)]
    pub upn: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub scp: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
}

impl TokenClaims {
    /// Sign-in name of the user the token was issued to. Work accounts
    /// carry `upn`; personal and guest accounts only `preferred_username`.
    pub fn user(&self) -> Option<&str> {
        self.upn.as_deref().or(self.preferred_username.as_deref())
    }
}

/// Human oriented summary of a token, built from [`TokenClaims`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenInfo {
    pub audience: Option<String>,
    pub tenant_id: Option<String>,
    pub app_id: Option<String>,
    pub user: Option<String>,
    pub scopes: Vec<String>,
    pub roles: Vec<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
}
