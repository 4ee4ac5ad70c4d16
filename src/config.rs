//! Application configuration.
//!
//! Loaded from `config.toml` in the application directory, then overlaid by
//! `M365_*` environment variables.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::cache::ResourceKind;
use crate::api::constants;
use crate::api::resilience::ResilienceConfig;
use crate::auth::bridge::DEFAULT_SHELL;
use crate::auth::exchange::EXCHANGE_MODULE;
use crate::auth::identity::{DEFAULT_AUTHORITY_HOST, IdentityEndpoints};
use crate::auth::token_cache::DEFAULT_CACHE_FILE;
use crate::auth::{AuthParams, AuthenticationMethod, ExchangeSettings, TokenCache};
use crate::error::ConfigurationError;

const APP_NAME: &str = "m365-admin";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub identity: IdentitySettings,
    pub api: ApiSettings,
    pub token_cache: TokenCacheSettings,
    pub exchange: ExchangeConfig,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub certificate_path: Option<PathBuf>,
    pub certificate_password: Option<String>,
    pub certificate_thumbprint: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub authority_host: String,
    /// Explicit method; inferred from the credential material when absent.
    pub method: Option<AuthenticationMethod>,
    pub interactive_timeout_secs: u64,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: None,
            certificate_path: None,
            certificate_password: None,
            certificate_thumbprint: None,
            username: None,
            password: None,
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            method: None,
            interactive_timeout_secs: 300,
        }
    }
}

impl fmt::Debug for IdentitySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |value: &Option<String>| value.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("IdentitySettings")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &redacted(&self.client_secret))
            .field("certificate_path", &self.certificate_path)
            .field("certificate_password", &redacted(&self.certificate_password))
            .field("certificate_thumbprint", &self.certificate_thumbprint)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("authority_host", &self.authority_host)
            .field("method", &self.method)
            .finish()
    }
}

impl IdentitySettings {
    pub fn auth_params(&self) -> AuthParams {
        let mut params = AuthParams::new(self.tenant_id.trim(), self.client_id.trim());
        if let Some(secret) = &self.client_secret {
            params = params.with_client_secret(secret.clone());
        }
        if let Some(path) = &self.certificate_path {
            params = params.with_certificate(path.clone(), self.certificate_password.clone());
        }
        if let Some(thumbprint) = &self.certificate_thumbprint {
            params = params.with_thumbprint(thumbprint.clone());
        }
        if let Some(username) = &self.username {
            params = params.with_user(username.clone(), self.password.clone());
        }
        params
    }

    /// Configured method, or the best one the credential material supports.
    pub fn resolve_method(&self) -> Option<AuthenticationMethod> {
        self.method.or_else(|| self.auth_params().infer_method())
    }

    pub fn endpoints(&self) -> IdentityEndpoints {
        IdentityEndpoints::new(self.authority_host.clone())
    }

    pub fn interactive_timeout(&self) -> Duration {
        Duration::from_secs(self.interactive_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub graph_host: String,
    pub api_version: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// HTTP attempts per request across retries and re-authentication.
    pub attempt_ceiling: Option<u32>,
    pub ttl: TtlSettings,
}

impl Default for ApiSettings {
    fn default() -> Self {
        let retry = ResilienceConfig::default().retry;
        Self {
            graph_host: constants::GRAPH_HOST.to_string(),
            api_version: constants::API_VERSION.to_string(),
            timeout_secs: 120,
            max_retries: retry.max_retries(),
            base_delay_ms: retry.base_delay.as_millis() as u64,
            max_delay_ms: retry.max_delay.as_millis() as u64,
            jitter: retry.jitter,
            attempt_ceiling: None,
            ttl: TtlSettings::default(),
        }
    }
}

impl ApiSettings {
    pub fn base_url(&self) -> String {
        format!("{}/{}", self.graph_host.trim_end_matches('/'), self.api_version)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn resilience(&self) -> ResilienceConfig {
        let mut builder = ResilienceConfig::builder()
            .max_retries(self.max_retries)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .jitter(self.jitter);
        if let Some(ceiling) = self.attempt_ceiling {
            builder = builder.attempt_ceiling(ceiling);
        }
        builder.build()
    }
}

/// Response cache lifetimes in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlSettings {
    pub users: i64,
    pub groups: i64,
    pub licenses: i64,
    pub mailboxes: i64,
    pub reports: i64,
}

impl Default for TtlSettings {
    fn default() -> Self {
        let secs = |kind: ResourceKind| kind.default_ttl().num_seconds();
        Self {
            users: secs(ResourceKind::Users),
            groups: secs(ResourceKind::Groups),
            licenses: secs(ResourceKind::Licenses),
            mailboxes: secs(ResourceKind::Mailboxes),
            reports: secs(ResourceKind::Reports),
        }
    }
}

impl TtlSettings {
    pub fn get(&self, kind: ResourceKind) -> chrono::Duration {
        let secs = match kind {
            ResourceKind::Users => self.users,
            ResourceKind::Groups => self.groups,
            ResourceKind::Licenses => self.licenses,
            ResourceKind::Mailboxes => self.mailboxes,
            ResourceKind::Reports => self.reports,
        };
        chrono::Duration::seconds(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenCacheSettings {
    pub enabled: bool,
    pub path: Option<PathBuf>,
}

impl Default for TokenCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

impl TokenCacheSettings {
    pub fn cache(&self, app_dir: &Path) -> TokenCache {
        if !self.enabled {
            return TokenCache::disabled();
        }
        TokenCache::new(
            self.path
                .clone()
                .unwrap_or_else(|| app_dir.join(DEFAULT_CACHE_FILE)),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub organization: Option<String>,
    pub shell: String,
    pub module: String,
    pub connection_uri: Option<String>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            organization: None,
            shell: DEFAULT_SHELL.to_string(),
            module: EXCHANGE_MODULE.to_string(),
            connection_uri: None,
        }
    }
}

impl ExchangeConfig {
    pub fn settings(&self) -> ExchangeSettings {
        let mut settings = ExchangeSettings::new(self.organization.clone().unwrap_or_default());
        settings.module = self.module.clone();
        settings.connection_uri = self.connection_uri.clone();
        settings
    }
}

impl AppConfig {
    /// Per-user application directory, created on first use.
    pub fn app_dir() -> Result<PathBuf> {
        let app_dir = if cfg!(target_os = "linux") {
            // Use XDG config directory on Linux
            dirs::config_dir()
                .context("Failed to get XDG config directory")?
                .join(APP_NAME)
        } else {
            // Use home directory with dot prefix on Windows/Mac
            dirs::home_dir()
                .context("Failed to get home directory")?
                .join(format!(".{}", APP_NAME))
        };

        if !app_dir.exists() {
            fs::create_dir_all(&app_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", app_dir))?;
            info!("Created config directory: {:?}", app_dir);
        }

        Ok(app_dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("config.toml"))
    }

    /// Config file plus environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Parse a config file, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Loading config from: {:?}", path);

        if !path.exists() {
            info!("Config file doesn't exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        debug!("Saving config to: {:?}", config_path);

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        info!("Config saved successfully");
        Ok(())
    }

    /// Overlay `M365_*` variables read through `lookup`. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let identity = &mut self.identity;

        if let Some(value) = var("M365_TENANT_ID") {
            identity.tenant_id = value;
        }
        if let Some(value) = var("M365_CLIENT_ID") {
            identity.client_id = value;
        }
        if let Some(value) = var("M365_CLIENT_SECRET") {
            identity.client_secret = Some(value);
        }
        if let Some(value) = var("M365_CERTIFICATE_PATH") {
            identity.certificate_path = Some(PathBuf::from(value));
        }
        if let Some(value) = var("M365_CERTIFICATE_PASSWORD") {
            identity.certificate_password = Some(value);
        }
        if let Some(value) = var("M365_CERTIFICATE_THUMBPRINT") {
            identity.certificate_thumbprint = Some(value);
        }
        if let Some(value) = var("M365_USERNAME") {
            identity.username = Some(value);
        }
        if let Some(value) = var("M365_PASSWORD") {
            identity.password = Some(value);
        }
        if let Some(value) = var("M365_AUTH_METHOD") {
            match value.parse() {
                Ok(method) => identity.method = Some(method),
                Err(e) => log::warn!("Ignoring M365_AUTH_METHOD: {}", e),
            }
        }
        if let Some(value) = var("M365_EXCHANGE_ORGANIZATION") {
            self.exchange.organization = Some(value);
        }
    }

    /// Check identity settings and pick the method to use.
    ///
    /// Runs before any network call.
    pub fn validate(&self) -> std::result::Result<AuthenticationMethod, ConfigurationError> {
        let method = self.identity.resolve_method();

        if method != Some(AuthenticationMethod::ManagedIdentity) {
            if self.identity.tenant_id.trim().is_empty() {
                return Err(ConfigurationError::new(
                    "tenant id is missing (set identity.tenant_id or M365_TENANT_ID)",
                ));
            }
            if self.identity.client_id.trim().is_empty() {
                return Err(ConfigurationError::new(
                    "client id is missing (set identity.client_id or M365_CLIENT_ID)",
                ));
            }
        }

        let method = method.ok_or_else(|| {
            ConfigurationError::new(
                "no authentication method configured and none can be inferred from the credentials",
            )
        })?;
        self.identity.auth_params().validate_for(method)?;

        if self.api.max_retries > 20 {
            return Err(ConfigurationError::new("api.max_retries must be 20 or less"));
        }
        if self.api.attempt_ceiling == Some(0) {
            return Err(ConfigurationError::new("api.attempt_ceiling must be at least 1"));
        }

        Ok(method)
    }
}
