//! Wiring shared by every command: config, sanitizer, HTTP client.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use m365_admin::api::{ApiClient, ResourceKind, build_http_client};
use m365_admin::auth::exchange::EXCHANGE_SCOPE;
use m365_admin::auth::resource::GRAPH_SCOPE;
use m365_admin::auth::{
    AuthParams, AuthenticationMethod, Authenticator, BoundCredentials, DependentServiceAuthenticator,
    PowerShellBridge, ResourceAuthenticator,
};
use m365_admin::config::AppConfig;
use m365_admin::sanitize::Sanitizer;

pub struct AppContext {
    pub config: AppConfig,
    pub app_dir: PathBuf,
    pub sanitizer: Arc<Sanitizer>,
    pub http: reqwest::Client,
}

impl AppContext {
    pub fn load() -> Result<Self> {
        let config = AppConfig::load().context("Failed to load configuration")?;
        let app_dir = AppConfig::app_dir()?;
        let http = build_http_client(config.api.timeout()).context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            app_dir,
            sanitizer: Arc::new(Sanitizer::new()),
            http,
        })
    }

    pub fn params(&self) -> AuthParams {
        self.config.identity.auth_params()
    }

    /// Explicit method if given (checked against the config), else the configured one.
    pub fn method(&self, requested: Option<AuthenticationMethod>) -> Result<AuthenticationMethod> {
        match requested {
            Some(method) => {
                self.params().validate_for(method)?;
                Ok(method)
            }
            None => Ok(self.config.validate()?),
        }
    }

    pub fn resource_authenticator(&self, scope: &str) -> ResourceAuthenticator {
        let inner = Authenticator::new(scope, self.http.clone(), self.sanitizer.clone())
            .with_endpoints(self.config.identity.endpoints())
            .with_cache(self.config.token_cache.cache(&self.app_dir))
            .with_interactive_timeout(self.config.identity.interactive_timeout());
        ResourceAuthenticator::new(inner)
    }

    pub fn graph_authenticator(&self) -> ResourceAuthenticator {
        self.resource_authenticator(GRAPH_SCOPE)
    }

    pub fn api_client(&self, method: AuthenticationMethod) -> ApiClient {
        let credentials = BoundCredentials::new(Arc::new(self.graph_authenticator()), method, self.params());
        let api = &self.config.api;

        let mut client = ApiClient::new(Arc::new(credentials), self.http.clone(), self.sanitizer.clone())
            .with_base_url(api.base_url())
            .with_resilience(api.resilience())
            .with_timeout(api.timeout());
        for kind in ResourceKind::ALL {
            client = client.with_ttl(kind, api.ttl.get(kind));
        }
        client
    }

    pub fn exchange(&self) -> (DependentServiceAuthenticator, Arc<PowerShellBridge>) {
        let bridge = Arc::new(PowerShellBridge::new(
            self.config.exchange.shell.clone(),
            self.sanitizer.clone(),
        ));
        let authenticator = DependentServiceAuthenticator::new(
            Arc::new(self.resource_authenticator(EXCHANGE_SCOPE)),
            bridge.clone(),
            self.config.exchange.settings(),
            self.sanitizer.clone(),
        );
        (authenticator, bridge)
    }
}
