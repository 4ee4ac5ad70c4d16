//! Exchange Online sessions established through a [`SessionBridge`].
//!
//! Tokens come from a [`ResourceAuthenticator`] scoped to Exchange; the
//! bridge then runs `Connect-ExchangeOnline` with the shape that fits the
//! authentication method. Interactive sign-in is left to the module itself.

use chrono::Utc;
use log::{debug, info, warn};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::bridge::{SessionBridge, ps_quote};
use super::certificate::normalize_thumbprint;
use super::models::{AuthParams, AuthenticationMethod};
use super::resource::ResourceAuthenticator;
use crate::error::{ConfigurationError, Result, SessionError};
use crate::sanitize::Sanitizer;

pub const EXCHANGE_SCOPE: &str = "https://outlook.office365.com/.default";
pub const EXCHANGE_MODULE: &str = "ExchangeOnlineManagement";

const VERIFY_COMMAND: &str = "Get-ConnectionInformation | Where-Object { $_.State -eq 'Connected' } | Select-Object -First 1 -ExpandProperty State";
const DISCONNECT_COMMAND: &str = "Disconnect-ExchangeOnline -Confirm:$false";

#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    /// Tenant domain, e.g. `contoso.onmicrosoft.com`. Required for app-only connections.
    pub organization: String,
    pub module: String,
    pub connection_uri: Option<String>,
}

impl ExchangeSettings {
    pub fn new(organization: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            module: EXCHANGE_MODULE.to_string(),
            connection_uri: None,
        }
    }
}

pub struct DependentServiceAuthenticator {
    resource: Arc<ResourceAuthenticator>,
    bridge: Arc<dyn SessionBridge>,
    settings: ExchangeSettings,
    sanitizer: Arc<Sanitizer>,
    tooling_ready: AtomicBool,
    install_attempted: AtomicBool,
}

impl DependentServiceAuthenticator {
    pub fn new(
        resource: Arc<ResourceAuthenticator>,
        bridge: Arc<dyn SessionBridge>,
        settings: ExchangeSettings,
        sanitizer: Arc<Sanitizer>,
    ) -> Self {
        Self {
            resource,
            bridge,
            settings,
            sanitizer,
            tooling_ready: AtomicBool::new(false),
            install_attempted: AtomicBool::new(false),
        }
    }

    pub fn resource(&self) -> &ResourceAuthenticator {
        &self.resource
    }

    pub fn settings(&self) -> &ExchangeSettings {
        &self.settings
    }

    async fn module_present(&self) -> std::result::Result<bool, SessionError> {
        let module = ps_quote(&self.settings.module);
        let output = self
            .bridge
            .execute(&format!(
                "if (Get-Module -ListAvailable -Name {}) {{ 'present' }} else {{ 'missing' }}",
                module
            ))
            .await?;
        Ok(output.lines().any(|line| line.trim() == "present"))
    }

    /// Make sure the management module is installed, installing it once if not.
    pub async fn ensure_tooling(&self) -> std::result::Result<(), SessionError> {
        if self.tooling_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.module_present().await? {
            self.tooling_ready.store(true, Ordering::Release);
            return Ok(());
        }
        if self.install_attempted.swap(true, Ordering::AcqRel) {
            return Err(SessionError::ToolingUnavailable(format!(
                "{} is not installed and a previous install attempt failed",
                self.settings.module
            )));
        }

        info!("Installing PowerShell module {}", self.settings.module);
        self.bridge
            .execute(&format!(
                "Install-Module -Name {} -Scope CurrentUser -Force -AllowClobber",
                ps_quote(&self.settings.module)
            ))
            .await
            .map_err(|e| SessionError::ToolingUnavailable(format!("install failed: {}", e)))?;

        if self.module_present().await? {
            self.tooling_ready.store(true, Ordering::Release);
            Ok(())
        } else {
            Err(SessionError::ToolingUnavailable(format!(
                "{} still missing after install",
                self.settings.module
            )))
        }
    }

    /// `Connect-ExchangeOnline` invocation for a method.
    ///
    /// `access_token` is required for every method except certificate and
    /// interactive, which hand their material to the module directly.
    pub fn connection_command(
        &self,
        method: AuthenticationMethod,
        params: &AuthParams,
        access_token: Option<&str>,
    ) -> Result<String> {
        let mut command = String::from("Connect-ExchangeOnline -ShowBanner:$false");

        if method == AuthenticationMethod::Interactive {
            if let Some(username) = &params.username {
                command.push_str(&format!(" -UserPrincipalName {}", ps_quote(username)));
            }
        } else {
            if self.settings.organization.trim().is_empty() {
                return Err(ConfigurationError::new(
                    "an Exchange organization is required for app-only connections",
                )
                .into());
            }
            command.push_str(&format!(" -Organization {}", ps_quote(&self.settings.organization)));

            if method == AuthenticationMethod::Certificate {
                command.push_str(&format!(" -AppId {}", ps_quote(&params.client_id)));
                match (&params.certificate_path, &params.certificate_thumbprint) {
                    (Some(path), _) => {
                        command.push_str(&format!(
                            " -CertificateFilePath {}",
                            ps_quote(&path.display().to_string())
                        ));
                        if let Some(password) = &params.certificate_password {
                            command.push_str(&format!(
                                " -CertificatePassword (ConvertTo-SecureString -String {} -AsPlainText -Force)",
                                ps_quote(password.expose_secret())
                            ));
                        }
                    }
                    (None, Some(thumbprint)) => {
                        let thumbprint = normalize_thumbprint(thumbprint)?;
                        command.push_str(&format!(" -CertificateThumbprint {}", ps_quote(&thumbprint)));
                    }
                    (None, None) => {
                        return Err(ConfigurationError::new(
                            "certificate authentication needs a certificate path or thumbprint",
                        )
                        .into());
                    }
                }
            } else {
                let token = access_token.ok_or_else(|| {
                    ConfigurationError::new(format!("{} connections need an access token", method))
                })?;
                command.push_str(&format!(" -AccessToken {}", ps_quote(token)));
            }
        }

        if let Some(uri) = &self.settings.connection_uri {
            command.push_str(&format!(" -ConnectionUri {}", ps_quote(uri)));
        }
        Ok(command)
    }

    /// Open and verify a session. The caller must call
    /// [`ExchangeSession::disconnect`] when done.
    pub async fn connect(&self, method: AuthenticationMethod, params: &AuthParams) -> Result<ExchangeSession> {
        params.validate_for(method)?;
        self.ensure_tooling().await?;

        let command = match method {
            AuthenticationMethod::Interactive => self.connection_command(method, params, None)?,
            AuthenticationMethod::Certificate => {
                if let Some(path) = &params.certificate_path {
                    let password = params.certificate_password.as_ref().map(|p| p.expose_secret());
                    let bundle = self
                        .resource
                        .authenticator()
                        .certificates()
                        .load_from_file(path, password)
                        .await?;
                    bundle.ensure_valid_at(Utc::now())?;
                }
                self.connection_command(method, params, None)?
            }
            _ => {
                let result = self.resource.authenticate(method, params).await?;
                let token = result.token().ok_or_else(|| result.to_error())?;
                self.connection_command(method, params, Some(token))?
            }
        };

        info!("Connecting to Exchange Online with {}", method);
        debug!("{}", self.sanitizer.sanitize(&command));
        self.bridge
            .execute(&command)
            .await
            .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;

        let session = ExchangeSession::new(self.bridge.clone(), self.settings.organization.clone());
        if let Err(e) = self.verify().await {
            if let Err(disconnect_error) = session.disconnect().await {
                debug!("Cleanup after failed verification: {}", disconnect_error);
            }
            return Err(e.into());
        }

        info!("Exchange Online session established");
        Ok(session)
    }

    async fn verify(&self) -> std::result::Result<(), SessionError> {
        let output = self
            .bridge
            .execute(VERIFY_COMMAND)
            .await
            .map_err(|e| SessionError::VerificationFailed(e.to_string()))?;

        if output.lines().any(|line| line.trim().eq_ignore_ascii_case("connected")) {
            Ok(())
        } else {
            Err(SessionError::VerificationFailed(format!(
                "no connected session reported ({})",
                self.sanitizer.sanitize(output.trim())
            )))
        }
    }
}

/// A connected management session. Must be closed with [`disconnect`](Self::disconnect).
pub struct ExchangeSession {
    bridge: Arc<dyn SessionBridge>,
    organization: String,
    connected: bool,
}

impl ExchangeSession {
    fn new(bridge: Arc<dyn SessionBridge>, organization: String) -> Self {
        Self {
            bridge,
            organization,
            connected: true,
        }
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub async fn run(&self, command: &str) -> std::result::Result<String, SessionError> {
        self.bridge.execute(command).await
    }

    pub async fn disconnect(mut self) -> std::result::Result<(), SessionError> {
        self.connected = false;
        self.bridge.execute(DISCONNECT_COMMAND).await.map(|_| ())
    }
}

impl Drop for ExchangeSession {
    fn drop(&mut self) {
        if self.connected {
            warn!(
                "Exchange session for {} dropped without disconnect; the remote session stays open until it times out",
                self.organization
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullBridge;

    #[async_trait]
    impl SessionBridge for NullBridge {
        async fn execute(&self, _script: &str) -> std::result::Result<String, SessionError> {
            Ok(String::new())
        }
    }

    fn authenticator(organization: &str) -> DependentServiceAuthenticator {
        let sanitizer = Arc::new(Sanitizer::new());
        let resource = ResourceAuthenticator::new(crate::auth::Authenticator::new(
            EXCHANGE_SCOPE,
            reqwest::Client::new(),
            sanitizer.clone(),
        ));
        DependentServiceAuthenticator::new(
            Arc::new(resource),
            Arc::new(NullBridge),
            ExchangeSettings::new(organization),
            sanitizer,
        )
    }

    #[test]
    fn test_certificate_file_command() {
        let params = AuthParams::new("tenant", "app-client")
            .with_certificate("/secure/automation.pfx", Some("pfx-pass".into()));
        let command = authenticator("contoso.onmicrosoft.com")
            .connection_command(AuthenticationMethod::Certificate, &params, None)
            .unwrap();

        assert!(command.contains("-Organization 'contoso.onmicrosoft.com'"));
        assert!(command.contains("-AppId 'app-client'"));
        assert!(command.contains("-CertificateFilePath '/secure/automation.pfx'"));
        assert!(command.contains("ConvertTo-SecureString -String 'pfx-pass'"));

        let logged = Sanitizer::new().sanitize(&command);
        assert!(!logged.contains("pfx-pass"));
    }

    #[test]
    fn test_thumbprint_and_token_commands() {
        let exchange = authenticator("contoso.onmicrosoft.com");

        let params = AuthParams::new("tenant", "app-client")
            .with_thumbprint("19:dd:3e:74:c7:8a:3b:4d:0e:b2:9d:ec:db:f8:94:4a:91:92:4e:13");
        let command = exchange
            .connection_command(AuthenticationMethod::Certificate, &params, None)
            .unwrap();
        assert!(command.contains("-CertificateThumbprint '19DD3E74C78A3B4D0EB29DECDBF8944A91924E13'"));

        let params = AuthParams::new("tenant", "app-client").with_thumbprint("ABCDEF");
        assert!(exchange
            .connection_command(AuthenticationMethod::Certificate, &params, None)
            .is_err());

        let params = AuthParams::new("tenant", "app-client").with_client_secret("s");
        let command = exchange
            .connection_command(AuthenticationMethod::ClientSecret, &params, Some("tok"))
            .unwrap();
        assert!(command.contains("-AccessToken 'tok'"));
        assert!(exchange
            .connection_command(AuthenticationMethod::ClientSecret, &params, None)
            .is_err());
    }

    #[test]
    fn test_interactive_command_needs_no_organization() {
        let params = AuthParams::new("tenant", "app-client").with_user("admin@contoso.com", None);
        let command = authenticator("")
            .connection_command(AuthenticationMethod::Interactive, &params, None)
            .unwrap();
        assert_eq!(
            command,
            "Connect-ExchangeOnline -ShowBanner:$false -UserPrincipalName 'admin@contoso.com'"
        );

        let app_only = AuthParams::new("tenant", "app-client").with_thumbprint("ABCDEF");
        assert!(authenticator("")
            .connection_command(AuthenticationMethod::Certificate, &app_only, None)
            .is_err());
    }
}
