mod common;

use async_trait::async_trait;
use common::*;
use m365_admin::auth::exchange::EXCHANGE_SCOPE;
use m365_admin::auth::{
    AuthParams, AuthenticationMethod, Authenticator, DependentServiceAuthenticator, ExchangeSettings,
    IdentityEndpoints, ResourceAuthenticator, SessionBridge, SilentPrompt, TokenCache,
};
use m365_admin::error::{CertificateError, Error, SessionError};
use m365_admin::sanitize::Sanitizer;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ORGANIZATION: &str = "contoso.onmicrosoft.com";

/// Records every script and answers the handful the authenticator sends.
struct ScriptedBridge {
    scripts: Mutex<Vec<String>>,
    module_installed: AtomicBool,
    install_works: bool,
    connection_state: String,
}

impl ScriptedBridge {
    fn new(module_installed: bool, install_works: bool, connection_state: &str) -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            module_installed: AtomicBool::new(module_installed),
            install_works,
            connection_state: connection_state.to_string(),
        }
    }

    fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.scripts().iter().filter(|s| s.starts_with(prefix)).count()
    }
}

#[async_trait]
impl SessionBridge for ScriptedBridge {
    async fn execute(&self, script: &str) -> Result<String, SessionError> {
        self.scripts.lock().unwrap().push(script.to_string());

        if script.starts_with("if (Get-Module") {
            let present = self.module_installed.load(Ordering::SeqCst);
            return Ok(if present { "present\n" } else { "missing\n" }.to_string());
        }
        if script.starts_with("Install-Module") {
            if !self.install_works {
                return Err(SessionError::Bridge("Unable to resolve package source 'PSGallery'".into()));
            }
            self.module_installed.store(true, Ordering::SeqCst);
            return Ok(String::new());
        }
        if script.starts_with("Get-ConnectionInformation") {
            return Ok(self.connection_state.clone());
        }
        if script.starts_with("Get-Mailbox") {
            return Ok("adele@contoso.com\n".to_string());
        }
        Ok(String::new())
    }
}

fn exchange(authority: &str, bridge: Arc<ScriptedBridge>, organization: &str) -> DependentServiceAuthenticator {
    let sanitizer = Arc::new(Sanitizer::new());
    let inner = Authenticator::new(EXCHANGE_SCOPE, reqwest::Client::new(), sanitizer.clone())
        .with_endpoints(IdentityEndpoints::new(authority))
        .with_cache(TokenCache::disabled())
        .with_prompt(Arc::new(SilentPrompt));

    DependentServiceAuthenticator::new(
        Arc::new(ResourceAuthenticator::new(inner)),
        bridge,
        ExchangeSettings::new(organization),
        sanitizer,
    )
}

#[tokio::test]
async fn test_token_connection_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(token_path()))
        .and(body_string_contains("scope=https%3A%2F%2Foutlook.office365.com%2F.default"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("exchange-token")))
        .expect(1)
        .mount(&server)
        .await;

    let bridge = Arc::new(ScriptedBridge::new(true, true, "Connected\n"));
    let exchange = exchange(&server.uri(), bridge.clone(), ORGANIZATION);
    let params = AuthParams::new(TENANT, CLIENT_ID).with_client_secret("s3cret-value");

    let session = exchange
        .connect(AuthenticationMethod::ClientSecret, &params)
        .await
        .unwrap();
    assert_eq!(session.organization(), ORGANIZATION);
    assert_eq!(session.run("Get-Mailbox -ResultSize 1").await.unwrap().trim(), "adele@contoso.com");
    session.disconnect().await.unwrap();

    let connect = bridge
        .scripts()
        .into_iter()
        .find(|s| s.starts_with("Connect-ExchangeOnline"))
        .unwrap();
    assert!(connect.contains("-Organization 'contoso.onmicrosoft.com'"));
    assert!(connect.contains("-AccessToken 'exchange-token'"));
    assert_eq!(bridge.count("Install-Module"), 0);
    assert_eq!(bridge.count("Disconnect-ExchangeOnline"), 1);
}

#[tokio::test]
async fn test_missing_module_is_installed_once() {
    let bridge = Arc::new(ScriptedBridge::new(false, true, "Connected"));
    let exchange = exchange("http://127.0.0.1:9", bridge.clone(), ORGANIZATION);

    exchange.ensure_tooling().await.unwrap();
    exchange.ensure_tooling().await.unwrap();

    assert_eq!(bridge.count("Install-Module"), 1);
    assert!(bridge.scripts()[1].contains("-Name 'ExchangeOnlineManagement'"));
}

#[tokio::test]
async fn test_failed_install_is_not_repeated() {
    let bridge = Arc::new(ScriptedBridge::new(false, false, "Connected"));
    let exchange = exchange("http://127.0.0.1:9", bridge.clone(), ORGANIZATION);

    let first = exchange.ensure_tooling().await.unwrap_err();
    assert!(matches!(first, SessionError::ToolingUnavailable(_)));

    let second = exchange.ensure_tooling().await.unwrap_err();
    assert!(matches!(second, SessionError::ToolingUnavailable(_)));
    assert_eq!(bridge.count("Install-Module"), 1);
}

#[tokio::test]
async fn test_unverified_session_is_torn_down() {
    let bridge = Arc::new(ScriptedBridge::new(true, true, ""));
    let exchange = exchange("http://127.0.0.1:9", bridge.clone(), ORGANIZATION);
    let params = AuthParams::new(TENANT, CLIENT_ID).with_thumbprint(FIXTURE_THUMBPRINT);

    let err = exchange
        .connect(AuthenticationMethod::Certificate, &params)
        .await
        .err()
        .unwrap();

    assert!(matches!(err, Error::Session(SessionError::VerificationFailed(_))));
    let scripts = bridge.scripts();
    let connect = scripts.iter().find(|s| s.starts_with("Connect-ExchangeOnline")).unwrap();
    assert!(connect.contains(&format!("-CertificateThumbprint '{}'", FIXTURE_THUMBPRINT)));
    assert_eq!(scripts.last().map(String::as_str), Some("Disconnect-ExchangeOnline -Confirm:$false"));
}

#[tokio::test]
async fn test_expired_certificate_never_reaches_the_bridge_connect() {
    let bridge = Arc::new(ScriptedBridge::new(true, true, "Connected"));
    let exchange = exchange("http://127.0.0.1:9", bridge.clone(), ORGANIZATION);
    let params = AuthParams::new(TENANT, CLIENT_ID).with_certificate(fixture("expired.pem"), None);

    let err = exchange
        .connect(AuthenticationMethod::Certificate, &params)
        .await
        .err()
        .unwrap();

    assert!(matches!(err, Error::Certificate(CertificateError::Expired(_))));
    assert_eq!(bridge.count("Connect-ExchangeOnline"), 0);
}

#[tokio::test]
async fn test_rejected_token_stops_before_connecting() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "unauthorized_client",
            "error_description": "AADSTS700016: Application not found in the directory."
        })))
        .expect(1)
        .mount(&server)
        .await;

    let bridge = Arc::new(ScriptedBridge::new(true, true, "Connected"));
    let exchange = exchange(&server.uri(), bridge.clone(), ORGANIZATION);
    let params = AuthParams::new(TENANT, CLIENT_ID).with_client_secret("s3cret-value");

    let err = exchange
        .connect(AuthenticationMethod::ClientSecret, &params)
        .await
        .err()
        .unwrap();

    assert!(matches!(err, Error::Authentication(_)));
    assert_eq!(bridge.count("Connect-ExchangeOnline"), 0);
}

#[tokio::test]
async fn test_app_only_connection_needs_an_organization() {
    let bridge = Arc::new(ScriptedBridge::new(true, true, "Connected"));
    let exchange = exchange("http://127.0.0.1:9", bridge.clone(), "");
    let params = AuthParams::new(TENANT, CLIENT_ID).with_thumbprint(FIXTURE_THUMBPRINT);

    let err = exchange
        .connect(AuthenticationMethod::Certificate, &params)
        .await
        .err()
        .unwrap();

    assert!(matches!(err, Error::Configuration(_)));
    assert_eq!(bridge.count("Connect-ExchangeOnline"), 0);
}

#[tokio::test]
async fn test_thumbprint_is_normalized_before_connecting() {
    let bridge = Arc::new(ScriptedBridge::new(true, true, "Connected"));
    let exchange = exchange("http://127.0.0.1:9", bridge.clone(), ORGANIZATION);
    let params = AuthParams::new(TENANT, CLIENT_ID)
        .with_thumbprint("19:dd:3e:74:c7:8a:3b:4d:0e:b2:9d:ec:db:f8:94:4a:91:92:4e:13");

    let session = exchange
        .connect(AuthenticationMethod::Certificate, &params)
        .await
        .unwrap();
    session.disconnect().await.unwrap();

    let connect = bridge
        .scripts()
        .into_iter()
        .find(|s| s.starts_with("Connect-ExchangeOnline"))
        .unwrap();
    assert!(connect.contains(&format!("-CertificateThumbprint '{}'", FIXTURE_THUMBPRINT)));

    let malformed = AuthParams::new(TENANT, CLIENT_ID).with_thumbprint("not-a-thumbprint");
    let err = exchange
        .connect(AuthenticationMethod::Certificate, &malformed)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Certificate(CertificateError::Malformed(_))));
    assert_eq!(bridge.count("Connect-ExchangeOnline"), 1);
}
