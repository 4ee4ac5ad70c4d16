//! Identity provider endpoints and the shared token response mapping.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;

use super::models::AuthenticationResult;
use crate::error::AuthenticationError;
use crate::sanitize::Sanitizer;

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Instance metadata endpoint used by managed identity.
pub const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

pub const IMDS_API_VERSION: &str = "2018-02-01";

/// Lifetime assumed when a successful response omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Where token requests are sent.
#[derive(Debug, Clone)]
pub struct IdentityEndpoints {
    pub authority_host: String,
    pub imds_endpoint: String,
}

impl Default for IdentityEndpoints {
    fn default() -> Self {
        Self {
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            imds_endpoint: DEFAULT_IMDS_ENDPOINT.to_string(),
        }
    }
}

impl IdentityEndpoints {
    pub fn new(authority_host: impl Into<String>) -> Self {
        Self {
            authority_host: authority_host.into(),
            ..Default::default()
        }
    }

    pub fn with_imds_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.imds_endpoint = endpoint.into();
        self
    }

    fn tenant_base(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0", self.authority_host.trim_end_matches('/'), tenant_id)
    }

    pub fn token_endpoint(&self, tenant_id: &str) -> String {
        format!("{}/token", self.tenant_base(tenant_id))
    }

    pub fn authorize_endpoint(&self, tenant_id: &str) -> String {
        format!("{}/authorize", self.tenant_base(tenant_id))
    }

    pub fn device_code_endpoint(&self, tenant_id: &str) -> String {
        format!("{}/devicecode", self.tenant_base(tenant_id))
    }
}

/// Thin HTTP client for the identity provider.
///
/// Provider rejections (`{"error": ...}` bodies) are returned as JSON so the
/// caller can map them; only transport failures and non-JSON bodies are
/// errors here.
#[derive(Debug, Clone)]
pub struct IdentityClient {
    http: reqwest::Client,
    endpoints: IdentityEndpoints,
    sanitizer: Arc<Sanitizer>,
}

impl IdentityClient {
    pub fn new(http: reqwest::Client, endpoints: IdentityEndpoints, sanitizer: Arc<Sanitizer>) -> Self {
        Self {
            http,
            endpoints,
            sanitizer,
        }
    }

    pub fn with_endpoints(mut self, endpoints: IdentityEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn endpoints(&self) -> &IdentityEndpoints {
        &self.endpoints
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    pub async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<Value, AuthenticationError> {
        debug!("POST {}", url);
        let response = self
            .http
            .post(url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| self.network_failure(url, e))?;

        self.read_json(url, response).await
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> Result<Value, AuthenticationError> {
        debug!("GET {}", url);
        let mut request = self.http.get(url).query(query);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request.send().await.map_err(|e| self.network_failure(url, e))?;

        self.read_json(url, response).await
    }

    /// POST a token request and map the provider's answer.
    pub async fn request_token(
        &self,
        tenant_id: &str,
        form: &[(&str, &str)],
    ) -> Result<AuthenticationResult, AuthenticationError> {
        let url = self.endpoints.token_endpoint(tenant_id);
        let body = self.post_form(&url, form).await?;
        Ok(self.map_logged(&body))
    }

    /// [`map_token_response`] with the failure logged through the sanitizer.
    pub fn map_logged(&self, body: &Value) -> AuthenticationResult {
        let result = map_token_response(body, Utc::now());
        if !result.success {
            warn!(
                "Identity provider rejected the request: {} {}",
                result.error.as_deref().unwrap_or("unknown_error"),
                self.sanitizer
                    .sanitize(result.error_description.as_deref().unwrap_or_default())
            );
        }
        result
    }

    async fn read_json(&self, url: &str, response: reqwest::Response) -> Result<Value, AuthenticationError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.network_failure(url, e))?;

        serde_json::from_str(&text).map_err(|_| {
            let detail = self.sanitizer.sanitize(text.chars().take(200).collect::<String>().as_str());
            AuthenticationError::InvalidResponse(format!("HTTP {} with non-JSON body: {}", status.as_u16(), detail))
        })
    }

    fn network_failure(&self, url: &str, error: reqwest::Error) -> AuthenticationError {
        AuthenticationError::NetworkFailure(format!("{}: {}", url, self.sanitizer.sanitize(&error.to_string())))
    }
}

/// Map a token endpoint response body onto an [`AuthenticationResult`].
///
/// `error` wins over everything; an `access_token` gives a success expiring
/// `expires_in` seconds after `now` (number or numeric string, as IMDS sends
/// strings); anything else is a generic invalid response.
pub fn map_token_response(body: &Value, now: DateTime<Utc>) -> AuthenticationResult {
    if let Some(error) = body.get("error") {
        let error = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let description = body
            .get("error_description")
            .and_then(Value::as_str)
            .map(str::to_string);
        return AuthenticationResult::failure(error, description);
    }

    let Some(access_token) = body.get("access_token").and_then(Value::as_str) else {
        return AuthenticationResult::failure(
            "invalid_response",
            Some("response contained neither an access token nor an error".into()),
        );
    };

    let lifetime = seconds_field(body, "expires_in").unwrap_or_else(|| {
        debug!("Token response has no expires_in, assuming {}s", DEFAULT_TOKEN_LIFETIME_SECS);
        DEFAULT_TOKEN_LIFETIME_SECS
    });

    let text = |name: &str| body.get(name).and_then(Value::as_str).map(str::to_string);

    let mut result = AuthenticationResult::success(access_token, now + Duration::seconds(lifetime))
        .with_refresh_token(text("refresh_token"))
        .with_scope(text("scope"));
    if let Some(token_type) = text("token_type") {
        result = result.with_token_type(token_type);
    }
    result
}

fn seconds_field(body: &Value, name: &str) -> Option<i64> {
    match body.get(name)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_maps_error_response() {
        let body = json!({
            "error": "invalid_client",
            "error_description": "AADSTS7000215: Invalid client secret provided."
        });
        let result = map_token_response(&body, Utc::now());
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("invalid_client"));
        assert!(result.error_description.unwrap().starts_with("AADSTS7000215"));
    }

    #[test]
    fn test_maps_success_with_numeric_and_string_lifetime() {
        let now = Utc::now();
        let numeric = map_token_response(
            &json!({"access_token": "abc", "expires_in": 3599, "token_type": "Bearer"}),
            now,
        );
        assert!(numeric.success);
        assert_eq!(numeric.expires_at, Some(now + Duration::seconds(3599)));

        let string = map_token_response(&json!({"access_token": "abc", "expires_in": "86399"}), now);
        assert_eq!(string.expires_at, Some(now + Duration::seconds(86399)));
    }

    #[test]
    fn test_error_wins_over_token() {
        let result = map_token_response(&json!({"access_token": "abc", "error": "x"}), Utc::now());
        assert!(!result.success);
    }

    #[test]
    fn test_maps_garbage_to_invalid_response() {
        let result = map_token_response(&json!({"hello": "world"}), Utc::now());
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("invalid_response"));
    }

    #[test]
    fn test_endpoint_layout() {
        let endpoints = IdentityEndpoints::new("https://login.example.com/");
        assert_eq!(
            endpoints.token_endpoint("contoso"),
            "https://login.example.com/contoso/oauth2/v2.0/token"
        );
        assert_eq!(
            endpoints.device_code_endpoint("contoso"),
            "https://login.example.com/contoso/oauth2/v2.0/devicecode"
        );
    }
}
