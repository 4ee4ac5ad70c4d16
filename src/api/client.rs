//! Microsoft Graph client with retries, pagination and re-authentication.

use chrono::Duration as TtlDuration;
use log::{debug, warn};
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::cache::{ResourceKind, ResponseCache};
use super::constants::{self, endpoints, headers, odata};
use super::resilience::{
    ApiLogger, AttemptBudget, AttemptFailure, OperationContext, ResilienceConfig, RetryPolicy,
    RetryableError, retry::parse_retry_after,
};
use crate::auth::TokenProvider;
use crate::error::{ApiError, AuthenticationError, ConfigurationError, Result};
use crate::sanitize::Sanitizer;

/// Per-request timeout applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const USER_FIELDS: &str = "id,displayName,userPrincipalName,mail,accountEnabled,assignedLicenses";
const GROUP_FIELDS: &str = "id,displayName,mail,mailEnabled,securityEnabled,groupTypes";
const MAILBOX_FIELDS: &str = "id,displayName,userPrincipalName,mail,proxyAddresses";

/// Shared HTTP client with pooled connections.
pub fn build_http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("m365-admin/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Resource API client.
///
/// Each call follows the same path: take a token from the provider, send
/// with bounded transport retries, and on a 401 invalidate the token and
/// try once more with a fresh one. Convenience reads go through a per-kind
/// TTL cache; raw requests never do.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    resilience: ResilienceConfig,
    retry: RetryPolicy,
    logger: ApiLogger,
    cache: ResponseCache,
    sanitizer: Arc<Sanitizer>,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(tokens: Arc<dyn TokenProvider>, http: reqwest::Client, sanitizer: Arc<Sanitizer>) -> Self {
        let resilience = ResilienceConfig::default();
        Self {
            http,
            base_url: constants::graph_base_url(),
            tokens,
            retry: RetryPolicy::new(resilience.retry.clone()),
            logger: ApiLogger::new(resilience.monitoring.clone()),
            resilience,
            cache: ResponseCache::new(),
            sanitizer,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.retry = RetryPolicy::new(resilience.retry.clone());
        self.logger = ApiLogger::new(resilience.monitoring.clone());
        self.resilience = resilience;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ttl(mut self, kind: ResourceKind, ttl: TtlDuration) -> Self {
        self.cache = self.cache.with_ttl(kind, ttl);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn invalidate(&self, kind: ResourceKind) {
        self.cache.invalidate(kind)
    }

    pub fn clear_cache(&self) {
        self.cache.clear()
    }

    pub async fn get(&self, endpoint: &str) -> Result<Value> {
        self.request(Method::GET, endpoint, &[], None).await
    }

    pub async fn post(&self, endpoint: &str, body: &Value) -> Result<Value> {
        self.request(Method::POST, endpoint, &[], Some(body)).await
    }

    pub async fn patch(&self, endpoint: &str, body: &Value) -> Result<Value> {
        self.request(Method::PATCH, endpoint, &[], Some(body)).await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<Value> {
        self.request(Method::DELETE, endpoint, &[], None).await
    }

    /// Send any request. Never cached.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let query = owned_query(query);
        self.send(method, endpoint, &query, body).await
    }

    /// GET a collection, following `@odata.nextLink` until it runs out.
    ///
    /// Items keep page order and in-page order.
    pub async fn list_all(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<Vec<Value>> {
        let mut next = endpoint.to_string();
        let mut query = owned_query(query);
        let mut items = Vec::new();
        let mut pages = 0;

        loop {
            let mut page = self.send(Method::GET, &next, &query, None).await?;
            pages += 1;

            match page.get_mut(odata::VALUE).map(Value::take) {
                Some(Value::Array(values)) => items.extend(values),
                Some(_) | None => debug!("Page {} of {} carried no value array", pages, endpoint),
            }

            match page.get(odata::NEXT_LINK).and_then(Value::as_str) {
                Some(link) => {
                    // The bearer token must not follow a link off the API host.
                    if !constants::same_origin(&self.base_url, link) {
                        return Err(ApiError::Unexpected {
                            status: 200,
                            message: format!(
                                "{} on page {} of {} points outside {}",
                                odata::NEXT_LINK,
                                pages,
                                endpoint,
                                self.base_url
                            ),
                        }
                        .into());
                    }
                    next = link.to_string();
                    // The link already carries the original query.
                    query.clear();
                }
                None => break,
            }
        }

        debug!("Fetched {} items from {} in {} pages", items.len(), endpoint, pages);
        Ok(items)
    }

    pub async fn list_users(&self) -> Result<Vec<Value>> {
        self.cached_list(
            ResourceKind::Users,
            endpoints::USERS,
            &[("$select", USER_FIELDS), ("$top", constants::MAX_PAGE_SIZE)],
        )
        .await
    }

    pub async fn list_groups(&self) -> Result<Vec<Value>> {
        self.cached_list(
            ResourceKind::Groups,
            endpoints::GROUPS,
            &[("$select", GROUP_FIELDS), ("$top", constants::MAX_PAGE_SIZE)],
        )
        .await
    }

    pub async fn list_subscribed_skus(&self) -> Result<Vec<Value>> {
        self.cached_list(ResourceKind::Licenses, endpoints::SUBSCRIBED_SKUS, &[])
            .await
    }

    /// Users that have a primary SMTP address.
    pub async fn list_mailboxes(&self) -> Result<Vec<Value>> {
        let query = [("$select", MAILBOX_FIELDS), ("$top", constants::MAX_PAGE_SIZE)];
        let key = cache_key(endpoints::USERS, &query);
        if let Some(Value::Array(items)) = self.cache.get(ResourceKind::Mailboxes, &key) {
            return Ok(items);
        }

        let mailboxes: Vec<Value> = self
            .list_all(endpoints::USERS, &query)
            .await?
            .into_iter()
            .filter(|user| user.get("mail").and_then(Value::as_str).is_some_and(|mail| !mail.is_empty()))
            .collect();

        self.cache
            .insert(ResourceKind::Mailboxes, &key, Value::Array(mailboxes.clone()));
        Ok(mailboxes)
    }

    /// Fetch a usage report such as `getOffice365ActiveUserDetail` for a
    /// period of `D7`, `D30`, `D90` or `D180`. Reports come back as CSV text.
    pub async fn usage_report(&self, report: &str, period: &str) -> Result<Value> {
        if !constants::REPORT_PERIODS.contains(&period) {
            return Err(ConfigurationError::new(format!(
                "report period must be one of {}, got '{}'",
                constants::REPORT_PERIODS.join(", "),
                period
            ))
            .into());
        }

        let endpoint = constants::report_endpoint(report, period);
        if let Some(cached) = self.cache.get(ResourceKind::Reports, &endpoint) {
            return Ok(cached);
        }

        let report = self.send(Method::GET, &endpoint, &[], None).await?;
        self.cache.insert(ResourceKind::Reports, &endpoint, report.clone());
        Ok(report)
    }

    async fn cached_list(&self, kind: ResourceKind, endpoint: &str, query: &[(&str, &str)]) -> Result<Vec<Value>> {
        let key = cache_key(endpoint, query);
        if let Some(Value::Array(items)) = self.cache.get(kind, &key) {
            return Ok(items);
        }

        let items = self.list_all(endpoint, query).await?;
        self.cache.insert(kind, &key, Value::Array(items.clone()));
        Ok(items)
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = constants::endpoint_url(&self.base_url, endpoint);
        let correlation_id = Uuid::new_v4().to_string();
        let context = self.logger.start_operation(method.as_str(), endpoint, &correlation_id);
        let budget = AttemptBudget::new(self.resilience.attempt_ceiling());
        let mut metrics = context.create_metrics(false, None, None);

        let result = loop {
            let token = match self.tokens.token().await {
                Ok(token) => token,
                Err(e) => break Err(e),
            };

            let outcome = self
                .retry
                .execute(
                    &budget,
                    |attempt| self.attempt(&context, &method, &url, query, body, &token, attempt),
                    |attempt, failure, delay| {
                        self.logger
                            .log_retry(&context, attempt, &failure.error.to_string(), delay)
                    },
                )
                .await;
            for delay in &outcome.delays {
                metrics.add_retry(*delay);
            }

            match outcome.result {
                Ok((status, value)) => {
                    metrics.status_code = Some(status);
                    break Ok(value);
                }
                Err(failure) if failure.kind == RetryableError::AuthError => {
                    metrics.status_code = Some(401);
                    if metrics.reauthenticated || budget.remaining() == 0 {
                        break Err(AuthenticationError::InvalidCredentials(format!(
                            "access token rejected by {} (401)",
                            endpoint
                        ))
                        .into());
                    }
                    self.logger.log_reauthentication(&context);
                    self.tokens.invalidate();
                    metrics.reauthenticated = true;
                }
                Err(failure) => break Err(failure.error.into()),
            }
        };

        metrics.duration = context.elapsed();
        metrics.success = result.is_ok();
        metrics.error_message = result.as_ref().err().map(|e| e.to_string());
        self.logger.complete_operation(&context, &metrics);

        result
    }

    /// One HTTP exchange, classified for the retry loop.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        context: &OperationContext,
        method: &Method,
        url: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        token: &str,
        attempt: u32,
    ) -> std::result::Result<(u16, Value), AttemptFailure> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token)
            .header("Accept", headers::CONTENT_TYPE_JSON)
            .timeout(self.timeout);
        if !query.is_empty() {
            request = request.query(query);
        }
        if self.resilience.monitoring.correlation_ids {
            request = request.header(headers::CLIENT_REQUEST_ID, &context.correlation_id);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let mut logged_headers = HashMap::from([
            ("Authorization".to_string(), String::new()),
            ("Accept".to_string(), headers::CONTENT_TYPE_JSON.to_string()),
        ]);
        if self.resilience.monitoring.correlation_ids {
            logged_headers.insert(headers::CLIENT_REQUEST_ID.to_string(), context.correlation_id.clone());
        }
        self.logger.log_request(context, method.as_str(), url, &logged_headers);

        let started = Instant::now();
        let response = request.send().await.map_err(|e| self.transport_failure(method, url, e))?;

        let status = response.status().as_u16();
        let response_headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect::<HashMap<_, _>>();
        self.logger.log_response(context, status, &response_headers, started.elapsed());

        if response.status().is_success() {
            let text = response.text().await.map_err(|e| self.transport_failure(method, url, e))?;
            return Ok((status, parse_body(text)));
        }

        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        let message = self.sanitizer.sanitize(&graph_error_message(&text));
        let target = format!("{} {}", method, context.resource);

        let error = match status {
            403 => ApiError::PermissionDenied(format!("{}: {}", target, message)),
            404 => ApiError::NotFound(format!("{}: {}", target, message)),
            408 => ApiError::Timeout(target.clone()),
            429 => ApiError::RateLimited { attempts: attempt },
            _ => ApiError::Unexpected { status, message },
        };
        if status >= 500 {
            warn!("{} returned {}: {}", target, status, error);
        }

        Err(AttemptFailure::new(RetryableError::from_status_code(status), error).with_retry_after(retry_after))
    }

    /// Client-side timeouts surface at once. Other failures after the
    /// request left are only repeated for idempotent methods.
    fn transport_failure(&self, method: &Method, url: &str, error: reqwest::Error) -> AttemptFailure {
        let kind = match RetryableError::from_reqwest_error(&error) {
            RetryableError::Unknown if method.is_idempotent() => RetryableError::Network,
            other => other,
        };
        let error = if error.is_timeout() {
            ApiError::Timeout(format!("{} {} after {:?}", method, url, self.timeout))
        } else {
            ApiError::Network(self.sanitizer.sanitize(&error.to_string()))
        };
        AttemptFailure::new(kind, error)
    }
}

fn owned_query(query: &[(&str, &str)]) -> Vec<(String, String)> {
    query
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn cache_key(endpoint: &str, query: &[(&str, &str)]) -> String {
    if query.is_empty() {
        return endpoint.to_string();
    }
    let query = query
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", endpoint, query)
}

/// JSON if it parses, the raw text otherwise, `null` for an empty body.
fn parse_body(text: String) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => Value::String(text),
    }
}

/// `code: message` from a Graph error envelope, or the start of the body.
fn graph_error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|value| value.get("error"));

    match error {
        Some(error) => {
            let code = error.get("code").and_then(Value::as_str).unwrap_or("unknown");
            let message = error.get("message").and_then(Value::as_str).unwrap_or_default();
            format!("{}: {}", code, message)
        }
        None if body.trim().is_empty() => "empty response body".to_string(),
        None => body.chars().take(200).collect(),
    }
}
