mod common;

use common::*;
use m365_admin::api::ApiClient;
use m365_admin::api::resilience::ResilienceConfig;
use m365_admin::auth::{AuthParams, AuthenticationMethod, BoundCredentials, TokenCache};
use m365_admin::error::{ApiError, AuthenticationError, Error};
use m365_admin::sanitize::Sanitizer;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_resilience(max_retries: u32) -> ResilienceConfig {
    ResilienceConfig::builder()
        .max_retries(max_retries)
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(10))
        .jitter(false)
        .build()
}

fn client(server: &MockServer, tokens: Arc<RotatingTokens>, max_retries: u32) -> ApiClient {
    ApiClient::new(tokens, reqwest::Client::new(), Arc::new(Sanitizer::new()))
        .with_base_url(server.uri())
        .with_resilience(fast_resilience(max_retries))
}

fn users(range: std::ops::Range<usize>) -> Vec<Value> {
    range
        .map(|i| json!({"id": format!("user-{}", i), "mail": format!("user{}@contoso.com", i)}))
        .collect()
}

#[tokio::test]
async fn test_list_users_follows_next_links_in_order() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/users"))
        .and(query_param("$skiptoken", "page3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": users(20..25)})))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .and(query_param("$skiptoken", "page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": users(10..20),
            "@odata.nextLink": format!("{}/users?$skiptoken=page3", base)
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .and(query_param("$top", "999"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": users(0..10),
            "@odata.nextLink": format!("{}/users?$skiptoken=page2", base)
        })))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, Arc::new(RotatingTokens::default()), 2);
    let items = api.list_users().await.unwrap();

    assert_eq!(items.len(), 25);
    let ids: Vec<&str> = items.iter().filter_map(|u| u["id"].as_str()).collect();
    let expected: Vec<String> = (0..25).map(|i| format!("user-{}", i)).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_list_users_is_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": users(0..3)})))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, Arc::new(RotatingTokens::default()), 2);
    let first = api.list_users().await.unwrap();
    let second = api.list_users().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(api.cache().len(), 1);
}

#[tokio::test]
async fn test_invalidate_forces_a_fresh_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/groups"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [{"id": "g1"}]})))
        .expect(2)
        .mount(&server)
        .await;

    let api = client(&server, Arc::new(RotatingTokens::default()), 2);
    api.list_groups().await.unwrap();
    api.invalidate(m365_admin::api::ResourceKind::Groups);
    api.list_groups().await.unwrap();
}

#[tokio::test]
async fn test_mailboxes_skip_users_without_mail() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [
            {"id": "a", "mail": "a@contoso.com"},
            {"id": "b", "mail": null},
            {"id": "c", "mail": ""},
            {"id": "d", "mail": "d@contoso.com"}
        ]})))
        .mount(&server)
        .await;

    let api = client(&server, Arc::new(RotatingTokens::default()), 2);
    let mailboxes = api.list_mailboxes().await.unwrap();
    let ids: Vec<&str> = mailboxes.iter().filter_map(|m| m["id"].as_str()).collect();
    assert_eq!(ids, vec!["a", "d"]);
}

#[tokio::test]
async fn test_rejected_token_is_replaced_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/organization"))
        .and(header("Authorization", "Bearer token-1"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"code": "InvalidAuthenticationToken", "message": "Access token has expired."}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/organization"))
        .and(header("Authorization", "Bearer token-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [{"id": "org"}]})))
        .expect(1)
        .mount(&server)
        .await;

    let tokens = Arc::new(RotatingTokens::default());
    let api = client(&server, tokens.clone(), 2);
    let body = api.get("organization").await.unwrap();

    assert_eq!(body["value"][0]["id"], "org");
    assert_eq!(tokens.invalidations(), 1);
}

#[tokio::test]
async fn test_second_rejection_is_an_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/organization"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let tokens = Arc::new(RotatingTokens::default());
    let api = client(&server, tokens.clone(), 2);
    let err = api.get("organization").await.unwrap_err();

    assert!(matches!(
        err,
        Error::Authentication(AuthenticationError::InvalidCredentials(_))
    ));
    assert_eq!(tokens.invalidations(), 1);
}

#[tokio::test]
async fn test_throttling_exhausts_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/subscribedSkus"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .expect(3)
        .mount(&server)
        .await;

    let api = client(&server, Arc::new(RotatingTokens::default()), 2);
    let err = api.list_subscribed_skus().await.unwrap_err();

    assert!(matches!(err, Error::Api(ApiError::RateLimited { attempts: 3 })));
}

#[tokio::test]
async fn test_throttled_request_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/subscribedSkus"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/subscribedSkus"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [{"skuPartNumber": "ENTERPRISEPACK"}]})))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, Arc::new(RotatingTokens::default()), 3);
    let skus = api.list_subscribed_skus().await.unwrap();
    assert_eq!(skus[0]["skuPartNumber"], "ENTERPRISEPACK");
}

#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/groups"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .expect(2)
        .mount(&server)
        .await;

    let api = client(&server, Arc::new(RotatingTokens::default()), 1);
    let err = api.list_groups().await.unwrap_err();

    assert!(matches!(err, Error::Api(ApiError::Unexpected { status: 503, .. })));
}

#[tokio::test]
async fn test_timed_out_create_is_not_sent_again() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/users"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"id": "user-1"}))
                .set_delay(Duration::from_millis(500)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, Arc::new(RotatingTokens::default()), 3).with_timeout(Duration::from_millis(100));
    let err = api
        .post("users", &json!({"displayName": "Adele Vance"}))
        .await
        .unwrap_err();

    match err {
        Error::Api(ApiError::Timeout(message)) => {
            assert!(message.starts_with("POST "));
            assert!(message.ends_with("after 100ms"));
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timed_out_read_surfaces_without_retrying() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/subscribedSkus"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"value": []}))
                .set_delay(Duration::from_millis(500)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, Arc::new(RotatingTokens::default()), 3).with_timeout(Duration::from_millis(100));
    let err = api.list_subscribed_skus().await.unwrap_err();

    assert!(matches!(err, Error::Api(ApiError::Timeout(_))));
}

#[tokio::test]
async fn test_server_request_timeout_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/subscribedSkus"))
        .respond_with(ResponseTemplate::new(408))
        .expect(2)
        .mount(&server)
        .await;

    let api = client(&server, Arc::new(RotatingTokens::default()), 1);
    let err = api.list_subscribed_skus().await.unwrap_err();

    assert!(matches!(err, Error::Api(ApiError::Timeout(_))));
}

#[tokio::test]
async fn test_next_link_to_another_host_is_refused() {
    let server = MockServer::start().await;
    let elsewhere = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/groups"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"id": "group-1"}],
            "@odata.nextLink": format!("{}/groups?$skiptoken=page2", elsewhere.uri())
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .expect(0)
        .mount(&elsewhere)
        .await;

    let api = client(&server, Arc::new(RotatingTokens::default()), 2);
    let err = api.list_groups().await.unwrap_err();

    assert!(matches!(err, Error::Api(ApiError::Unexpected { status: 200, .. })));
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"code": "Request_ResourceNotFound", "message": "Resource 'missing' does not exist."}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/auditLogs/signIns"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"code": "Authorization_RequestDenied", "message": "Insufficient privileges to complete the operation."}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/groups"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"code": "Request_BadRequest", "message": "Invalid value specified for property 'mailNickname'."}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, Arc::new(RotatingTokens::default()), 3);

    match api.get("users/missing").await.unwrap_err() {
        Error::Api(ApiError::NotFound(message)) => assert!(message.contains("Request_ResourceNotFound")),
        other => panic!("unexpected error: {:?}", other),
    }
    match api.get("auditLogs/signIns").await.unwrap_err() {
        Error::Api(ApiError::PermissionDenied(message)) => {
            assert!(message.starts_with("GET auditLogs/signIns"));
            assert!(message.contains("Insufficient privileges"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    let err = api.post("groups", &json!({"displayName": "Sales"})).await.unwrap_err();
    assert!(matches!(err, Error::Api(ApiError::Unexpected { status: 400, .. })));
}

#[tokio::test]
async fn test_report_and_empty_bodies() {
    let server = MockServer::start().await;
    let csv = "Report Refresh Date,User Principal Name\n2026-10-18,adele@contoso.com\n";
    Mock::given(method("GET"))
        .and(path_regex("getOffice365ActiveUserDetail"))
        .respond_with(ResponseTemplate::new(200).set_body_string(csv))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/groups/g1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, Arc::new(RotatingTokens::default()), 2);

    let report = api.usage_report("getOffice365ActiveUserDetail", "D7").await.unwrap();
    assert_eq!(report, Value::String(csv.to_string()));
    // second read comes from the report cache
    api.usage_report("getOffice365ActiveUserDetail", "D7").await.unwrap();

    assert_eq!(api.delete("groups/g1").await.unwrap(), Value::Null);

    let err = api.usage_report("getOffice365ActiveUserDetail", "D14").await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn test_bound_credentials_reacquire_after_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("first-token")))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("second-token")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .and(header("Authorization", "Bearer first-token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .and(header("Authorization", "Bearer second-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": users(0..2)})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let cache = TokenCache::new(dir.path().join("tokens.json"));
    let authenticator = Arc::new(graph_authenticator(&server.uri(), cache.clone()));
    let params = AuthParams::new(TENANT, CLIENT_ID).with_client_secret("s3cret-value");
    let credentials = BoundCredentials::new(authenticator.clone(), AuthenticationMethod::ClientSecret, params);

    let api = ApiClient::new(Arc::new(credentials), reqwest::Client::new(), Arc::new(Sanitizer::new()))
        .with_base_url(server.uri())
        .with_resilience(fast_resilience(2));

    let items = api.list_users().await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(authenticator.get_current_token().as_deref(), Some("second-token"));
    assert_eq!(cache.keys().len(), 1);
}
