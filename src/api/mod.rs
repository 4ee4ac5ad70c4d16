//! Resource API access
//!
//! [`ApiClient`] wraps Microsoft Graph calls with token handling, transport
//! retries, pagination and a per-kind response cache.

pub mod cache;
pub mod client;
pub mod constants;
pub mod resilience;

pub use cache::{CacheEntry, ResourceKind, ResponseCache};
pub use client::{ApiClient, build_http_client};
pub use resilience::{ApiLogger, LogLevel, MonitoringConfig, ResilienceConfig, RetryConfig, RetryPolicy};
