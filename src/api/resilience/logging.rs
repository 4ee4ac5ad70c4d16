//! Structured logging with correlation tracking for resource API calls
//!
//! Every event is a JSON object carrying the correlation id, the operation
//! and the resource path, so a single request can be followed through its
//! retries and re-authentication.

use super::config::{LogLevel, MonitoringConfig};
use log::{debug, error, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Structured logger for API operations with correlation tracking
#[derive(Debug, Clone)]
pub struct ApiLogger {
    config: MonitoringConfig,
}

/// Context for a single API operation
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub correlation_id: String,
    /// HTTP method or logical operation name
    pub operation_type: String,
    /// Resource path being operated on
    pub resource: String,
    pub start_time: Instant,
}

/// Performance metrics for an API operation
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    pub duration: Duration,
    pub retry_attempts: u32,
    pub reauthenticated: bool,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub retry_delays: Vec<Duration>,
}

impl ApiLogger {
    pub fn new(config: MonitoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Start tracking a new operation
    pub fn start_operation(&self, operation_type: &str, resource: &str, correlation_id: &str) -> OperationContext {
        let context = OperationContext {
            correlation_id: correlation_id.to_string(),
            operation_type: operation_type.to_string(),
            resource: resource.to_string(),
            start_time: Instant::now(),
        };

        if self.config.request_logging && self.should_log(LogLevel::Info) {
            let log_data = json!({
                "event": "operation_started",
                "correlation_id": context.correlation_id,
                "operation_type": context.operation_type,
                "resource": context.resource,
                "timestamp": chrono::Utc::now().to_rfc3339()
            });

            info!("API Operation Started: {}", log_data);
        }

        context
    }

    pub fn log_request(&self, context: &OperationContext, method: &str, url: &str, headers: &HashMap<String, String>) {
        if !self.config.request_logging || !self.should_log(LogLevel::Debug) {
            return;
        }

        let log_data = json!({
            "event": "http_request",
            "correlation_id": context.correlation_id,
            "operation_type": context.operation_type,
            "resource": context.resource,
            "method": method,
            "url": url,
            "headers": sanitize_headers(headers),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        debug!("HTTP Request: {}", log_data);
    }

    pub fn log_response(
        &self,
        context: &OperationContext,
        status_code: u16,
        headers: &HashMap<String, String>,
        duration: Duration,
    ) {
        if !self.config.request_logging || !self.should_log(LogLevel::Debug) {
            return;
        }

        let log_data = json!({
            "event": "http_response",
            "correlation_id": context.correlation_id,
            "operation_type": context.operation_type,
            "resource": context.resource,
            "status_code": status_code,
            "duration_ms": duration.as_millis(),
            "headers": sanitize_headers(headers),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        if status_code >= 400 {
            warn!("HTTP Response (Error): {}", log_data);
        } else {
            debug!("HTTP Response: {}", log_data);
        }
    }

    pub fn log_retry(&self, context: &OperationContext, attempt: u32, error: &str, delay: Duration) {
        if !self.should_log(LogLevel::Warn) {
            return;
        }

        let log_data = json!({
            "event": "retry_attempt",
            "correlation_id": context.correlation_id,
            "operation_type": context.operation_type,
            "resource": context.resource,
            "attempt": attempt,
            "error": error,
            "delay_ms": delay.as_millis(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        warn!("Retry Attempt: {}", log_data);
    }

    /// The held token was rejected with 401 and is being replaced.
    pub fn log_reauthentication(&self, context: &OperationContext) {
        if !self.should_log(LogLevel::Warn) {
            return;
        }

        let log_data = json!({
            "event": "reauthentication",
            "correlation_id": context.correlation_id,
            "operation_type": context.operation_type,
            "resource": context.resource,
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        warn!("Token Rejected, Re-authenticating: {}", log_data);
    }

    /// Complete an operation and log metrics
    pub fn complete_operation(&self, context: &OperationContext, metrics: &OperationMetrics) {
        if !self.config.performance_metrics {
            return;
        }

        let log_data = json!({
            "event": "operation_completed",
            "correlation_id": context.correlation_id,
            "operation_type": context.operation_type,
            "resource": context.resource,
            "duration_ms": metrics.duration.as_millis(),
            "retry_attempts": metrics.retry_attempts,
            "reauthenticated": metrics.reauthenticated,
            "success": metrics.success,
            "status_code": metrics.status_code,
            "error_message": metrics.error_message,
            "retry_delays_ms": metrics.retry_delays.iter().map(|d| d.as_millis()).collect::<Vec<_>>(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        if metrics.success {
            if self.should_log(LogLevel::Info) {
                info!("API Operation Completed: {}", log_data);
            }
        } else if self.should_log(LogLevel::Error) {
            error!("API Operation Failed: {}", log_data);
        }
    }

    fn should_log(&self, level: LogLevel) -> bool {
        match (self.config.log_level, level) {
            (LogLevel::Error, LogLevel::Error) => true,
            (LogLevel::Warn, LogLevel::Error | LogLevel::Warn) => true,
            (LogLevel::Info, LogLevel::Error | LogLevel::Warn | LogLevel::Info) => true,
            (LogLevel::Debug, LogLevel::Error | LogLevel::Warn | LogLevel::Info | LogLevel::Debug) => true,
            (LogLevel::Trace, _) => true,
            _ => false,
        }
    }
}

/// Replace credential-bearing header values with `[REDACTED]`.
pub fn sanitize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(key, value)| {
            let key_lower = key.to_lowercase();
            let sensitive = ["authorization", "token", "key", "secret", "password", "cookie"]
                .iter()
                .any(|marker| key_lower.contains(marker));
            let value = if sensitive { "[REDACTED]".to_string() } else { value.clone() };
            (key.clone(), value)
        })
        .collect()
}

impl OperationContext {
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn create_metrics(&self, success: bool, status_code: Option<u16>, error_message: Option<String>) -> OperationMetrics {
        OperationMetrics {
            duration: self.elapsed(),
            retry_attempts: 0,
            reauthenticated: false,
            success,
            status_code,
            error_message,
            retry_delays: Vec::new(),
        }
    }
}

impl OperationMetrics {
    pub fn add_retry(&mut self, delay: Duration) {
        self.retry_attempts += 1;
        self.retry_delays.push(delay);
    }

    pub fn total_retry_delay(&self) -> Duration {
        self.retry_delays.iter().sum()
    }

    pub fn is_slow(&self, threshold: Duration) -> bool {
        self.duration > threshold
    }
}
