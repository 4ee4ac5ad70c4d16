//! Resilience features for resource API calls
//!
//! Retry with backoff, the shared attempt budget and structured request
//! logging.

pub mod config;
pub mod logging;
pub mod retry;

pub use config::{LogLevel, MonitoringConfig, ResilienceConfig, ResilienceConfigBuilder};
pub use logging::{ApiLogger, OperationContext, OperationMetrics};
pub use retry::{AttemptBudget, AttemptFailure, RetryConfig, RetryOutcome, RetryPolicy, RetryableError};
