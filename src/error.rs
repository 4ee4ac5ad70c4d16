//! Error taxonomy for the authentication and API access layer.
//!
//! Every public operation returns [`Result`], whose error side is one of the
//! typed families below. Token and response cache failures are the one
//! exception: they surface as [`CacheError`] internally, get logged, and are
//! treated as a cache miss.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for the crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl Error {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Api(api) => api.is_transient(),
            Error::Authentication(AuthenticationError::NetworkFailure(_)) => true,
            _ => false,
        }
    }
}

/// Required identity parameters are missing or inconsistent.
///
/// Always raised before any network call is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Configuration error: {0}")]
pub struct ConfigurationError(pub String);

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failures while loading or checking a client certificate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertificateError {
    #[error("Certificate not found: {0}")]
    NotFound(String),

    #[error("Certificate password is incorrect")]
    InvalidPassword,

    #[error("Malformed certificate: {0}")]
    Malformed(String),

    #[error("Certificate expired on {}", .0.format("%Y-%m-%d %H:%M:%S UTC"))]
    Expired(DateTime<Utc>),

    #[error("Certificate store lookups are not supported on this platform")]
    UnsupportedPlatform,

    #[error("Certificate chain is invalid: {0}")]
    ChainInvalid(String),
}

/// Failures while talking to the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthenticationError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Network failure during authentication: {0}")]
    NetworkFailure(String),

    #[error("Invalid response from identity provider: {0}")]
    InvalidResponse(String),

    #[error("No token available, authenticate first")]
    NotAuthenticated,
}

/// Failures reported by the resource API once transport retries are spent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected API response ({status}): {message}")]
    Unexpected { status: u16, message: String },
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::RateLimited { .. } | ApiError::Timeout(_) | ApiError::Network(_) => true,
            ApiError::Unexpected { status, .. } => *status >= 500,
            ApiError::PermissionDenied(_) | ApiError::NotFound(_) => false,
        }
    }
}

/// Best-effort cache failures. Never returned from a public operation.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Token cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Token cache contents are unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Token cache location unavailable: {0}")]
    Location(String),
}

/// Failures while establishing or using a dependent service session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Required session tooling is unavailable: {0}")]
    ToolingUnavailable(String),

    #[error("Failed to connect session: {0}")]
    ConnectFailed(String),

    #[error("Session verification failed: {0}")]
    VerificationFailed(String),

    #[error("Session bridge failure: {0}")]
    Bridge(String),

    #[error("Session has already been disconnected")]
    Disconnected,
}

/// Outcome of a resource API call, tagged by kind so callers can branch
/// without inspecting error strings.
#[derive(Debug)]
pub enum ApiOutcome<T> {
    Success(T),
    PermissionDenied(String),
    NotFound(String),
    TransientFailure(Error),
}

impl<T> ApiOutcome<T> {
    /// Classify the result of an API call.
    ///
    /// Configuration, certificate, authentication and non-transient API
    /// failures are not outcomes a caller can degrade around, so they stay
    /// on the `Err` side.
    pub fn from_result(result: Result<T>) -> Result<Self> {
        match result {
            Ok(value) => Ok(ApiOutcome::Success(value)),
            Err(Error::Api(ApiError::PermissionDenied(message))) => {
                Ok(ApiOutcome::PermissionDenied(message))
            }
            Err(Error::Api(ApiError::NotFound(message))) => Ok(ApiOutcome::NotFound(message)),
            Err(error) if error.is_transient() => Ok(ApiOutcome::TransientFailure(error)),
            Err(error) => Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ApiOutcome::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            ApiOutcome::Success(value) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        let ok: Result<u32> = Ok(7);
        assert_eq!(ApiOutcome::from_result(ok).unwrap().success(), Some(7));

        let denied: Result<u32> = Err(ApiError::PermissionDenied("users".into()).into());
        assert!(matches!(
            ApiOutcome::from_result(denied).unwrap(),
            ApiOutcome::PermissionDenied(_)
        ));

        let missing: Result<u32> = Err(ApiError::NotFound("users/x".into()).into());
        assert!(matches!(ApiOutcome::from_result(missing).unwrap(), ApiOutcome::NotFound(_)));

        let throttled: Result<u32> = Err(ApiError::RateLimited { attempts: 4 }.into());
        assert!(matches!(
            ApiOutcome::from_result(throttled).unwrap(),
            ApiOutcome::TransientFailure(_)
        ));
    }

    #[test]
    fn test_non_api_errors_are_not_outcomes() {
        let config: Result<u32> = Err(ConfigurationError::new("tenant id missing").into());
        assert!(matches!(ApiOutcome::from_result(config), Err(Error::Configuration(_))));

        let auth: Result<u32> =
            Err(AuthenticationError::InvalidCredentials("invalid_client".into()).into());
        assert!(ApiOutcome::from_result(auth).is_err());

        let bad_request: Result<u32> = Err(ApiError::Unexpected {
            status: 400,
            message: "bad filter".into(),
        }
        .into());
        assert!(ApiOutcome::from_result(bad_request).is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::Timeout("GET users".into()).is_transient());
        assert!(ApiError::Unexpected { status: 503, message: String::new() }.is_transient());
        assert!(!ApiError::Unexpected { status: 400, message: String::new() }.is_transient());
        assert!(!ApiError::PermissionDenied(String::new()).is_transient());
    }
}
