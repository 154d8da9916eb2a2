//! Error types for the commentary pipeline.
//!
//! # Error Handling Philosophy
//!
//! Errors never reach the end user. They exist so that the retry layer can
//! decide what to do next:
//! 1. **Classifiable**: every error maps to one [`ErrorCategory`](crate::classifier::ErrorCategory)
//! 2. **Specific**: carry the HTTP status, retry-after hint or endpoint message
//! 3. **Absorbed**: the orchestrator turns every failure into a degraded comment
//!
//! # Common Errors
//!
//! | Error | Cause | Handling |
//! |-------|-------|----------|
//! | `NetworkError` | Connection refused/reset, DNS failure | Slow backoff, counts toward gate |
//! | `Timeout` | Attempt exceeded its deadline | Slow backoff, counts toward gate |
//! | `RateLimited` | HTTP 429 / overloaded | Honour `retry_after`, else default backoff |
//! | `AuthError` | HTTP 401/403, bad API key | No retry within the call, counts toward gate |
//! | `InvalidRequest` | HTTP 400, unsupported input | No retry within the call |
//! | `EmptyResponse` | Model answered with no text | Default backoff |

use std::time::Duration;
use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, CommentaryError>;

const PERMANENT_SIGNALS: [&str; 3] = ["invalid_request_error", "invalid request", "unsupported"];

fn has_permanent_signal(message: &str) -> bool {
    let lowered = message.to_lowercase();
    PERMANENT_SIGNALS.iter().any(|s| lowered.contains(s))
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while talking to a vision or text endpoint.
#[derive(Debug, Error)]
pub enum CommentaryError {
    /// Transport failure: the connection could not be established or was lost.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The attempt exceeded its deadline.
    #[error("Request timed out")]
    Timeout,

    /// Rate limit exceeded.
    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        /// Server-provided `Retry-After` hint, if any.
        retry_after: Option<Duration>,
    },

    /// Credentials rejected.
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// The request itself was rejected (bad parameters, unsupported input).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Model not found on the endpoint.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Non-success HTTP status not covered by a more specific variant.
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    /// The endpoint answered but produced no usable text.
    #[error("Empty response from model")]
    EmptyResponse,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Feature not supported by this endpoint.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Local detector failure.
    #[error("Local vision error: {0}")]
    LocalVision(String),

    /// Unknown error.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<reqwest::Error> for CommentaryError {
    fn from(err: reqwest::Error) -> Self {
        Self::from_reqwest_ref(&err)
    }
}

impl From<crate::config::ConfigError> for CommentaryError {
    fn from(err: crate::config::ConfigError) -> Self {
        CommentaryError::ConfigError(err.to_string())
    }
}

impl CommentaryError {
    /// Map a transport error without taking ownership of it.
    pub(crate) fn from_reqwest_ref(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::NetworkError(format!("Connection failed: {}", err))
        } else if let Some(status) = err.status() {
            Self::ApiError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::NetworkError(err.to_string())
        }
    }

    /// Create a rate-limit error without a retry-after hint.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Server-provided retry-after hint, if this error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status code attached to this error, if known.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Errors that prove the request itself is wrong; retrying the same
    /// request cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::AuthError(_)
            | Self::InvalidRequest(_)
            | Self::ModelNotFound(_)
            | Self::NotSupported(_)
            | Self::ConfigError(_) => true,
            Self::ApiError { status, message } => {
                matches!(status, 400 | 401 | 403 | 404) || has_permanent_signal(message)
            }
            Self::Unknown(message) => has_permanent_signal(message),
            _ => false,
        }
    }

    /// Short, log-friendly description with a suggested action.
    pub fn user_description(&self) -> String {
        match self {
            Self::NetworkError(_) => {
                "Unable to reach the endpoint. Check the network connection.".to_string()
            }
            Self::Timeout => "Request timed out. The server may be overloaded.".to_string(),
            Self::RateLimited { retry_after, .. } => match retry_after {
                Some(wait) => format!("Rate limited, retry after {}s.", wait.as_secs()),
                None => "Rate limited by the API.".to_string(),
            },
            Self::AuthError(_) => "Authentication failed. Check the configured api_key.".to_string(),
            Self::ModelNotFound(model) => format!("Model '{}' not found on this endpoint.", model),
            Self::InvalidRequest(msg) => format!("Invalid request: {}.", msg),
            Self::ApiError { status, .. } => format!("API server error (HTTP {}).", status),
            Self::EmptyResponse => "The model returned no text.".to_string(),
            Self::SerializationError(_) => "Failed to parse the API response.".to_string(),
            Self::ConfigError(msg) => format!("Configuration error: {}.", msg),
            Self::NotSupported(feature) => format!("'{}' is not supported here.", feature),
            Self::LocalVision(msg) => format!("Local vision unavailable: {}.", msg),
            Self::Unknown(msg) => format!("An unexpected error occurred: {}", msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CommentaryError::NetworkError("connection refused".to_string());
        assert_eq!(error.to_string(), "Network error: connection refused");

        let error = CommentaryError::rate_limited("too many requests");
        assert_eq!(error.to_string(), "Rate limit exceeded: too many requests");

        let error = CommentaryError::ApiError {
            status: 503,
            message: "overloaded".to_string(),
        };
        assert_eq!(error.to_string(), "API error 503: overloaded");

        assert_eq!(CommentaryError::Timeout.to_string(), "Request timed out");
    }

    #[test]
    fn test_retry_after_only_on_rate_limit() {
        let error = CommentaryError::RateLimited {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(error.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(error.status_code(), Some(429));
        assert_eq!(CommentaryError::Timeout.retry_after(), None);
    }

    #[test]
    fn test_permanent_errors() {
        assert!(CommentaryError::AuthError("bad key".to_string()).is_permanent());
        assert!(CommentaryError::InvalidRequest("bad".to_string()).is_permanent());
        assert!(CommentaryError::ApiError {
            status: 404,
            message: "gone".to_string()
        }
        .is_permanent());
        assert!(!CommentaryError::ApiError {
            status: 502,
            message: "bad gateway".to_string()
        }
        .is_permanent());
        assert!(CommentaryError::ApiError {
            status: 500,
            message: "invalid_request_error: image_url unsupported".to_string()
        }
        .is_permanent());
        assert!(CommentaryError::Unknown("Unsupported input type".to_string()).is_permanent());
        assert!(!CommentaryError::Unknown("something broke".to_string()).is_permanent());
        assert!(!CommentaryError::Timeout.is_permanent());
        assert!(!CommentaryError::EmptyResponse.is_permanent());
    }

    #[test]
    fn test_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let error: CommentaryError = json_err.into();
        assert!(matches!(error, CommentaryError::SerializationError(_)));
    }

    #[test]
    fn test_user_description_rate_limit_hint() {
        let error = CommentaryError::RateLimited {
            message: "429".to_string(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(error.user_description().contains("3s"));
    }

    #[test]
    fn test_user_description_auth() {
        let error = CommentaryError::AuthError("invalid".to_string());
        assert!(error.user_description().contains("api_key"));
    }
}
