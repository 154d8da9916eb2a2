//! Failure classification.
//!
//! Every failed attempt is tagged with exactly one [`ErrorCategory`]. The
//! category drives the backoff shape and whether the retry loop keeps going.
//!
//! Rules, in priority order:
//!
//! | Priority | Category | Signals |
//! |----------|----------|---------|
//! | 1 | `Connection` | refused, reset, DNS failure, broken pipe, failed to connect |
//! | 2 | `Timeout` | timed out, deadline exceeded, HTTP 408 |
//! | 3 | `RateLimit` | HTTP 429, "rate limit", "too many requests", overloaded |
//! | 4 | `Auth` | HTTP 401/403, unauthorized, invalid API key |
//! | 5 | `Unknown` | anything else |
//!
//! Classification is total: it never fails and never panics. Foreign errors
//! (for example a `reqwest::Error` wrapped in some other error type) are
//! unwrapped one `source()` level when the outer error says nothing useful.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CommentaryError;

/// Category of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Could not establish or keep a transport connection.
    Connection,
    /// The call exceeded its deadline.
    Timeout,
    /// Explicit rate-limit rejection.
    RateLimit,
    /// Credentials rejected.
    Auth,
    /// Everything else.
    Unknown,
}

impl ErrorCategory {
    /// All categories, in classification priority order.
    pub const ALL: [ErrorCategory; 5] = [
        ErrorCategory::Connection,
        ErrorCategory::Timeout,
        ErrorCategory::RateLimit,
        ErrorCategory::Auth,
        ErrorCategory::Unknown,
    ];

    /// Whether another attempt within the same call can help.
    ///
    /// `Auth` failures are not retried; a bad key stays bad for the whole call.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth)
    }

    /// Connection and timeout failures use the slower backoff baseline.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }

    /// Stable lowercase name, used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Signal tables
// ============================================================================

const CONNECTION_SIGNALS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection aborted",
    "connection closed",
    "connection error",
    "connection failed",
    "connecterror",
    "apiconnectionerror",
    "failed to connect",
    "failed to establish",
    "error trying to connect",
    "broken pipe",
    "dns",
    "name or service not known",
    "no such host",
    "failed to lookup address",
    "network is unreachable",
    "host is unreachable",
];

const TIMEOUT_SIGNALS: &[&str] = &["timed out", "timeout", "deadline exceeded"];

const RATE_LIMIT_SIGNALS: &[&str] = &[
    "rate limit",
    "ratelimit",
    "rate_limit",
    "too many requests",
    "overloaded",
];

const AUTH_SIGNALS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid_api_key",
    "invalid api key",
    "incorrect api key",
    "authentication",
    "permission denied",
];

/// Check whether `text` contains `code` as a standalone number
/// (not as part of a longer digit run such as a port or byte count).
fn contains_status(text: &str, code: &str) -> bool {
    let bytes = text.as_bytes();
    text.match_indices(code).any(|(idx, _)| {
        let before = idx.checked_sub(1).map(|i| bytes[i].is_ascii_digit());
        let after = bytes.get(idx + code.len()).map(|b| b.is_ascii_digit());
        before != Some(true) && after != Some(true)
    })
}

fn contains_any(text: &str, signals: &[&str]) -> bool {
    signals.iter().any(|signal| text.contains(signal))
}

// ============================================================================
// Classification
// ============================================================================

/// Classify a free-form error message.
pub fn classify_message(message: &str) -> ErrorCategory {
    let lowered = message.to_lowercase();

    if contains_any(&lowered, CONNECTION_SIGNALS) {
        ErrorCategory::Connection
    } else if contains_any(&lowered, TIMEOUT_SIGNALS) || contains_status(&lowered, "408") {
        ErrorCategory::Timeout
    } else if contains_any(&lowered, RATE_LIMIT_SIGNALS) || contains_status(&lowered, "429") {
        ErrorCategory::RateLimit
    } else if contains_any(&lowered, AUTH_SIGNALS)
        || contains_status(&lowered, "401")
        || contains_status(&lowered, "403")
    {
        ErrorCategory::Auth
    } else {
        ErrorCategory::Unknown
    }
}

/// Classify a pipeline error.
pub fn classify(error: &CommentaryError) -> ErrorCategory {
    match error {
        // A transport error is a connection failure unless its text says otherwise.
        CommentaryError::NetworkError(msg) => match classify_message(msg) {
            ErrorCategory::Unknown => ErrorCategory::Connection,
            category => category,
        },
        CommentaryError::Timeout => ErrorCategory::Timeout,
        CommentaryError::RateLimited { .. } => ErrorCategory::RateLimit,
        CommentaryError::AuthError(_) => ErrorCategory::Auth,
        CommentaryError::ApiError { status, message } => match status {
            408 | 504 => ErrorCategory::Timeout,
            429 => ErrorCategory::RateLimit,
            401 | 403 => ErrorCategory::Auth,
            _ => classify_message(message),
        },
        other => classify_message(&other.to_string()),
    }
}

fn classify_reqwest(error: &reqwest::Error) -> ErrorCategory {
    classify(&CommentaryError::from_reqwest_ref(error))
}

/// Classify one level of an arbitrary error, without looking at its source.
fn classify_level(error: &(dyn StdError + 'static)) -> ErrorCategory {
    if let Some(err) = error.downcast_ref::<CommentaryError>() {
        classify(err)
    } else if let Some(err) = error.downcast_ref::<reqwest::Error>() {
        classify_reqwest(err)
    } else if let Some(err) = error.downcast_ref::<std::io::Error>() {
        classify_io(err)
    } else {
        classify_message(&error.to_string())
    }
}

fn classify_io(error: &std::io::Error) -> ErrorCategory {
    use std::io::ErrorKind;
    match error.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::AddrNotAvailable => ErrorCategory::Connection,
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::PermissionDenied => ErrorCategory::Auth,
        _ => classify_message(&error.to_string()),
    }
}

/// Classify any error, unwrapping one `source()` level when the outer
/// error is not informative on its own.
pub fn classify_error(error: &(dyn StdError + 'static)) -> ErrorCategory {
    match classify_level(error) {
        ErrorCategory::Unknown => error
            .source()
            .map(classify_level)
            .unwrap_or(ErrorCategory::Unknown),
        category => category,
    }
}

impl CommentaryError {
    /// Category of this error.
    pub fn category(&self) -> ErrorCategory {
        classify(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug)]
    struct Wrapper {
        message: &'static str,
        inner: Option<Box<dyn StdError + 'static>>,
    }

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.message)
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            self.inner.as_deref()
        }
    }

    #[test]
    fn test_connection_messages() {
        for msg in [
            "Connection refused (os error 111)",
            "connection reset by peer",
            "dns error: failed to lookup address information",
            "Broken pipe",
            "APIConnectionError: Connection error.",
            "HTTPSConnectionPool: Failed to establish a new connection",
        ] {
            assert_eq!(classify_message(msg), ErrorCategory::Connection, "{}", msg);
        }
    }

    #[test]
    fn test_connection_has_priority_over_timeout() {
        assert_eq!(
            classify_message("connection refused after connect timeout"),
            ErrorCategory::Connection
        );
    }

    #[test]
    fn test_timeout_messages() {
        assert_eq!(classify_message("operation timed out"), ErrorCategory::Timeout);
        assert_eq!(classify_message("Request Timeout"), ErrorCategory::Timeout);
        assert_eq!(classify_message("HTTP 408"), ErrorCategory::Timeout);
    }

    #[test]
    fn test_rate_limit_and_auth_messages() {
        assert_eq!(classify_message("Error code: 429"), ErrorCategory::RateLimit);
        assert_eq!(
            classify_message("engine_overloaded_error"),
            ErrorCategory::RateLimit
        );
        assert_eq!(classify_message("status 401"), ErrorCategory::Auth);
        assert_eq!(classify_message("Invalid_API_Key provided"), ErrorCategory::Auth);
    }

    #[test]
    fn test_status_codes_inside_numbers_are_ignored() {
        assert_eq!(classify_message("read 14290 bytes"), ErrorCategory::Unknown);
        assert_eq!(classify_message("listening on 4010"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_unknown_fallback() {
        assert_eq!(classify_message(""), ErrorCategory::Unknown);
        assert_eq!(classify_message("model said no"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_typed_variants() {
        assert_eq!(
            classify(&CommentaryError::NetworkError("socket closed".to_string())),
            ErrorCategory::Connection
        );
        assert_eq!(
            classify(&CommentaryError::NetworkError("operation timed out".to_string())),
            ErrorCategory::Timeout
        );
        assert_eq!(classify(&CommentaryError::Timeout), ErrorCategory::Timeout);
        assert_eq!(
            classify(&CommentaryError::RateLimited {
                message: "slow".to_string(),
                retry_after: Some(Duration::from_secs(1)),
            }),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            classify(&CommentaryError::AuthError("nope".to_string())),
            ErrorCategory::Auth
        );
        assert_eq!(
            classify(&CommentaryError::ApiError {
                status: 403,
                message: "denied".to_string()
            }),
            ErrorCategory::Auth
        );
        assert_eq!(
            classify(&CommentaryError::ApiError {
                status: 500,
                message: "internal".to_string()
            }),
            ErrorCategory::Unknown
        );
        assert_eq!(classify(&CommentaryError::EmptyResponse), ErrorCategory::Unknown);
    }

    #[test]
    fn test_classify_is_total_over_all_variants() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let errors = vec![
            CommentaryError::NetworkError(String::new()),
            CommentaryError::Timeout,
            CommentaryError::rate_limited(""),
            CommentaryError::AuthError(String::new()),
            CommentaryError::InvalidRequest(String::new()),
            CommentaryError::ModelNotFound(String::new()),
            CommentaryError::ApiError {
                status: 0,
                message: String::new(),
            },
            CommentaryError::EmptyResponse,
            CommentaryError::SerializationError(json_err),
            CommentaryError::ConfigError(String::new()),
            CommentaryError::NotSupported(String::new()),
            CommentaryError::LocalVision(String::new()),
            CommentaryError::Unknown(String::new()),
        ];
        for error in &errors {
            assert!(ErrorCategory::ALL.contains(&classify(error)));
        }
    }

    #[test]
    fn test_unwraps_one_level() {
        let wrapped = Wrapper {
            message: "request failed",
            inner: Some(Box::new(CommentaryError::Timeout)),
        };
        assert_eq!(classify_error(&wrapped), ErrorCategory::Timeout);

        let io = Wrapper {
            message: "transport error",
            inner: Some(Box::new(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            ))),
        };
        assert_eq!(classify_error(&io), ErrorCategory::Connection);
    }

    #[test]
    fn test_outer_message_wins_over_source() {
        let wrapped = Wrapper {
            message: "429 Too Many Requests",
            inner: Some(Box::new(CommentaryError::Timeout)),
        };
        assert_eq!(classify_error(&wrapped), ErrorCategory::RateLimit);
    }

    #[test]
    fn test_only_one_level_is_unwrapped() {
        let deep = Wrapper {
            message: "outer",
            inner: Some(Box::new(Wrapper {
                message: "middle",
                inner: Some(Box::new(CommentaryError::Timeout)),
            })),
        };
        assert_eq!(classify_error(&deep), ErrorCategory::Unknown);
    }

    #[test]
    fn test_retryability() {
        assert!(!ErrorCategory::Auth.is_retryable());
        assert!(ErrorCategory::Connection.is_retryable());
        assert!(ErrorCategory::RateLimit.is_retryable());
        assert!(ErrorCategory::Timeout.is_transport());
        assert!(!ErrorCategory::Unknown.is_transport());
    }
}
