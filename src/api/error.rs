//! Error types for the upstream data feed and exchange clients.

use std::time::Duration;

use thiserror::Error;

/// Errors from a rate-limited, retrying API client.
#[derive(Debug, Error, Clone)]
pub enum ApiError {
    /// Transport failure (connect, timeout, reset). Retried.
    #[error("Network error: {0}")]
    Network(String),

    /// Server kept answering 429 after the retry budget was spent.
    #[error("Rate limited ({status}), retry later: {body}")]
    RateLimited {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    /// 401/403. Never retried.
    #[error("Authentication failed ({status}): {body}")]
    Auth { status: u16, body: String },

    /// 400/404/422. Never retried.
    #[error("Client error ({status}): {body}")]
    Client { status: u16, body: String },

    /// 5xx after the retry budget was spent.
    #[error("Server error ({status}): {body}")]
    Server { status: u16, body: String },

    /// Any other non-success status.
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// Response body did not match the expected shape.
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Network(_) | ApiError::RateLimited { .. } | ApiError::Server { .. }
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. })
    }

    /// HTTP status attached to the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::RateLimited { status, .. }
            | ApiError::Auth { status, .. }
            | ApiError::Client { status, .. }
            | ApiError::Server { status, .. }
            | ApiError::Api { status, .. } => Some(*status),
            ApiError::Network(_) | ApiError::Decode(_) => None,
        }
    }

    /// Classify a non-success HTTP status into an error.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => ApiError::RateLimited {
                status,
                body,
                retry_after,
            },
            401 | 403 => ApiError::Auth { status, body },
            400 | 404 | 422 => ApiError::Client { status, body },
            500..=599 => ApiError::Server { status, body },
            _ => ApiError::Api { status, body },
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// A malformed upstream record, rejected when converting into a domain type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {value}")]
    InvalidValue { field: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_statuses() {
        assert!(matches!(
            ApiError::from_status(429, String::new(), None),
            ApiError::RateLimited { .. }
        ));
        assert!(matches!(
            ApiError::from_status(401, String::new(), None),
            ApiError::Auth { .. }
        ));
        assert!(matches!(
            ApiError::from_status(403, String::new(), None),
            ApiError::Auth { .. }
        ));
        for status in [400, 404, 422] {
            assert!(matches!(
                ApiError::from_status(status, String::new(), None),
                ApiError::Client { .. }
            ));
        }
        assert!(matches!(
            ApiError::from_status(503, String::new(), None),
            ApiError::Server { .. }
        ));
        assert!(matches!(
            ApiError::from_status(409, String::new(), None),
            ApiError::Api { .. }
        ));
    }

    #[test]
    fn test_retryability() {
        assert!(ApiError::Network("reset".into()).is_retryable());
        assert!(ApiError::from_status(502, String::new(), None).is_retryable());
        assert!(ApiError::from_status(429, String::new(), None).is_retryable());
        assert!(!ApiError::from_status(401, String::new(), None).is_retryable());
        assert!(!ApiError::from_status(422, String::new(), None).is_retryable());
        assert!(!ApiError::Decode("bad".into()).is_retryable());
    }

    #[test]
    fn test_status_is_carried() {
        let err = ApiError::from_status(500, "boom".into(), None);
        assert_eq!(err.status(), Some(500));
        assert!(err.to_string().contains("boom"));
        assert_eq!(ApiError::Network("x".into()).status(), None);
    }
}
