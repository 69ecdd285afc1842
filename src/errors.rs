//! Top-level error type of the client.

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::realtime::RealtimeError;

/// Errors returned by [`Client`](crate::Client).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeError),

    /// The service answered the HTTP request with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Failed to encode request: {0}")]
    Encode(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    /// HTTP status of a rejected request, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::PoolError;

    #[test]
    fn test_error_display() {
        let err = ClientError::Http {
            status: 402,
            body: "insufficient balance".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 402: insufficient balance");
        assert_eq!(err.status(), Some(402));

        let err: ClientError = RealtimeError::from(PoolError::Cancelled).into();
        assert!(matches!(err, ClientError::Realtime(RealtimeError::Pool(_))));
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_from_config_error() {
        let err: ClientError = ConfigError::MissingApiKey.into();
        assert!(err.to_string().starts_with("Configuration error"));
    }
}
