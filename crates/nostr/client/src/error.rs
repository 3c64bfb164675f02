//! Client error types.
//!
//! Callers that fan out across relays match on [`ClientError::code`] rather
//! than variant names, so the code strings are part of the public contract:
//! `pool-unavailable` is fatal, `relay-connect-failed`/`relay-unavailable`
//! feed backoff, `count-unsupported` is sticky per relay, and
//! `count-timeout` is deliberately excluded from circuit-breaker accounting.

use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("websocket backend unavailable: {0}")]
    PoolUnavailable(String),

    #[error("failed to connect to relay {relay}")]
    ConnectFailed { relay: String },

    #[error("relay {relay} is unavailable")]
    RelayUnavailable { relay: String },

    #[error("relay {relay} does not support COUNT frames")]
    CountUnsupported { relay: String },

    #[error("COUNT request timed out after {timeout_ms}ms")]
    CountTimeout { timeout_ms: u64 },

    #[error("at least one filter is required for a COUNT request")]
    EmptyCountFilters,

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Stable string code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::WebSocket(_) => "websocket",
            Self::Connection(_) => "connection",
            Self::InvalidUrl(_) => "invalid-url",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::UrlParse(_) => "url-parse",
            Self::PoolUnavailable(_) => "pool-unavailable",
            Self::ConnectFailed { .. } => "relay-connect-failed",
            Self::RelayUnavailable { .. } => "relay-unavailable",
            Self::CountUnsupported { .. } => "count-unsupported",
            Self::CountTimeout { .. } => "count-timeout",
            Self::EmptyCountFilters => "count-empty-filters",
            Self::Subscription(_) => "subscription",
            Self::Timeout(_) => "timeout",
            Self::NotConnected => "not-connected",
            Self::AlreadyConnected => "already-connected",
            Self::InvalidRequest(_) => "invalid-request",
            Self::Protocol(_) => "protocol",
            Self::Internal(_) => "internal",
        }
    }

    /// True for request timeouts, which never feed the circuit breaker.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CountTimeout { .. } | Self::Timeout(_))
    }

    /// True when the relay lacks COUNT support (sticky per relay).
    pub fn is_count_unsupported(&self) -> bool {
        matches!(self, Self::CountUnsupported { .. })
    }
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_cover_the_failure_taxonomy() {
        let cases = vec![
            (
                ClientError::PoolUnavailable("no backend".to_string()),
                "pool-unavailable",
            ),
            (
                ClientError::ConnectFailed {
                    relay: "wss://relay.example".to_string(),
                },
                "relay-connect-failed",
            ),
            (
                ClientError::RelayUnavailable {
                    relay: "wss://relay.example".to_string(),
                },
                "relay-unavailable",
            ),
            (
                ClientError::CountUnsupported {
                    relay: "wss://relay.example".to_string(),
                },
                "count-unsupported",
            ),
            (ClientError::CountTimeout { timeout_ms: 3400 }, "count-timeout"),
            (ClientError::EmptyCountFilters, "count-empty-filters"),
        ];

        for (error, expected) in cases {
            assert_eq!(error.code(), expected);
        }
    }

    #[test]
    fn timeout_classification_skips_hard_errors() {
        assert!(ClientError::CountTimeout { timeout_ms: 10 }.is_timeout());
        assert!(ClientError::Timeout("probe".to_string()).is_timeout());
        assert!(!ClientError::NotConnected.is_timeout());

        assert!(
            ClientError::CountUnsupported {
                relay: "wss://relay.example".to_string()
            }
            .is_count_unsupported()
        );
        assert!(!ClientError::NotConnected.is_count_unsupported());
    }
}
