use std::time::Duration;

use crate::provider::Capability;

/// Outcome classification of a single provider attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("capability not supported: {0:?}")]
    Unsupported(Capability),
}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "too many requests",
    "quota exceeded",
    "resource exhausted",
];
const SERVER_PATTERNS: &[&str] = &[
    "service unavailable",
    "internal error",
    "server error",
    "temporary failure",
];
const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "invalid api key",
    "permission denied",
    "forbidden",
];

impl ProviderError {
    /// Transient failures are retried; everything else is surfaced at once.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout(_)
                | ProviderError::Server(_)
                | ProviderError::Network(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    /// Classify a free-text provider error message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
            ProviderError::RateLimited {
                retry_after_ms: None,
            }
        } else if lower.contains("timeout") || lower.contains("timed out") {
            ProviderError::Timeout(message)
        } else if lower.contains("connection reset") || lower.contains("connection refused") {
            ProviderError::Network(message)
        } else if SERVER_PATTERNS.iter().any(|p| lower.contains(p)) {
            ProviderError::Server(message)
        } else if AUTH_PATTERNS.iter().any(|p| lower.contains(p)) {
            ProviderError::Authentication(message)
        } else {
            ProviderError::InvalidRequest(message)
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, retry_after_ms: Option<u64>, body: String) -> Self {
        match status {
            401 | 403 => ProviderError::Authentication(format!("{}: {}", status, body)),
            408 | 504 => ProviderError::Timeout(format!("{}: {}", status, body)),
            429 => ProviderError::RateLimited { retry_after_ms },
            400..=499 => ProviderError::InvalidRequest(format!("{}: {}", status, body)),
            _ => ProviderError::Server(format!("{}: {}", status, body)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{provider}: {source}")]
    Fatal {
        provider: String,
        #[source]
        source: ProviderError,
    },

    #[error("{provider}: request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        provider: String,
        attempts: usize,
        #[source]
        last: ProviderError,
    },

    #[error("provider unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    #[error("primary failed ({primary}); fallback failed ({fallback})")]
    FallbackFailed {
        primary: Box<GatewayError>,
        fallback: Box<GatewayError>,
    },

    #[error("schema validation failed for {schema}: {reason}")]
    SchemaValidation { schema: String, reason: String },

    #[error("call cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            GatewayError::Cancelled => true,
            GatewayError::FallbackFailed { primary, fallback } => {
                primary.is_cancelled() || fallback.is_cancelled()
            }
            _ => false,
        }
    }

    /// Unavailability and retry exhaustion hand over to the fallback provider.
    pub(crate) fn allows_fallback(&self) -> bool {
        matches!(
            self,
            GatewayError::ProviderUnavailable { .. } | GatewayError::RetriesExhausted { .. }
        )
    }
}
