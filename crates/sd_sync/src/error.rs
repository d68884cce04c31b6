use sd_core::error::AppError;
use thiserror::Error;

/// Failure reported by a provider adapter.
///
/// `Validation` is scoped to a single record and never aborts a run; every other
/// variant does.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Invalid record: {0}")]
    Validation(String),
    #[error("Provider API error: HTTP {status}")]
    Api { status: u16, body: String },
    #[error("Failed to decode provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "PROVIDER_AUTH",
            Self::Network(_) => "PROVIDER_NETWORK",
            Self::Timeout(_) => "PROVIDER_TIMEOUT",
            Self::Validation(_) => "PROVIDER_VALIDATION",
            Self::Api { .. } => "PROVIDER_API",
            Self::Decode(_) => "PROVIDER_DECODE",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Auth(_) | Self::Validation(_) | Self::Decode(_) => false,
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(e: ProviderError) -> Self {
        let details = match &e {
            ProviderError::Api { body, .. } if !body.is_empty() => Some(body.clone()),
            _ => None,
        };
        let err = AppError::new(e.code(), e.to_string()).with_retryable(e.is_retryable());
        match details {
            Some(d) => err.with_details(d),
            None => err,
        }
    }
}
