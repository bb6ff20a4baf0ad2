//! Gateway error taxonomy
//!
//! Every error carries a stable kind name used for the `errors.total` counter
//! tag and for transport mapping.

use thiserror::Error;

use crate::data::store::StoreError;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// No principal on the request
    #[error("authentication required")]
    Unauthorized,

    /// Access control denied the topic
    #[error("access denied for topic '{topic}'")]
    AccessDenied { topic: String },

    /// A rate limiter denied admission; `reset_at` is a Unix timestamp in
    /// seconds after which the caller may retry
    #[error("rate limited, retry after {reset_at}")]
    RateLimited { reset_at: u64 },

    /// Structural validation failed
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    /// Serialized payload over the configured cap
    #[error("payload exceeds {max_bytes} bytes")]
    PayloadTooLarge { max_bytes: usize },

    /// Store link down or deadline exceeded; retryable
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Unexpected defect; detail is withheld from production callers
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable kind name for counter tagging and transport mapping
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "Unauthorized",
            GatewayError::AccessDenied { .. } => "AccessDenied",
            GatewayError::RateLimited { .. } => "RateLimited",
            GatewayError::InvalidInput { .. } => "InvalidInput",
            GatewayError::PayloadTooLarge { .. } => "PayloadTooLarge",
            GatewayError::StoreUnavailable(_) => "StoreUnavailable",
            GatewayError::Internal(_) => "Internal",
        }
    }

    /// Whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::StoreUnavailable(_))
    }

    /// Message safe to surface to callers in production
    pub fn public_message(&self, production: bool) -> String {
        match self {
            GatewayError::Internal(_) if production => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        if err.is_unavailable() {
            GatewayError::StoreUnavailable(err.to_string())
        } else {
            GatewayError::Internal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(GatewayError::Unauthorized.kind(), "Unauthorized");
        assert_eq!(
            GatewayError::RateLimited { reset_at: 0 }.kind(),
            "RateLimited"
        );
        assert_eq!(
            GatewayError::StoreUnavailable("x".into()).kind(),
            "StoreUnavailable"
        );
    }

    #[test]
    fn test_only_store_unavailable_is_retryable() {
        assert!(GatewayError::StoreUnavailable("down".into()).is_retryable());
        assert!(!GatewayError::Unauthorized.is_retryable());
        assert!(!GatewayError::RateLimited { reset_at: 1 }.is_retryable());
    }

    #[test]
    fn test_internal_detail_hidden_in_production() {
        let err = GatewayError::Internal("stack details".into());
        assert_eq!(err.public_message(true), "internal error");
        assert!(err.public_message(false).contains("stack details"));
    }

    #[test]
    fn test_store_error_conversion() {
        let err: GatewayError = StoreError::Unavailable("down".into()).into();
        assert_eq!(err.kind(), "StoreUnavailable");
        let err: GatewayError = StoreError::Operation("bad".into()).into();
        assert_eq!(err.kind(), "Internal");
    }
}
