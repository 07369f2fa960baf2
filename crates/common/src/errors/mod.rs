//! Error types for devgate services
//!
//! Provides a single error enum for the transport layer with:
//! - Distinct variants for each failure mode seen by protocol adapters
//! - Machine-readable error codes
//! - Classification of transient vs. permanent failures

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using TransportError
pub type Result<T> = std::result::Result<T, TransportError>;

/// Scope that rejected a rate-limited request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitScope {
    Tenant,
    Device,
    Gateway,
    /// A device whose traffic is routed through a gateway
    GatewayDevice,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Tenant => "tenant",
            RateLimitScope::Device => "device",
            RateLimitScope::Gateway => "gateway",
            RateLimitScope::GatewayDevice => "gateway_device",
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Admission (1xxx)
    RateLimited,
    Unauthorized,

    // Resources (4xxx)
    NotFound,
    SessionNotFound,

    // Routing & queue (8xxx)
    RoutingUnavailable,
    QueueError,
    RpcTimeout,

    // Internal (9xxx)
    InternalError,
    ConfigurationError,
    DecodeError,

    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::RateLimited => 1001,
            ErrorCode::Unauthorized => 1002,

            ErrorCode::NotFound => 4001,
            ErrorCode::SessionNotFound => 4002,

            ErrorCode::RoutingUnavailable => 8001,
            ErrorCode::QueueError => 8002,
            ErrorCode::RpcTimeout => 8003,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::DecodeError => 9003,

            ErrorCode::ServiceUnavailable => 9999,
        }
    }
}

/// Transport error types
///
/// `Clone` so a single backend failure can be handed to every caller that
/// joined the same in-flight request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Rate limit exceeded at {scope} scope")]
    RateLimited { scope: RateLimitScope },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Routing unavailable: {message}")]
    RoutingUnavailable { message: String },

    #[error("Queue send failed: {message}")]
    QueueSend { message: String },

    #[error("Request timed out after {timeout_ms}ms")]
    RpcTimeout { timeout_ms: u64 },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TransportError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            TransportError::RateLimited { .. } => ErrorCode::RateLimited,
            TransportError::Unauthorized { .. } => ErrorCode::Unauthorized,
            TransportError::NotFound { .. } => ErrorCode::NotFound,
            TransportError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            TransportError::RoutingUnavailable { .. } => ErrorCode::RoutingUnavailable,
            TransportError::QueueSend { .. } => ErrorCode::QueueError,
            TransportError::RpcTimeout { .. } => ErrorCode::RpcTimeout,
            TransportError::Decode { .. } => ErrorCode::DecodeError,
            TransportError::Configuration { .. } => ErrorCode::ConfigurationError,
            TransportError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            TransportError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Failures that may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::RoutingUnavailable { .. }
                | TransportError::QueueSend { .. }
                | TransportError::RpcTimeout { .. }
                | TransportError::ServiceUnavailable { .. }
        )
    }

    /// Shorthand for a queue failure
    pub fn queue(message: impl Into<String>) -> Self {
        TransportError::QueueSend {
            message: message.into(),
        }
    }

    /// Shorthand for an internal failure
    pub fn internal(message: impl Into<String>) -> Self {
        TransportError::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Decode {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for TransportError {
    fn from(err: config::ConfigError) -> Self {
        TransportError::Configuration {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Internal {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = TransportError::RateLimited {
            scope: RateLimitScope::Device,
        };
        assert_eq!(err.code(), ErrorCode::RateLimited);
        assert_eq!(err.code().as_code(), 1001);
        assert_eq!(err.to_string(), "Rate limit exceeded at device scope");
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::RpcTimeout { timeout_ms: 10 }.is_transient());
        assert!(TransportError::queue("broker down").is_transient());
        assert!(!TransportError::RateLimited {
            scope: RateLimitScope::Tenant
        }
        .is_transient());
        assert!(!TransportError::internal("bug").is_transient());
    }

    #[test]
    fn test_decode_error_from_json() {
        let err: TransportError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.code(), ErrorCode::DecodeError);
    }
}
