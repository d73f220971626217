/// Unified error handling for the esclusa proxy
///
/// This module provides the error type system covering all failure
/// scenarios in the proxy: wire framing errors, pool exhaustion,
/// backend reachability, configuration errors, and protocol desync.
use std::fmt;
use std::io;
use std::net::{AddrParseError, SocketAddr};
use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::FrameError;

/// Main error type for esclusa proxy operations
#[derive(Debug, Error)]
pub enum EsclusaError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The proxy was asked to start with a backend connection limit of zero
    #[error("Maximum backend connections is zero")]
    ZeroMaxConnections,

    /// Wire framing errors (fatal for the connection they occur on)
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// No backend connection became available within the acquire timeout
    #[error("Connection pool exhausted for member {member}")]
    PoolExhausted { member: SocketAddr },

    /// A cluster member could not be reached
    #[error("Member {member} unreachable: {reason}")]
    BackendUnreachable { member: SocketAddr, reason: String },

    /// A response did not correlate to the request in flight
    #[error("Protocol desync: expected response to {expected}, got response to {got}")]
    ProtocolDesync { expected: i32, got: i32 },

    /// The current topology offers no member that can serve the operation
    #[error("No routable member: {0}")]
    NoRoutableMember(String),

    /// Address parsing errors
    #[error("Address parsing error: {0}")]
    AddressParse(#[from] AddrParseError),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for esclusa operations
pub type EsclusaResult<T> = Result<T, EsclusaError>;

/// Convenience methods for creating specific error types
impl EsclusaError {
    /// Create a backend-unreachable error
    pub fn unreachable<S: Into<String>>(member: SocketAddr, reason: S) -> Self {
        EsclusaError::BackendUnreachable {
            member,
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        EsclusaError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        EsclusaError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (the client may retry)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EsclusaError::Network(_)
                | EsclusaError::PoolExhausted { .. }
                | EsclusaError::BackendUnreachable { .. }
                | EsclusaError::NoRoutableMember(_)
                | EsclusaError::Timeout { .. }
        )
    }

    /// Check if this error is fatal for the connection it occurred on
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            EsclusaError::Frame(_) | EsclusaError::ProtocolDesync { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EsclusaError::Config(_) => ErrorSeverity::Critical,
            EsclusaError::ZeroMaxConnections => ErrorSeverity::Critical,
            EsclusaError::Internal { .. } => ErrorSeverity::Critical,
            EsclusaError::Frame(_) => ErrorSeverity::Error,
            EsclusaError::ProtocolDesync { .. } => ErrorSeverity::Error,
            EsclusaError::AddressParse(_) => ErrorSeverity::Error,
            EsclusaError::Network(_) => ErrorSeverity::Warning,
            EsclusaError::NoRoutableMember(_) => ErrorSeverity::Warning,
            EsclusaError::PoolExhausted { .. } => ErrorSeverity::Warning,
            EsclusaError::BackendUnreachable { .. } => ErrorSeverity::Warning,
            EsclusaError::Timeout { .. } => ErrorSeverity::Warning,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect one connection but not the proxy
    Error,
    /// Warnings about recoverable conditions
    Warning,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> SocketAddr {
        "127.0.0.1:27017".parse().unwrap()
    }

    #[test]
    fn test_error_display() {
        let error = EsclusaError::PoolExhausted { member: member() };
        assert_eq!(
            error.to_string(),
            "Connection pool exhausted for member 127.0.0.1:27017"
        );

        let error = EsclusaError::ProtocolDesync {
            expected: 7,
            got: 9,
        };
        assert_eq!(
            error.to_string(),
            "Protocol desync: expected response to 7, got response to 9"
        );
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            EsclusaError::ZeroMaxConnections.severity(),
            ErrorSeverity::Critical
        );

        let config_error =
            EsclusaError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let network_error =
            EsclusaError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert_eq!(network_error.severity(), ErrorSeverity::Warning);

        let desync = EsclusaError::ProtocolDesync {
            expected: 1,
            got: 2,
        };
        assert_eq!(desync.severity(), ErrorSeverity::Error);
    }

    #[test]
    fn test_error_recoverability() {
        assert!(EsclusaError::PoolExhausted { member: member() }.is_recoverable());
        assert!(EsclusaError::unreachable(member(), "refused").is_recoverable());
        assert!(!EsclusaError::ZeroMaxConnections.is_recoverable());
        assert!(
            !EsclusaError::Config(ConfigError::ValidationError("test".to_string()))
                .is_recoverable()
        );
    }

    #[test]
    fn test_connection_fatal() {
        let desync = EsclusaError::ProtocolDesync {
            expected: 1,
            got: 2,
        };
        assert!(desync.is_connection_fatal());
        assert!(!EsclusaError::PoolExhausted { member: member() }.is_connection_fatal());
    }
}
