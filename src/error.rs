/// Unified error handling for the shardgate proxy
///
/// Every failure a session can observe is one `ShardGateError`. The session
/// decides from `is_fatal()` whether to drop the client connection or to
/// answer with an error packet and keep reading commands.

use crate::protocol::{self, ErrPacket};
use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for shardgate operations
#[derive(Debug, Error)]
pub enum ShardGateError {
    /// Client transport errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed packets or framing violations
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failure during the handshake
    #[error("Access denied for user '{user}'")]
    AccessDenied { user: String },

    /// Statement text the analyzer could not tokenize or understand
    #[error("{message}")]
    Syntax { message: String },

    #[error("Unknown database '{db}'")]
    UnknownDatabase { db: String },

    #[error("No database selected")]
    NoDatabaseSelected,

    /// Unknown schema, unknown node or a statement that cannot be routed
    #[error("Routing error: {message}")]
    Routing { message: String },

    /// The required role of a node has no live pool
    #[error("Backend unavailable: node {node} {role} is down")]
    BackendUnavailable { node: String, role: String },

    /// I/O or protocol failure while talking to a backend node
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Error packet returned by a backend node
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Results from several nodes could not be combined
    #[error("Merge error: {message}")]
    Merge { message: String },

    #[error("Unsupported: {message}")]
    Unsupported { message: String },

    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// An error packet as reported by a backend, passed to the client verbatim
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ERROR {code} ({state}): {message}")]
pub struct ServerError {
    pub code: u16,
    pub state: String,
    pub message: String,
}

impl ServerError {
    pub fn new<S: Into<String>>(code: u16, state: &str, message: S) -> Self {
        Self {
            code,
            state: state.to_string(),
            message: message.into(),
        }
    }
}

impl From<ErrPacket> for ServerError {
    fn from(packet: ErrPacket) -> Self {
        Self {
            code: packet.code,
            state: packet.state,
            message: packet.message,
        }
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for shardgate operations
pub type ShardGateResult<T> = Result<T, ShardGateError>;

/// Convenience methods for creating specific error types
impl ShardGateError {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        ShardGateError::Protocol(message.into())
    }

    pub fn syntax<S: Into<String>>(message: S) -> Self {
        ShardGateError::Syntax {
            message: message.into(),
        }
    }

    pub fn routing<S: Into<String>>(message: S) -> Self {
        ShardGateError::Routing {
            message: message.into(),
        }
    }

    pub fn unavailable<N: Into<String>, R: Into<String>>(node: N, role: R) -> Self {
        ShardGateError::BackendUnavailable {
            node: node.into(),
            role: role.into(),
        }
    }

    pub fn backend<S: Into<String>>(message: S) -> Self {
        ShardGateError::Backend {
            message: message.into(),
        }
    }

    pub fn merge<S: Into<String>>(message: S) -> Self {
        ShardGateError::Merge {
            message: message.into(),
        }
    }

    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        ShardGateError::Unsupported {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        ShardGateError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        ShardGateError::Internal {
            message: message.into(),
        }
    }

    /// Re-label a failure that happened while talking to `node`.
    ///
    /// Transport and framing problems on a backend link must not be mistaken
    /// for client transport problems, which would close the client session.
    pub fn on_backend(self, node: &str) -> Self {
        match self {
            ShardGateError::Network(e) => {
                ShardGateError::backend(format!("node {}: {}", node, e))
            }
            ShardGateError::Protocol(message) => {
                ShardGateError::backend(format!("node {}: {}", node, message))
            }
            other => other,
        }
    }

    /// Whether the client connection must be closed after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShardGateError::Network(_)
                | ShardGateError::Protocol(_)
                | ShardGateError::AccessDenied { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ShardGateError::Config(_) => ErrorSeverity::Critical,
            ShardGateError::Internal { .. } => ErrorSeverity::Critical,
            ShardGateError::Network(_) => ErrorSeverity::Warning,
            ShardGateError::Backend { .. } => ErrorSeverity::Warning,
            ShardGateError::BackendUnavailable { .. } => ErrorSeverity::Warning,
            ShardGateError::Timeout { .. } => ErrorSeverity::Warning,
            ShardGateError::Server(_) => ErrorSeverity::Info,
            ShardGateError::Syntax { .. }
            | ShardGateError::UnknownDatabase { .. }
            | ShardGateError::NoDatabaseSelected
            | ShardGateError::Routing { .. }
            | ShardGateError::Unsupported { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }

    /// Error packet sent to the client for this error
    pub fn to_err_packet(&self) -> ErrPacket {
        use protocol::codes::*;

        let (code, state) = match self {
            ShardGateError::Server(e) => {
                return ErrPacket::new(e.code, &e.state, e.message.clone());
            }
            ShardGateError::AccessDenied { .. } => (ER_ACCESS_DENIED_ERROR, "28000"),
            ShardGateError::Syntax { .. } => (ER_SYNTAX_ERROR, "42000"),
            ShardGateError::UnknownDatabase { .. } => (ER_BAD_DB_ERROR, "42000"),
            ShardGateError::NoDatabaseSelected => (ER_NO_DB_ERROR, "3D000"),
            ShardGateError::Unsupported { .. } => (ER_NOT_SUPPORTED_YET, "42000"),
            ShardGateError::Protocol(_) => (ER_MALFORMED_PACKET, "HY000"),
            _ => (ER_UNKNOWN_ERROR, "HY000"),
        };
        ErrPacket::new(code, state, self.to_string())
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl ErrorSeverity {
    /// Level at which a failed client statement is logged; client-caused
    /// errors stay at debug
    pub fn log_level(self) -> log::Level {
        match self {
            ErrorSeverity::Critical | ErrorSeverity::Error => log::Level::Error,
            ErrorSeverity::Warning => log::Level::Warn,
            ErrorSeverity::Info => log::Level::Debug,
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
