//! Shepherd Error Types

use thiserror::Error;

/// Result type alias for Shepherd operations
pub type Result<T> = std::result::Result<T, Error>;

/// Shepherd error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Could not resolve node identity: {0}")]
    Identity(String),

    // Node tree errors
    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Ephemeral nodes cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("Invalid node path: {0}")]
    InvalidPath(String),

    // Session errors
    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Connection lost (session {0})")]
    ConnectionLoss(String),

    #[error("Session expired (session {0})")]
    SessionExpired(String),

    #[error("Authentication failed (session {0})")]
    AuthFailed(String),

    #[error("Session closed (session {0})")]
    SessionClosed(String),

    #[error("Not connected to the coordination service")]
    NotConnected,

    // Lifecycle errors
    #[error("Election already started")]
    AlreadyStarted,

    #[error("Shutdown in progress")]
    ShuttingDown,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::ConnectionLoss(_)
        )
    }

    /// Check if this error means the current session can no longer be used
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::SessionExpired(_)
                | Error::AuthFailed(_)
                | Error::SessionClosed(_)
                | Error::NotConnected
        )
    }
}
