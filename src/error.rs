//! Error types for the driver
//!
//! This module defines every error that can surface from a command, from
//! transport failures up to optimistic-concurrency rejections.
//!
//! Two outcomes are deliberately *not* errors: a truncated large-field read
//! (see [`ReadStatus`](crate::transfer::ReadStatus)) and a validation
//! mismatch (see [`Validation`](crate::update::Validation)).

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the driver
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Connection closed by the peer, or the transport was already closed
    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    /// Connection attempt timed out
    #[error("connection timeout after {0:?}")]
    ConnectionTimeout(std::time::Duration),

    /// No server is accepting connections
    #[error("server unavailable: {0}")]
    ServerUnavailable(String),

    /// Connection not ready for operations
    #[error("connection not ready")]
    ConnectionNotReady,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// A unit or reply arrived in a position the protocol does not allow
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected a request on the current command
    #[error("server rejected request (msg {number}): {text}")]
    Server { number: u32, text: String },

    /// A parameter result did not carry the expected kind
    #[error("unexpected parameter data: expected {expected}, got {actual}")]
    UnexpectedParameter { expected: String, actual: String },

    // =========================================================================
    // Command Errors
    // =========================================================================
    /// The server reported that the command failed
    #[error("command failed{}: {}",
        number.map(|n| format!(" (msg {})", n)).unwrap_or_default(),
        message.as_deref().unwrap_or("no server message"))]
    CommandFailed {
        number: Option<u32>,
        message: Option<String>,
    },

    /// A write presented a descriptor whose version is no longer current
    #[error("stale version for large field at location {location}")]
    StaleVersion { location: String },

    // =========================================================================
    // Data Errors
    // =========================================================================
    /// Buffer overflow - not enough space to write
    #[error("buffer overflow: need {needed} bytes but only {available} available")]
    BufferOverflow { needed: usize, available: usize },

    /// Descriptor is missing or malformed
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Invalid argument passed by the caller
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid connection string
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a protocol violation error
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    /// Create a command failure from an optional server message
    pub fn command_failed(message: Option<&crate::messages::ServerMessage>) -> Self {
        Error::CommandFailed {
            number: message.map(|m| m.number),
            message: message.map(|m| m.text.clone()),
        }
    }

    /// Check if this is a connection-related (transport) error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed
                | Error::ConnectionTimeout(_)
                | Error::ServerUnavailable(_)
                | Error::ConnectionNotReady
        )
    }

    /// Check if this error means a unit or reply arrived out of place
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Server { .. } | Error::UnexpectedParameter { .. }
        )
    }

    /// Check if a write was rejected because its descriptor was stale
    pub fn is_stale_version(&self) -> bool {
        matches!(self, Error::StaleVersion { .. })
    }
}
