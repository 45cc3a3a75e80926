//! Error types shared across the transport
//!
//! Transport failures are reported through `ConnectionState`, protocol
//! failures are logged, and only the errors below reach callers.

use thiserror::Error;

/// Errors returned by the `ChatClient` facade
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("Not connected to the chat backend")]
    NotConnected,
    #[error("Connection closed before the command was delivered")]
    ConnectionClosed,
    #[error("Message text is empty")]
    EmptyMessage,
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Connect failure with classification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    pub message: String,
}

impl ConnectError {
    pub fn new(kind: ConnectErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::Unauthorized, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::Unreachable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::Timeout, message)
    }

    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::InvalidUrl, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::Rejected, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::ServerError, message)
    }

    /// Whether calling `connect` again can reasonably succeed
    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

/// Error classification for the caller's retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Handshake refused the bearer token (401, 403) - not retriable
    Unauthorized,
    /// Malformed endpoint URL - not retriable
    InvalidUrl,
    /// Handshake refused for another client-side reason (4xx) - not retriable
    Rejected,
    /// Network-level failure - retriable
    Unreachable,
    /// Backend returned 5xx during the handshake - retriable
    ServerError,
    /// Connect did not finish within the configured timeout - retriable
    Timeout,
}

impl ConnectErrorKind {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Unreachable | Self::ServerError | Self::Timeout)
    }
}

/// Failure reading from or writing to an established link
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Link closed")]
    Closed,
    #[error("Transport failure: {0}")]
    Io(String),
}
