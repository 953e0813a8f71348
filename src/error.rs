//! Error types for the exam monitor client.

use thiserror::Error;

use crate::error_codes::ErrorCode;

/// Errors that can occur when using the exam monitor client.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires an active connection, but the manager is not connected.
    #[error("not connected to server")]
    NotConnected,

    /// The server explicitly refused the connection (bad or missing credentials).
    ///
    /// This is terminal: the connection manager does not retry after it.
    #[error("connection rejected: {message}")]
    Rejected {
        /// Human-readable reason.
        message: String,
        /// Structured error code, if provided by the server.
        code: Option<ErrorCode>,
    },

    /// The server returned an error message.
    #[error("server error: {message}")]
    ServerError {
        /// Human-readable error message from the server.
        message: String,
        /// Structured error code, if provided by the server.
        code: Option<ErrorCode>,
    },

    /// An operation needs an observed session, but none is observed.
    #[error("no session is being observed")]
    NoObservedSession,

    /// No bearer credential is available for an operation that needs one.
    #[error("no credential available")]
    MissingCredential,

    /// An HTTP request completed with a non-success status or failed outright.
    #[error("http error{}: {message}", fmt_status(.status))]
    Http {
        /// Response status code, when a response was received.
        status: Option<u16>,
        /// Error detail or response body.
        message: String,
    },

    /// A request URL could not be built from the configured base URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    /// Returns `true` if retrying the same operation cannot succeed without
    /// outside intervention (new credentials, a fresh manual connect).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::MissingCredential)
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for MonitorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        Self::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

/// A specialized [`Result`] type for exam monitor client operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
