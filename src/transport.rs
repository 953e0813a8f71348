//! Transport abstraction for the bidirectional monitoring channel.
//!
//! The [`Transport`] trait defines one live bidirectional text message channel
//! between the client and server. The protocol uses JSON text messages, so
//! every transport implementation must handle message framing internally
//! (e.g., WebSocket frames, length-prefixed TCP).
//!
//! # Connection Setup
//!
//! Unlike a one-shot client, the [`ConnectionManager`](crate::connection::ConnectionManager)
//! has to dial the server again after every drop. Dialing is therefore split
//! out into the [`Connector`] trait: a connector knows the endpoint and the
//! credentials and hands out a fresh [`Transport`] on each call.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use exam_monitor_client::error::MonitorError;
//! use exam_monitor_client::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), MonitorError> {
//!         // Send the JSON text message over your transport
//!         Ok(())
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, MonitorError>> {
//!         // Receive the next JSON text message
//!         // Return None when the connection is closed cleanly
//!         None
//!     }
//!
//!     async fn close(&mut self) -> Result<(), MonitorError> {
//!         Ok(())
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&self) -> Result<Box<dyn Transport>, MonitorError> {
//!         Ok(Box::new(MyTransport {}))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::MonitorError;

/// A bidirectional text message transport.
///
/// Implementors shuttle serialized JSON strings between the client and server.
/// Each call to [`send`](Transport::send) transmits one complete JSON message.
/// Each call to [`recv`](Transport::recv) returns one complete JSON message.
///
/// # Object Safety
///
/// This trait is object-safe; the connection manager works with
/// `Box<dyn Transport>` so that one connector can be re-dialed indefinitely.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::TransportSend`] if the message could not be sent.
    async fn send(&mut self, message: String) -> Result<(), MonitorError>;

    /// Receive the next JSON text message from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete message was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the server closed the connection
    ///
    /// A `None` is treated as a server-initiated disconnect, which the
    /// connection manager answers with one immediate reconnect.
    async fn recv(&mut self) -> Option<Result<String, MonitorError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), MonitorError>;
}

/// Dials the server and returns a freshly connected [`Transport`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new connection.
    ///
    /// # Errors
    ///
    /// Return [`MonitorError::Rejected`] when the server explicitly refused the
    /// handshake (for example HTTP 401). The connection manager stops retrying
    /// on that error; every other error is retried with backoff.
    async fn connect(&self) -> Result<Box<dyn Transport>, MonitorError>;
}
