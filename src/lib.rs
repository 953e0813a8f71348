//! # Exam Monitor Client
//!
//! Real-time monitoring and timer synchronization for exam sessions.
//!
//! The client keeps one consistent view of a remote exam session while its
//! state arrives four ways at once:
//!
//! - **pulled** on demand through the [`SessionApi`](api::SessionApi) endpoints;
//! - **pushed** over a persistent bidirectional connection
//!   ([`ConnectionManager`]);
//! - **streamed** as high-frequency dashboard updates over a unidirectional
//!   event stream ([`EventStreamReader`](event_stream::EventStreamReader)),
//!   coalesced by the [`UpdateBatcher`](batcher::UpdateBatcher);
//! - **ticked** locally by the countdown [`TimerEngine`](timer::TimerEngine).
//!
//! Everything lands in the [`SessionStateStore`], an explicit key → entry cache
//! whose merge rules live in [`reconcile`]. [`SessionMonitor`] owns all of it.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] + [`Connector`] for any
//!   bidirectional text channel, or [`EventSource`](event_stream::EventSource)
//!   for the event stream
//! - **WebSocket built-in**: default `transport-websocket` feature provides
//!   `WebSocketConnector`
//! - **HTTP built-in**: default `http` feature provides `HttpEventSource` and
//!   `HttpSessionApi`
//!
//! ## Logging
//!
//! All components log through [`tracing`]. The crate never installs a
//! subscriber.

pub mod api;
pub mod batcher;
pub mod connection;
pub mod error;
pub mod error_codes;
pub mod event_stream;
pub mod monitor;
pub mod protocol;
pub mod reconcile;
pub mod store;
mod sync;
pub mod timer;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStatus};
pub use error::MonitorError;
pub use error_codes::ErrorCode;
pub use monitor::{MonitorConfig, SessionMonitor};
pub use protocol::{ClientMessage, ServerEventKind, ServerMessage};
pub use store::SessionStateStore;
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::websocket::{WebSocketConnector, WebSocketTransport};

#[cfg(feature = "http")]
pub use api::HttpSessionApi;
#[cfg(feature = "http")]
pub use transports::http::HttpEventSource;
