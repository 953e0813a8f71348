//! Concrete transports for the two ingress paths.
//!
//! Enable the corresponding Cargo feature to pull in a transport:
//!
//! | Feature                | Provides                                       |
//! |------------------------|------------------------------------------------|
//! | `transport-websocket`  | [`WebSocketTransport`], [`WebSocketConnector`] |
//! | `http`                 | [`HttpEventSource`]                            |

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};

#[cfg(feature = "http")]
pub use http::HttpEventSource;
