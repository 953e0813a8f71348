//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! This module provides [`WebSocketTransport`], a [`Transport`] implementation
//! that communicates over a WebSocket connection, and [`WebSocketConnector`],
//! which dials new connections for the
//! [`ConnectionManager`](crate::connection::ConnectionManager). Both `ws://` and
//! `wss://` URLs are supported.
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::MonitorError;
use crate::error_codes::ErrorCode;
use crate::transport::{Connector, Transport};

/// Default timeout for establishing a WebSocket connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] implementation backed by a WebSocket connection.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method is cancel-safe. Dropping the future
/// returned by `recv` before it completes will not consume or lose any messages.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Establish a new WebSocket connection to the given URL.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Rejected`] if the server answered the handshake
    /// with 401 or 403, and [`MonitorError::Io`] for every other failure. When
    /// the underlying error is an I/O error its
    /// [`ErrorKind`](std::io::ErrorKind) is preserved.
    pub async fn connect(url: &str, token: Option<&str>) -> Result<Self, MonitorError> {
        tracing::debug!(url = %url, "connecting to WebSocket server");

        let mut request = url
            .into_client_request()
            .map_err(|e| MonitorError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                MonitorError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
            })?;
            request.headers_mut().insert("Authorization", value);
        }

        let (stream, _response) =
            tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| match &e {
                    tokio_tungstenite::tungstenite::Error::Http(response)
                        if matches!(response.status().as_u16(), 401 | 403) =>
                    {
                        let status = response.status().as_u16();
                        MonitorError::Rejected {
                            message: format!("handshake refused with HTTP {status}"),
                            code: Some(if status == 401 {
                                ErrorCode::Unauthorized
                            } else {
                                ErrorCode::Forbidden
                            }),
                        }
                    }
                    tokio_tungstenite::tungstenite::Error::Io(io) => {
                        MonitorError::Io(std::io::Error::new(io.kind(), e.to_string()))
                    }
                    _ => MonitorError::Io(std::io::Error::other(e.to_string())),
                })?;

        tracing::info!(url = %url, "WebSocket connection established");

        Ok(Self {
            stream,
            closed: false,
        })
    }

    /// Create a [`WebSocketTransport`] from an already-established WebSocket stream.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    /// Establish a new WebSocket connection with a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Timeout`] if the deadline elapses, or any
    /// error that [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(
        url: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, MonitorError> {
        tokio::time::timeout(timeout, Self::connect(url, token))
            .await
            .map_err(|_| MonitorError::Timeout)?
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), MonitorError> {
        if self.closed {
            return Err(MonitorError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| MonitorError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, MonitorError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(MonitorError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary WebSocket frame, skipping");
                }
                Message::Frame(_) => {
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), MonitorError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| MonitorError::TransportSend(e.to_string()))
    }
}

/// Dials [`WebSocketTransport`]s for the connection manager.
///
/// ```
/// use exam_monitor_client::WebSocketConnector;
/// use std::time::Duration;
///
/// let connector = WebSocketConnector::new("wss://exams.example/ws")
///     .with_token("secret")
///     .with_connect_timeout(Duration::from_secs(5));
/// assert_eq!(connector.url(), "wss://exams.example/ws");
/// ```
#[derive(Clone)]
pub struct WebSocketConnector {
    url: String,
    token: Option<String>,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector for the given URL with no credential.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Send `Authorization: Bearer <token>` with every handshake.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the handshake timeout. Defaults to **10 seconds**.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The endpoint this connector dials.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("url", &self.url)
            .field("has_token", &self.token.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, MonitorError> {
        let transport = WebSocketTransport::connect_with_timeout(
            &self.url,
            self.token.as_deref(),
            self.connect_timeout,
        )
        .await?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[test]
    fn connector_debug_hides_token() {
        let connector = WebSocketConnector::new("ws://x").with_token("hunter2");
        let debug = format!("{connector:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("has_token: true"));
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-valid-url", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Io(_)));
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let err = WebSocketTransport::connect("ws://127.0.0.1:1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Io(_)));
    }

    // ── Mock-stream helpers ──────────────────────────────────────────────

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns the address to connect to.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    // ── Mock-stream tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn recv_receives_text_messages() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Text("hello".into())).await.unwrap();
            ws.send(Message::Text("world".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url, None).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "hello");
        assert_eq!(transport.recv().await.unwrap().unwrap(), "world");
    }

    #[tokio::test]
    async fn recv_returns_none_on_close_frame() {
        let url = start_mock_server(|mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url, None).await.unwrap();
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_skips_binary_frames() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(Message::Text("after_binary".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url, None).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "after_binary");
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let url = start_mock_server(|mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url, None).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("oops".to_string()).await.unwrap_err();
        assert!(matches!(err, MonitorError::TransportClosed));
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        let result = WebSocketTransport::connect_with_timeout(
            "ws://192.0.2.1:1",
            None,
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result.unwrap_err(), MonitorError::Timeout));
    }

    #[tokio::test]
    async fn connector_sends_bearer_header() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(StdMutex::new(None::<String>));
        let seen_server = Arc::clone(&seen);

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = |req: &Request, resp: Response| {
                let auth = req
                    .headers()
                    .get("Authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                *seen_server.lock().unwrap() = auth;
                Ok::<Response, ErrorResponse>(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback)
                .await
                .unwrap();
            ws.send(Message::Text("hi".into())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let connector = WebSocketConnector::new(format!("ws://{addr}")).with_token("tok-1");
        let mut transport = connector.connect().await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "hi");
        assert_eq!(seen.lock().unwrap().as_deref(), Some("Bearer tok-1"));
    }

    #[tokio::test]
    async fn unauthorized_handshake_maps_to_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = |_req: &Request, _resp: Response| {
                let mut err = ErrorResponse::new(Some("unauthorized".to_string()));
                *err.status_mut() =
                    tokio_tungstenite::tungstenite::http::StatusCode::UNAUTHORIZED;
                Err(err)
            };
            let _ = tokio_tungstenite::accept_hdr_async(tcp, callback).await;
        });

        let err = WebSocketConnector::new(format!("ws://{addr}"))
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            MonitorError::Rejected {
                code: Some(ErrorCode::Unauthorized),
                ..
            }
        ));
    }
}
