//! HTTP event-stream source using `reqwest`.
//!
//! [`HttpEventSource`] issues one long-lived `GET` with
//! `Authorization: Bearer <credential>` and `Accept: text/event-stream`, and
//! hands the response body to the
//! [`EventStreamReader`](crate::event_stream::EventStreamReader) chunk by chunk.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};

use crate::error::MonitorError;
use crate::event_stream::{ChunkStream, EventSource};

/// An [`EventSource`] backed by a streaming HTTP response.
#[derive(Debug, Clone)]
pub struct HttpEventSource {
    client: reqwest::Client,
    url: String,
}

impl HttpEventSource {
    /// Create a source for the given endpoint with a default client.
    ///
    /// No overall request timeout is set: the response body is expected to
    /// stay open indefinitely.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    /// Create a source that reuses an existing client.
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// The endpoint this source opens.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn open(&self, credential: &str) -> Result<ChunkStream, MonitorError> {
        tracing::debug!(url = %self.url, "opening event stream");

        let response = self
            .client
            .get(&self.url)
            .bearer_auth(credential)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MonitorError::Http {
                status: Some(status.as_u16()),
                message: body,
            });
        }

        tracing::info!(url = %self.url, "event stream opened");

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| MonitorError::TransportReceive(e.to_string()))
            })
            .boxed())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one HTTP response on a local port and return the
    /// request head the client sent plus the URL.
    async fn serve_once(
        response: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = tcp.read(&mut buf).await.unwrap();
            tcp.write_all(response.as_bytes()).await.unwrap();
            tcp.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (format!("http://{addr}/events"), task)
    }

    #[tokio::test]
    async fn open_sends_credential_and_streams_body() {
        let (url, server) = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\nevent: heartbeat\ndata: {}\n\n",
        )
        .await;

        let source = HttpEventSource::new(url);
        let mut stream = source.open("tok-9").await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend(chunk.unwrap());
        }
        assert_eq!(body, b"event: heartbeat\ndata: {}\n\n");

        let head = server.await.unwrap().to_lowercase();
        assert!(head.contains("authorization: bearer tok-9"));
        assert!(head.contains("accept: text/event-stream"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_http_error() {
        let (url, _server) = serve_once(
            "HTTP/1.1 401 Unauthorized\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope",
        )
        .await;

        let err = HttpEventSource::new(url).open("bad").await.err().unwrap();
        match err {
            MonitorError::Http { status, message } => {
                assert_eq!(status, Some(401));
                assert_eq!(message, "nope");
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }
}
