//! Pull endpoints of the session API.
//!
//! The request/response side of the backend is an external collaborator;
//! [`SessionApi`] is the seam the [`Reconciler`](crate::reconcile::Reconciler)
//! and [`SessionMonitor`](crate::monitor::SessionMonitor) call through.
//! [`HttpSessionApi`] (feature `http`) is the `reqwest` implementation.

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{CandidateProgress, SessionControl, SessionDetails, SessionStatistics};

/// Request/response access to session state.
#[async_trait]
pub trait SessionApi: Send + Sync + 'static {
    /// Fetch the statistics of a session.
    async fn fetch_session_statistics(&self, session_id: &str) -> Result<SessionStatistics>;

    /// Fetch statistics plus the full candidate list of a session.
    async fn fetch_session_details(&self, session_id: &str) -> Result<SessionDetails>;

    /// Fetch per-candidate answer progress of a session.
    async fn fetch_candidates_progress(&self, session_id: &str) -> Result<Vec<CandidateProgress>>;

    /// Start, pause, resume or end a session.
    async fn post_session_control(
        &self,
        session_id: &str,
        action: SessionControl,
        reason: Option<String>,
    ) -> Result<()>;
}

#[cfg(feature = "http")]
pub use self::http::HttpSessionApi;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use tracing::debug;

    use super::SessionApi;
    use crate::error::{MonitorError, Result};
    use crate::protocol::{
        CandidateProgress, SessionControl, SessionDetails, SessionStatistics,
    };

    /// Default per-request timeout.
    const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    #[derive(Serialize)]
    struct ControlBody {
        action: SessionControl,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    }

    /// [`SessionApi`] over HTTP+JSON.
    ///
    /// Paths are relative to the base URL:
    /// `GET /exam-sessions/{id}/statistics`, `GET /exam-sessions/{id}/details`,
    /// `GET /exam-sessions/{id}/candidates/progress`,
    /// `POST /exam-sessions/{id}/control`.
    #[derive(Clone)]
    pub struct HttpSessionApi {
        client: reqwest::Client,
        base_url: String,
        token: Option<String>,
    }

    impl HttpSessionApi {
        /// Create a client for `base_url` (no trailing slash needed).
        ///
        /// # Errors
        ///
        /// Returns [`MonitorError::Http`] if the HTTP client cannot be built.
        pub fn new(base_url: impl Into<String>) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(DEFAULT_REQUEST_TIMEOUT)
                .build()?;
            Ok(Self::with_client(client, base_url))
        }

        /// Create a client that reuses an existing `reqwest::Client`.
        pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
            let base_url: String = base_url.into();
            Self {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                token: None,
            }
        }

        /// Authenticate requests with a bearer token.
        #[must_use]
        pub fn with_token(mut self, token: impl Into<String>) -> Self {
            self.token = Some(token.into());
            self
        }

        /// `{base}/exam-sessions/{session_id}/{path..}` with the session id
        /// percent-encoded as a single segment.
        fn url(&self, session_id: &str, path: &[&str]) -> Result<reqwest::Url> {
            let mut url = reqwest::Url::parse(&self.base_url)
                .map_err(|e| MonitorError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
            url.path_segments_mut()
                .map_err(|()| MonitorError::InvalidUrl(self.base_url.clone()))?
                .pop_if_empty()
                .push("exam-sessions")
                .push(session_id)
                .extend(path);
            Ok(url)
        }

        fn token(&self) -> Result<&str> {
            self.token.as_deref().ok_or(MonitorError::MissingCredential)
        }

        async fn get<T: DeserializeOwned>(&self, session_id: &str, path: &[&str]) -> Result<T> {
            let url = self.url(session_id, path)?;
            debug!(url = %url, "GET");
            let resp = self
                .client
                .get(url)
                .bearer_auth(self.token()?)
                .send()
                .await?;
            let resp = check_status(resp).await?;
            Ok(resp.json::<T>().await?)
        }
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(MonitorError::Http {
            status: Some(status.as_u16()),
            message: text,
        })
    }

    impl std::fmt::Debug for HttpSessionApi {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("HttpSessionApi")
                .field("base_url", &self.base_url)
                .field("token", &self.token.as_ref().map(|_| "<redacted>"))
                .finish()
        }
    }

    #[async_trait]
    impl SessionApi for HttpSessionApi {
        async fn fetch_session_statistics(&self, session_id: &str) -> Result<SessionStatistics> {
            self.get(session_id, &["statistics"]).await
        }

        async fn fetch_session_details(&self, session_id: &str) -> Result<SessionDetails> {
            self.get(session_id, &["details"]).await
        }

        async fn fetch_candidates_progress(
            &self,
            session_id: &str,
        ) -> Result<Vec<CandidateProgress>> {
            self.get(session_id, &["candidates", "progress"]).await
        }

        async fn post_session_control(
            &self,
            session_id: &str,
            action: SessionControl,
            reason: Option<String>,
        ) -> Result<()> {
            let url = self.url(session_id, &["control"])?;
            debug!(url = %url, ?action, "POST");
            let resp = self
                .client
                .post(url)
                .bearer_auth(self.token()?)
                .json(&ControlBody { action, reason })
                .send()
                .await?;
            check_status(resp).await?;
            Ok(())
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

        /// Answer one request with `response` and hand back the raw request.
        async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let task = tokio::spawn(async move {
                let (mut tcp, _) = listener.accept().await.unwrap();
                let request = read_request(&mut tcp).await;
                tcp.write_all(response.as_bytes()).await.unwrap();
                tcp.shutdown().await.unwrap();
                request
            });
            (format!("http://{addr}/api/"), task)
        }

        /// Read the request head and, if announced, its body.
        async fn read_request(tcp: &mut tokio::net::TcpStream) -> String {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = tcp.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let body_len = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if buf.len() >= head_end + 4 + body_len {
                        return text;
                    }
                }
                if n == 0 {
                    return text;
                }
            }
        }

        fn json_response(body: &str) -> String {
            format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            )
        }

        #[tokio::test]
        async fn statistics_are_fetched_with_bearer_token() {
            let (base, server) = serve_once(json_response(
                r#"{"scheduled":5,"absent":0,"active":0,"submitted":0,"timestamp":"2026-06-01T09:00:00Z"}"#,
            ))
            .await;

            let api = HttpSessionApi::new(base).unwrap().with_token("t-1");
            let stats = api.fetch_session_statistics("s-1").await.unwrap();
            assert_eq!(stats.scheduled, 5);
            assert_eq!(stats.total(), 5);

            let head = server.await.unwrap();
            assert!(head.starts_with("GET /api/exam-sessions/s-1/statistics "));
            assert!(head.to_lowercase().contains("authorization: bearer t-1"));
        }

        #[tokio::test]
        async fn control_posts_action_and_reason() {
            let (base, server) = serve_once(
                "HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n".to_string(),
            )
            .await;

            let api = HttpSessionApi::new(base).unwrap().with_token("t-1");
            api.post_session_control("s-1", SessionControl::Pause, Some("fire drill".into()))
                .await
                .unwrap();

            let request = server.await.unwrap();
            assert!(request.starts_with("POST /api/exam-sessions/s-1/control "));
            assert!(request.contains(r#"{"action":"pause","reason":"fire drill"}"#));
        }

        #[tokio::test]
        async fn session_id_is_encoded_as_one_segment() {
            let (base, server) = serve_once(json_response("[]")).await;

            let api = HttpSessionApi::new(base).unwrap().with_token("t-1");
            let progress = api.fetch_candidates_progress("room/7?x=1").await.unwrap();
            assert!(progress.is_empty());

            let head = server.await.unwrap();
            assert!(
                head.starts_with("GET /api/exam-sessions/room%2F7%3Fx=1/candidates/progress "),
                "{head}"
            );
        }

        #[test]
        fn unusable_base_url_is_reported() {
            let api = HttpSessionApi::new("not a url").unwrap();
            assert!(matches!(
                api.url("s-1", &["details"]),
                Err(MonitorError::InvalidUrl(_))
            ));
        }

        #[tokio::test]
        async fn error_status_carries_body() {
            let (base, _server) = serve_once(
                "HTTP/1.1 404 Not Found\r\ncontent-length: 7\r\nconnection: close\r\n\r\nmissing".to_string(),
            )
            .await;

            let api = HttpSessionApi::new(base).unwrap().with_token("t-1");
            match api.fetch_session_details("s-9").await {
                Err(MonitorError::Http { status, message }) => {
                    assert_eq!(status, Some(404));
                    assert_eq!(message, "missing");
                }
                other => panic!("expected Http error, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn missing_token_is_refused_before_sending() {
            let api = HttpSessionApi::new("http://127.0.0.1:9").unwrap();
            assert!(matches!(
                api.fetch_candidates_progress("s-1").await,
                Err(MonitorError::MissingCredential)
            ));
        }
    }
}
