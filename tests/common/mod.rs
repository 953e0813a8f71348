#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for the exam monitor client integration tests.
//!
//! Provides a scripted [`MockConnector`] handing out channel-backed
//! [`MockTransport`]s, a live [`MockEventSource`], an in-memory
//! [`MockSessionApi`], and helpers for building server message JSON.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};

use exam_monitor_client::api::SessionApi;
use exam_monitor_client::event_stream::{ChunkStream, EventSource};
use exam_monitor_client::protocol::{
    CandidateEventPayload, CandidateProgress, CandidateRecord, CandidateStatus, ServerErrorPayload,
    ServerMessage, SessionControl, SessionDetails, SessionId, SessionStatistics, TimerStatus,
    TimerTransitionPayload, TimerUpdatePayload,
};
use exam_monitor_client::{
    ConnectionState, ConnectionStatus, Connector, ErrorCode, MonitorError, Transport,
};

/// One scripted server-side item: `Some(Ok(json))`, a receive error, or
/// `None` for a server-initiated close.
pub type Incoming = Option<Result<String, MonitorError>>;

// ── MockTransport ───────────────────────────────────────────────────

/// A channel-backed transport. Items pushed through the paired sender are
/// returned by `recv()` in order; once the sender is gone, `recv()` hangs.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Incoming>,
    sent: Arc<StdMutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), MonitorError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, MonitorError>> {
        match self.incoming.recv().await {
            Some(item) => item,
            // No more scripted messages: stay open until shutdown.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), MonitorError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// What the next `connect()` does.
pub enum Dial {
    /// Hand out a transport pre-loaded with these items.
    Accept(Vec<Incoming>),
    /// Fail with a retryable transport error.
    Fail,
    /// Refuse the handshake (terminal).
    Reject,
}

/// A connector that follows a script of [`Dial`]s.
///
/// When the script runs out it either keeps accepting empty connections or
/// keeps failing, depending on how it was built.
pub struct MockConnector {
    script: StdMutex<VecDeque<Dial>>,
    accept_when_exhausted: bool,
    dials: AtomicUsize,
    live: StdMutex<Option<mpsc::UnboundedSender<Incoming>>>,
    pub sent: Arc<StdMutex<Vec<String>>>,
    pub closed: Arc<AtomicBool>,
}

impl MockConnector {
    /// Follow `script`, then accept every further dial.
    pub fn new(script: Vec<Dial>) -> Arc<Self> {
        Self::build(script, true)
    }

    /// Follow `script`, then fail every further dial.
    pub fn failing_after(script: Vec<Dial>) -> Arc<Self> {
        Self::build(script, false)
    }

    fn build(script: Vec<Dial>, accept_when_exhausted: bool) -> Arc<Self> {
        Arc::new(Self {
            script: StdMutex::new(script.into()),
            accept_when_exhausted,
            dials: AtomicUsize::new(0),
            live: StdMutex::new(None),
            sent: Arc::new(StdMutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Number of `connect()` calls so far.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Deliver `json` on the most recently accepted connection.
    pub fn push(&self, json: String) {
        let live = self.live.lock().unwrap();
        live.as_ref()
            .expect("no accepted connection")
            .send(Some(Ok(json)))
            .unwrap();
    }

    /// Close the most recently accepted connection from the server side.
    pub fn close_from_server(&self) {
        let live = self.live.lock().unwrap();
        live.as_ref().expect("no accepted connection").send(None).unwrap();
    }

    /// All messages the client sent, parsed.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    /// Sent messages whose `event` equals `event`.
    pub fn sent_events(&self, event: &str) -> Vec<serde_json::Value> {
        self.sent_json()
            .into_iter()
            .filter(|m| m["event"] == event)
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, MonitorError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let dial = match next {
            Some(dial) => dial,
            None if self.accept_when_exhausted => Dial::Accept(vec![]),
            None => Dial::Fail,
        };
        match dial {
            Dial::Accept(items) => {
                let (tx, rx) = mpsc::unbounded_channel();
                for item in items {
                    tx.send(item).unwrap();
                }
                *self.live.lock().unwrap() = Some(tx);
                Ok(Box::new(MockTransport {
                    incoming: rx,
                    sent: Arc::clone(&self.sent),
                    closed: Arc::clone(&self.closed),
                }))
            }
            Dial::Fail => Err(MonitorError::TransportReceive("connection refused".into())),
            Dial::Reject => Err(MonitorError::Rejected {
                message: "handshake rejected with HTTP 401".into(),
                code: Some(ErrorCode::Unauthorized),
            }),
        }
    }
}

// ── MockEventSource ─────────────────────────────────────────────────

/// An event source whose open stream is fed live from the test.
#[derive(Default)]
pub struct MockEventSource {
    opens: AtomicUsize,
    credentials: StdMutex<Vec<String>>,
    live: StdMutex<Option<mpsc::UnboundedSender<Result<Vec<u8>, MonitorError>>>>,
}

impl MockEventSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of `open()` calls so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Credentials passed to `open()`, in order.
    pub fn credentials(&self) -> Vec<String> {
        self.credentials.lock().unwrap().clone()
    }

    /// Send raw bytes on the open stream.
    pub fn push(&self, bytes: &[u8]) {
        let live = self.live.lock().unwrap();
        live.as_ref()
            .expect("stream not open")
            .send(Ok(bytes.to_vec()))
            .unwrap();
    }

    /// Send one complete frame.
    pub fn push_frame(&self, event: &str, data: &serde_json::Value) {
        self.push(format!("event: {event}\ndata: {data}\n\n").as_bytes());
    }

    /// End the open stream cleanly.
    pub fn end(&self) {
        self.live.lock().unwrap().take();
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn open(&self, credential: &str) -> Result<ChunkStream, MonitorError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.credentials.lock().unwrap().push(credential.to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        *self.live.lock().unwrap() = Some(tx);
        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

// ── MockSessionApi ──────────────────────────────────────────────────

/// Pull endpoints backed by maps the test fills in.
#[derive(Default)]
pub struct MockSessionApi {
    statistics: StdMutex<HashMap<SessionId, SessionStatistics>>,
    details: StdMutex<HashMap<SessionId, SessionDetails>>,
    progress: StdMutex<HashMap<SessionId, Vec<CandidateProgress>>>,
    failing: AtomicBool,
    pub fetches: AtomicUsize,
    pub controls: StdMutex<Vec<(SessionId, SessionControl, Option<String>)>>,
}

impl MockSessionApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_statistics(&self, session_id: &str, stats: SessionStatistics) {
        self.statistics
            .lock()
            .unwrap()
            .insert(session_id.into(), stats);
    }

    pub fn set_details(&self, session_id: &str, details: SessionDetails) {
        self.details.lock().unwrap().insert(session_id.into(), details);
    }

    pub fn set_progress(&self, session_id: &str, progress: Vec<CandidateProgress>) {
        self.progress
            .lock()
            .unwrap()
            .insert(session_id.into(), progress);
    }

    /// Make every fetch fail from now on (or stop failing).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn lookup<T: Clone>(&self, map: &StdMutex<HashMap<SessionId, T>>, id: &str) -> Result<T, MonitorError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(MonitorError::Http {
                status: Some(503),
                message: "unavailable".into(),
            });
        }
        map.lock().unwrap().get(id).cloned().ok_or_else(|| MonitorError::Http {
            status: Some(404),
            message: format!("no session {id}"),
        })
    }
}

#[async_trait]
impl SessionApi for MockSessionApi {
    async fn fetch_session_statistics(&self, session_id: &str) -> Result<SessionStatistics, MonitorError> {
        self.lookup(&self.statistics, session_id)
    }

    async fn fetch_session_details(&self, session_id: &str) -> Result<SessionDetails, MonitorError> {
        self.lookup(&self.details, session_id)
    }

    async fn fetch_candidates_progress(
        &self,
        session_id: &str,
    ) -> Result<Vec<CandidateProgress>, MonitorError> {
        self.lookup(&self.progress, session_id)
    }

    async fn post_session_control(
        &self,
        session_id: &str,
        action: SessionControl,
        reason: Option<String>,
    ) -> Result<(), MonitorError> {
        self.controls
            .lock()
            .unwrap()
            .push((session_id.into(), action, reason));
        Ok(())
    }
}

// ── Waiting ─────────────────────────────────────────────────────────

/// Wait until the connection reports `status`.
pub async fn wait_for_status(
    rx: &mut watch::Receiver<ConnectionState>,
    status: ConnectionStatus,
) -> ConnectionState {
    let state = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| s.status == status))
        .await
        .expect("timed out waiting for connection status")
        .expect("connection state channel closed");
    state.clone()
}

/// Poll `cond` every 10 ms until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ── Builders ────────────────────────────────────────────────────────

pub fn instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
}

pub fn stats(scheduled: u32, absent: u32, active: u32, submitted: u32) -> SessionStatistics {
    SessionStatistics {
        scheduled,
        absent,
        active,
        submitted,
        timestamp: instant(),
    }
}

pub fn candidate(id: &str, status: CandidateStatus) -> CandidateRecord {
    CandidateRecord {
        id: id.into(),
        first_name: "Grace".into(),
        last_name: "Hopper".into(),
        status,
        seat_number: None,
        last_login: Some(instant()),
        client: None,
        subjects: vec!["mathematics".into()],
    }
}

pub fn details(session_id: &str, statistics: SessionStatistics, candidates: Vec<CandidateRecord>) -> SessionDetails {
    SessionDetails {
        session_id: session_id.into(),
        statistics,
        candidates,
    }
}

// ── JSON helper functions ───────────────────────────────────────────

fn to_json(msg: &ServerMessage) -> String {
    serde_json::to_string(msg).expect("server message serialization")
}

/// `candidate:login` for `candidate` in `session_id`.
pub fn candidate_login_json(session_id: &str, candidate: CandidateRecord, statistics: SessionStatistics) -> String {
    to_json(&ServerMessage::CandidateLogin(Box::new(CandidateEventPayload {
        session_id: session_id.into(),
        statistics,
        candidate,
        timestamp: instant(),
    })))
}

/// `timer:update` for `session_id`.
pub fn timer_update_json(session_id: &str, remaining_seconds: u64, status: TimerStatus) -> String {
    to_json(&ServerMessage::TimerUpdate(TimerUpdatePayload {
        session_id: Some(session_id.into()),
        remaining_seconds,
        status,
        timestamp: instant(),
    }))
}

/// `timer:stopped` / `timer:resumed` style transition without remaining time.
pub fn timer_transition_json(event: &str, status: TimerStatus) -> String {
    let payload = TimerTransitionPayload {
        session_id: None,
        status,
        remaining_seconds: None,
    };
    let msg = match event {
        "timer:started" => ServerMessage::TimerStarted(payload),
        "timer:paused" => ServerMessage::TimerPaused(payload),
        "timer:resumed" => ServerMessage::TimerResumed(payload),
        "timer:stopped" => ServerMessage::TimerStopped(payload),
        other => panic!("not a timer transition: {other}"),
    };
    to_json(&msg)
}

/// `error` with the given code.
pub fn error_json(code: Option<ErrorCode>, message: &str) -> String {
    to_json(&ServerMessage::Error(ServerErrorPayload {
        code,
        message: message.into(),
    }))
}

/// `clients:connected`, handy as a "something was delivered" marker.
pub fn clients_connected_json(total: u32) -> String {
    serde_json::json!({
        "event": "clients:connected",
        "data": { "clientId": "admin-1", "total": total }
    })
    .to_string()
}
