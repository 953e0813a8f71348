//! Wire contract of the bidirectional monitoring channel and the shared
//! session data model.
//!
//! Every message is a JSON text frame of the form
//! `{"event": "<name>", "data": <payload>}`. Event names use the server's
//! `namespace:action` spelling (`candidate:login`, `timer:update`, …) and
//! payload fields are `camelCase`. Instants are RFC 3339 strings.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error_codes::ErrorCode;

// ── Type aliases ────────────────────────────────────────────────────

/// Identifier of an exam session.
pub type SessionId = String;

/// Identifier of a candidate. Stable across updates.
pub type CandidateId = String;

// ── Enums ───────────────────────────────────────────────────────────

/// Status of one candidate within a session.
///
/// The variants line up one-to-one with the counts in [`SessionStatistics`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    #[default]
    Scheduled,
    Absent,
    Active,
    Submitted,
}

/// Status of the session countdown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerStatus {
    Running,
    Paused,
    /// Terminal for the session until the server starts the timer again.
    #[default]
    Stopped,
}

/// One of the four dashboard metric categories fed by the event stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MetricCategory {
    System,
    Business,
    Connection,
    Performance,
}

impl MetricCategory {
    /// All categories, in a stable order.
    pub const ALL: [MetricCategory; 4] = [
        MetricCategory::System,
        MetricCategory::Business,
        MetricCategory::Connection,
        MetricCategory::Performance,
    ];
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::System => "system",
            Self::Business => "business",
            Self::Connection => "connection",
            Self::Performance => "performance",
        };
        f.write_str(name)
    }
}

/// Session control actions accepted by the post-session-control endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionControl {
    Start,
    Pause,
    Resume,
    End,
}

// ── Data model ──────────────────────────────────────────────────────

/// Candidate counts for one session.
///
/// The four counts partition the session's candidate population. A value is
/// always replaced wholesale, never patched field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatistics {
    pub scheduled: u32,
    pub absent: u32,
    pub active: u32,
    pub submitted: u32,
    pub timestamp: DateTime<Utc>,
}

impl SessionStatistics {
    /// Total number of candidates across all four categories.
    pub fn total(&self) -> u32 {
        self.scheduled
            .saturating_add(self.absent)
            .saturating_add(self.active)
            .saturating_add(self.submitted)
    }
}

/// Client software a candidate is connected from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Full state of one candidate. Identity is [`id`](Self::id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub id: CandidateId,
    pub first_name: String,
    pub last_name: String,
    pub status: CandidateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seat_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientDescriptor>,
    #[serde(default)]
    pub subjects: Vec<String>,
}

/// Statistics plus the full candidate list of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetails {
    pub session_id: SessionId,
    pub statistics: SessionStatistics,
    #[serde(default)]
    pub candidates: Vec<CandidateRecord>,
}

/// Answer progress of one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateProgress {
    pub candidate_id: CandidateId,
    pub answered: u32,
    pub total: u32,
}

/// Dashboard metrics, one opaque JSON object per category.
///
/// Category payloads are owned by the server and each one fully supersedes
/// the previous value of its category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DashboardMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<serde_json::Value>,
}

impl DashboardMetrics {
    /// Returns the current value of one category.
    pub fn get(&self, category: MetricCategory) -> Option<&serde_json::Value> {
        match category {
            MetricCategory::System => self.system.as_ref(),
            MetricCategory::Business => self.business.as_ref(),
            MetricCategory::Connection => self.connection.as_ref(),
            MetricCategory::Performance => self.performance.as_ref(),
        }
    }

    /// Replaces one category with `value`.
    pub fn set(&mut self, category: MetricCategory, value: serde_json::Value) {
        let slot = match category {
            MetricCategory::System => &mut self.system,
            MetricCategory::Business => &mut self.business,
            MetricCategory::Connection => &mut self.connection,
            MetricCategory::Performance => &mut self.performance,
        };
        *slot = Some(value);
    }
}

// ── Payload structs ─────────────────────────────────────────────────

/// Payload of `candidate:login` / `candidate:logout`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateEventPayload {
    pub session_id: SessionId,
    pub statistics: SessionStatistics,
    pub candidate: CandidateRecord,
    pub timestamp: DateTime<Utc>,
}

/// Payload of `candidate:update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateUpdatePayload {
    pub session_id: SessionId,
    pub candidate: CandidateRecord,
}

/// Payload of `session:update`. Fields beyond the session id are kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdatePayload {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub changes: serde_json::Map<String, serde_json::Value>,
}

/// Payload of `exam:started` and `exam:answerSubmitted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamActivityPayload {
    pub session_id: SessionId,
    pub candidate_id: CandidateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Payload of `clients:connected` / `clients:disconnected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPresencePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
}

/// Authoritative countdown snapshot (`timer:update`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub remaining_seconds: u64,
    pub status: TimerStatus,
    pub timestamp: DateTime<Utc>,
}

/// Countdown transition (`timer:started` / `paused` / `resumed` / `stopped`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerTransitionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub status: TimerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<u64>,
}

/// Payload of the server `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub message: String,
}

impl ServerErrorPayload {
    /// Returns `true` if this error means the server refuses the connection.
    pub fn is_rejection(&self) -> bool {
        self.code.is_some_and(|c| c.is_rejection())
    }
}

// ── Messages ────────────────────────────────────────────────────────

/// Message types sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    /// Heartbeat to maintain the connection.
    #[serde(rename = "ping")]
    Ping,
    /// Start receiving `metrics:update`.
    #[serde(rename = "subscribe:metrics")]
    SubscribeMetrics,
    /// Stop receiving `metrics:update`.
    #[serde(rename = "unsubscribe:metrics")]
    UnsubscribeMetrics,
    /// Join the room of one session.
    #[serde(rename = "subscribe:session", rename_all = "camelCase")]
    SubscribeSession { session_id: SessionId },
    /// Leave the room of one session.
    #[serde(rename = "unsubscribe:session", rename_all = "camelCase")]
    UnsubscribeSession { session_id: SessionId },
    /// Ask the server to push a `timer:update` for one session.
    #[serde(rename = "timer:requestSnapshot", rename_all = "camelCase")]
    TimerRequestSnapshot { session_id: SessionId },
}

/// Message types sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "metrics:update")]
    MetricsUpdate(DashboardMetrics),
    #[serde(rename = "clients:connected")]
    ClientsConnected(ClientPresencePayload),
    #[serde(rename = "clients:disconnected")]
    ClientsDisconnected(ClientPresencePayload),
    #[serde(rename = "candidate:login")]
    CandidateLogin(Box<CandidateEventPayload>),
    #[serde(rename = "candidate:logout")]
    CandidateLogout(Box<CandidateEventPayload>),
    #[serde(rename = "exam:started")]
    ExamStarted(ExamActivityPayload),
    #[serde(rename = "exam:answerSubmitted")]
    ExamAnswerSubmitted(ExamActivityPayload),
    #[serde(rename = "timer:update")]
    TimerUpdate(TimerUpdatePayload),
    #[serde(rename = "timer:started")]
    TimerStarted(TimerTransitionPayload),
    #[serde(rename = "timer:paused")]
    TimerPaused(TimerTransitionPayload),
    #[serde(rename = "timer:resumed")]
    TimerResumed(TimerTransitionPayload),
    #[serde(rename = "timer:stopped")]
    TimerStopped(TimerTransitionPayload),
    #[serde(rename = "session:update")]
    SessionUpdate(SessionUpdatePayload),
    #[serde(rename = "candidate:update")]
    CandidateUpdate(Box<CandidateUpdatePayload>),
    #[serde(rename = "error")]
    Error(ServerErrorPayload),
}

impl ServerMessage {
    /// Returns the event kind used to route this message to listeners.
    pub fn kind(&self) -> ServerEventKind {
        match self {
            Self::MetricsUpdate(_) => ServerEventKind::MetricsUpdate,
            Self::ClientsConnected(_) => ServerEventKind::ClientsConnected,
            Self::ClientsDisconnected(_) => ServerEventKind::ClientsDisconnected,
            Self::CandidateLogin(_) => ServerEventKind::CandidateLogin,
            Self::CandidateLogout(_) => ServerEventKind::CandidateLogout,
            Self::ExamStarted(_) => ServerEventKind::ExamStarted,
            Self::ExamAnswerSubmitted(_) => ServerEventKind::ExamAnswerSubmitted,
            Self::TimerUpdate(_) => ServerEventKind::TimerUpdate,
            Self::TimerStarted(_) => ServerEventKind::TimerStarted,
            Self::TimerPaused(_) => ServerEventKind::TimerPaused,
            Self::TimerResumed(_) => ServerEventKind::TimerResumed,
            Self::TimerStopped(_) => ServerEventKind::TimerStopped,
            Self::SessionUpdate(_) => ServerEventKind::SessionUpdate,
            Self::CandidateUpdate(_) => ServerEventKind::CandidateUpdate,
            Self::Error(_) => ServerEventKind::Error,
        }
    }
}

/// Discriminant of [`ServerMessage`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    MetricsUpdate,
    ClientsConnected,
    ClientsDisconnected,
    CandidateLogin,
    CandidateLogout,
    ExamStarted,
    ExamAnswerSubmitted,
    TimerUpdate,
    TimerStarted,
    TimerPaused,
    TimerResumed,
    TimerStopped,
    SessionUpdate,
    CandidateUpdate,
    Error,
}

impl ServerEventKind {
    /// The wire name of this event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MetricsUpdate => "metrics:update",
            Self::ClientsConnected => "clients:connected",
            Self::ClientsDisconnected => "clients:disconnected",
            Self::CandidateLogin => "candidate:login",
            Self::CandidateLogout => "candidate:logout",
            Self::ExamStarted => "exam:started",
            Self::ExamAnswerSubmitted => "exam:answerSubmitted",
            Self::TimerUpdate => "timer:update",
            Self::TimerStarted => "timer:started",
            Self::TimerPaused => "timer:paused",
            Self::TimerResumed => "timer:resumed",
            Self::TimerStopped => "timer:stopped",
            Self::SessionUpdate => "session:update",
            Self::CandidateUpdate => "candidate:update",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ServerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
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

    #[test]
    fn client_messages_use_event_names() {
        let json = serde_json::to_value(ClientMessage::SubscribeSession {
            session_id: "s-1".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "event": "subscribe:session", "data": { "sessionId": "s-1" } })
        );

        let json = serde_json::to_value(ClientMessage::Ping).unwrap();
        assert_eq!(json, serde_json::json!({ "event": "ping" }));
    }

    #[test]
    fn candidate_login_parses_from_server_json() {
        let raw = r#"{
            "event": "candidate:login",
            "data": {
                "sessionId": "s-1",
                "statistics": {
                    "scheduled": 4, "absent": 0, "active": 1, "submitted": 0,
                    "timestamp": "2026-03-01T09:00:00Z"
                },
                "candidate": {
                    "id": "c1", "firstName": "Ada", "lastName": "Lovelace",
                    "status": "active", "seatNumber": "A-12",
                    "client": { "ipAddress": "10.0.0.7" },
                    "subjects": ["math"]
                },
                "timestamp": "2026-03-01T09:00:00Z"
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind(), ServerEventKind::CandidateLogin);
        let ServerMessage::CandidateLogin(payload) = msg else {
            panic!("expected CandidateLogin");
        };
        assert_eq!(payload.statistics.active, 1);
        assert_eq!(payload.candidate.status, CandidateStatus::Active);
        assert_eq!(payload.candidate.seat_number.as_deref(), Some("A-12"));
        assert_eq!(payload.candidate.subjects, vec!["math".to_string()]);
        assert!(payload.candidate.last_login.is_none());
    }

    #[test]
    fn timer_transition_without_remaining_seconds() {
        let raw = r#"{"event":"timer:paused","data":{"status":"PAUSED"}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            ServerMessage::TimerPaused(TimerTransitionPayload {
                session_id: None,
                status: TimerStatus::Paused,
                remaining_seconds: None,
            })
        );
    }

    #[test]
    fn error_event_with_unknown_code_still_parses() {
        let raw = r#"{"event":"error","data":{"code":"BRAND_NEW","message":"huh"}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        let ServerMessage::Error(payload) = msg else {
            panic!("expected Error");
        };
        assert_eq!(payload.code, Some(ErrorCode::Unknown));
        assert!(!payload.is_rejection());
    }

    #[test]
    fn session_update_keeps_extra_fields() {
        let raw = r#"{"event":"session:update","data":{"sessionId":"s-9","status":"paused"}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        let ServerMessage::SessionUpdate(payload) = msg else {
            panic!("expected SessionUpdate");
        };
        assert_eq!(payload.session_id, "s-9");
        assert_eq!(payload.changes["status"], "paused");
    }

    #[test]
    fn dashboard_metrics_set_replaces_category() {
        let mut metrics = DashboardMetrics::default();
        metrics.set(MetricCategory::System, serde_json::json!({ "cpu": 10 }));
        metrics.set(MetricCategory::System, serde_json::json!({ "cpu": 20 }));
        assert_eq!(
            metrics.get(MetricCategory::System),
            Some(&serde_json::json!({ "cpu": 20 }))
        );
        assert!(metrics.get(MetricCategory::Business).is_none());
    }

    #[test]
    fn statistics_total_sums_all_categories() {
        let stats = SessionStatistics {
            scheduled: 3,
            absent: 1,
            active: 2,
            submitted: 4,
            timestamp: Utc::now(),
        };
        assert_eq!(stats.total(), 10);
    }

    #[test]
    fn event_kind_names_match_wire_names() {
        let msg = ServerMessage::ExamAnswerSubmitted(ExamActivityPayload {
            session_id: "s".into(),
            candidate_id: "c".into(),
            timestamp: None,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], msg.kind().as_str());
    }
}
