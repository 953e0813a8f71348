#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire format tests for the monitoring protocol.
//!
//! Every test parses a JSON fixture shaped like real server output, or checks
//! the exact JSON the client puts on the wire.

use chrono::{TimeZone, Utc};
use exam_monitor_client::error_codes::ErrorCode;
use exam_monitor_client::event_stream::{FrameParser, StreamEvent};
use exam_monitor_client::protocol::{
    CandidateProgress, CandidateStatus, ClientMessage, MetricCategory, ServerEventKind,
    ServerMessage, SessionControl, SessionDetails, TimerStatus,
};
use exam_monitor_client::timer::PersistedTimer;
use serde_json::json;

fn parse(value: serde_json::Value) -> ServerMessage {
    serde_json::from_value(value).expect("server message")
}

// ════════════════════════════════════════════════════════════════════
// Client → server
// ════════════════════════════════════════════════════════════════════

#[test]
fn client_messages_serialize_to_exact_wire_json() {
    let cases = [
        (ClientMessage::Ping, json!({ "event": "ping" })),
        (ClientMessage::SubscribeMetrics, json!({ "event": "subscribe:metrics" })),
        (ClientMessage::UnsubscribeMetrics, json!({ "event": "unsubscribe:metrics" })),
        (
            ClientMessage::SubscribeSession {
                session_id: "s-1".into(),
            },
            json!({ "event": "subscribe:session", "data": { "sessionId": "s-1" } }),
        ),
        (
            ClientMessage::UnsubscribeSession {
                session_id: "s-1".into(),
            },
            json!({ "event": "unsubscribe:session", "data": { "sessionId": "s-1" } }),
        ),
        (
            ClientMessage::TimerRequestSnapshot {
                session_id: "s-1".into(),
            },
            json!({ "event": "timer:requestSnapshot", "data": { "sessionId": "s-1" } }),
        ),
    ];
    for (msg, expected) in cases {
        assert_eq!(serde_json::to_value(&msg).unwrap(), expected, "{msg:?}");
    }
}

#[test]
fn session_control_actions_are_lowercase() {
    let actions: Vec<String> = [
        SessionControl::Start,
        SessionControl::Pause,
        SessionControl::Resume,
        SessionControl::End,
    ]
    .iter()
    .map(|a| serde_json::to_value(a).unwrap().as_str().unwrap().to_string())
    .collect();
    assert_eq!(actions, ["start", "pause", "resume", "end"]);
}

// ════════════════════════════════════════════════════════════════════
// Server → client
// ════════════════════════════════════════════════════════════════════

#[test]
fn candidate_logout_fixture() {
    let msg = parse(json!({
        "event": "candidate:logout",
        "data": {
            "sessionId": "s-1",
            "statistics": {
                "scheduled": 0, "absent": 1, "active": 3, "submitted": 1,
                "timestamp": "2026-06-01T09:30:00Z"
            },
            "candidate": {
                "id": "c7",
                "firstName": "Ada",
                "lastName": "Lovelace",
                "status": "submitted",
                "seatNumber": "B12",
                "client": { "ipAddress": "10.0.0.7", "userAgent": "ExamBrowser/3.1" },
                "subjects": ["physics"]
            },
            "timestamp": "2026-06-01T09:30:00Z"
        }
    }));
    assert_eq!(msg.kind(), ServerEventKind::CandidateLogout);
    let ServerMessage::CandidateLogout(event) = msg else {
        panic!("expected candidate:logout");
    };
    assert_eq!(event.statistics.total(), 5);
    assert_eq!(event.candidate.status, CandidateStatus::Submitted);
    assert_eq!(event.candidate.seat_number.as_deref(), Some("B12"));
    assert!(event.candidate.last_login.is_none());
    assert_eq!(
        event.candidate.client.unwrap().user_agent.as_deref(),
        Some("ExamBrowser/3.1")
    );
}

#[test]
fn candidate_update_fixture() {
    let msg = parse(json!({
        "event": "candidate:update",
        "data": {
            "sessionId": "s-1",
            "candidate": { "id": "c1", "firstName": "A", "lastName": "B", "status": "absent" }
        }
    }));
    let ServerMessage::CandidateUpdate(update) = msg else {
        panic!("expected candidate:update");
    };
    assert_eq!(update.candidate.status, CandidateStatus::Absent);
    assert!(update.candidate.subjects.is_empty());
}

#[test]
fn exam_activity_fixtures() {
    let started = parse(json!({
        "event": "exam:started",
        "data": { "sessionId": "s-1", "candidateId": "c1", "timestamp": "2026-06-01T09:05:00Z" }
    }));
    assert_eq!(started.kind(), ServerEventKind::ExamStarted);

    let answered = parse(json!({
        "event": "exam:answerSubmitted",
        "data": { "sessionId": "s-1", "candidateId": "c1" }
    }));
    let ServerMessage::ExamAnswerSubmitted(activity) = answered else {
        panic!("expected exam:answerSubmitted");
    };
    assert_eq!(activity.candidate_id, "c1");
    assert!(activity.timestamp.is_none());
}

#[test]
fn timer_update_fixture() {
    let msg = parse(json!({
        "event": "timer:update",
        "data": {
            "sessionId": "s-1",
            "remainingSeconds": 2_700,
            "status": "RUNNING",
            "timestamp": "2026-06-01T09:15:00Z"
        }
    }));
    let ServerMessage::TimerUpdate(update) = msg else {
        panic!("expected timer:update");
    };
    assert_eq!(update.remaining_seconds, 2_700);
    assert_eq!(update.status, TimerStatus::Running);
    assert_eq!(
        update.timestamp,
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 15, 0).unwrap()
    );
}

#[test]
fn unknown_timer_status_is_rejected() {
    let result = serde_json::from_value::<ServerMessage>(json!({
        "event": "timer:paused",
        "data": { "status": "FROZEN" }
    }));
    assert!(result.is_err());
}

#[test]
fn metrics_update_with_partial_categories() {
    let msg = parse(json!({
        "event": "metrics:update",
        "data": { "connection": { "sockets": 42 } }
    }));
    let ServerMessage::MetricsUpdate(metrics) = msg else {
        panic!("expected metrics:update");
    };
    assert_eq!(metrics.get(MetricCategory::Connection), Some(&json!({ "sockets": 42 })));
    assert!(metrics.get(MetricCategory::System).is_none());
    assert_eq!(
        serde_json::to_value(&metrics).unwrap(),
        json!({ "connection": { "sockets": 42 } })
    );
}

#[test]
fn error_codes_use_screaming_snake_case() {
    let msg = parse(json!({
        "event": "error",
        "data": { "code": "TOKEN_EXPIRED", "message": "jwt expired" }
    }));
    let ServerMessage::Error(payload) = msg else {
        panic!("expected error");
    };
    assert_eq!(payload.code, Some(ErrorCode::TokenExpired));
    assert!(payload.is_rejection());

    assert_eq!(
        serde_json::to_value(ErrorCode::RateLimitExceeded).unwrap(),
        json!("RATE_LIMIT_EXCEEDED")
    );
    assert_eq!(
        serde_json::from_value::<ErrorCode>(json!("SESSION_NOT_FOUND")).unwrap(),
        ErrorCode::SessionNotFound
    );
}

#[test]
fn only_authentication_codes_reject() {
    let rejecting = [
        ErrorCode::Unauthorized,
        ErrorCode::Forbidden,
        ErrorCode::InvalidToken,
        ErrorCode::TokenExpired,
    ];
    let others = [
        ErrorCode::InvalidInput,
        ErrorCode::SessionNotFound,
        ErrorCode::CandidateNotFound,
        ErrorCode::RateLimitExceeded,
        ErrorCode::InternalError,
        ErrorCode::ServiceUnavailable,
        ErrorCode::Unknown,
    ];
    assert!(rejecting.iter().all(ErrorCode::is_rejection));
    assert!(!others.iter().any(ErrorCode::is_rejection));
    assert!(others.iter().all(|c| !c.description().is_empty()));
}

#[test]
fn unknown_event_name_fails_to_parse() {
    let result = serde_json::from_str::<ServerMessage>(r#"{"event":"room:joined","data":{}}"#);
    assert!(result.is_err());
}

// ════════════════════════════════════════════════════════════════════
// Pull payloads and persisted state
// ════════════════════════════════════════════════════════════════════

#[test]
fn session_details_fixture() {
    let details: SessionDetails = serde_json::from_value(json!({
        "sessionId": "s-1",
        "statistics": {
            "scheduled": 1, "absent": 0, "active": 1, "submitted": 0,
            "timestamp": "2026-06-01T09:00:00Z"
        },
        "candidates": [
            { "id": "c1", "firstName": "A", "lastName": "B", "status": "active",
              "lastLogin": "2026-06-01T08:58:00Z" },
            { "id": "c2", "firstName": "C", "lastName": "D", "status": "scheduled" }
        ]
    }))
    .unwrap();
    assert_eq!(details.candidates.len(), 2);
    assert_eq!(details.statistics.total(), 2);
    assert!(details.candidates[0].last_login.is_some());
}

#[test]
fn candidates_progress_fixture() {
    let progress: Vec<CandidateProgress> = serde_json::from_value(json!([
        { "candidateId": "c1", "answered": 12, "total": 40 },
        { "candidateId": "c2", "answered": 0, "total": 40 }
    ]))
    .unwrap();
    assert_eq!(progress[0].answered, 12);
    assert_eq!(progress[1].candidate_id, "c2");
}

#[test]
fn persisted_timer_layout() {
    let record = PersistedTimer {
        remaining_seconds: 1_200,
        status: TimerStatus::Paused,
        last_server_ts: None,
        saved_at: 1_780_304_400_000,
    };
    assert_eq!(
        serde_json::to_value(&record).unwrap(),
        json!({
            "remainingSeconds": 1_200,
            "status": "PAUSED",
            "lastServerTs": null,
            "savedAt": 1_780_304_400_000_i64
        })
    );

    // Records written before the server instant was tracked.
    let old: PersistedTimer = serde_json::from_value(json!({
        "remainingSeconds": 30, "status": "RUNNING", "savedAt": 0
    }))
    .unwrap();
    assert!(old.last_server_ts.is_none());
}

// ════════════════════════════════════════════════════════════════════
// Event stream frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn event_stream_transcript_classifies_every_frame() {
    let transcript = concat!(
        ": keep-alive comment\n\n",
        "event: connected\ndata: {}\n\n",
        "event: heartbeat\ndata: {\"ts\":1}\n\n",
        "event: metrics\ndata: {\"system\":{\"cpu\":3}}\n\n",
        "event: connection_update\ndata: {\"sockets\":9}\n\n",
        "event: audit_log\ndata: {}\n\n",
    );
    let mut parser = FrameParser::new();
    let events: Vec<Option<StreamEvent>> = parser
        .push(transcript.as_bytes())
        .iter()
        .map(|frame| StreamEvent::from_frame(frame).unwrap())
        .collect();

    assert_eq!(events.len(), 5);
    assert_eq!(events[0], Some(StreamEvent::Connected));
    assert_eq!(events[1], Some(StreamEvent::Heartbeat));
    assert!(matches!(&events[2], Some(StreamEvent::Metrics(m)) if m.system == Some(json!({ "cpu": 3 }))));
    assert_eq!(
        events[3],
        Some(StreamEvent::CategoryUpdate {
            category: MetricCategory::Connection,
            value: json!({ "sockets": 9 }),
        })
    );
    assert_eq!(events[4], None);
    assert_eq!(parser.buffered(), 0);
}
