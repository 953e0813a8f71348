#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end tests of `SessionMonitor`: pulls, push merges, the event
//! stream and the batcher working against one store.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use exam_monitor_client::protocol::{CandidateStatus, SessionControl};
use exam_monitor_client::store::{CacheKey, ChangeKind, EntryOrigin};
use exam_monitor_client::timer::MemoryTimerStore;
use exam_monitor_client::{ConnectionStatus, MonitorConfig, MonitorError, SessionMonitor};
use serde_json::json;

struct Harness {
    connector: Arc<MockConnector>,
    source: Arc<MockEventSource>,
    api: Arc<MockSessionApi>,
    monitor: SessionMonitor,
}

fn harness() -> Harness {
    let connector = MockConnector::new(vec![]);
    let source = MockEventSource::new();
    let api = MockSessionApi::new();
    api.set_statistics("s-1", stats(5, 0, 0, 0));
    api.set_details(
        "s-1",
        details("s-1", stats(5, 0, 0, 0), vec![candidate("c1", CandidateStatus::Scheduled)]),
    );
    api.set_progress("s-1", vec![]);

    let monitor = SessionMonitor::new(
        Arc::clone(&connector) as _,
        Arc::clone(&source) as _,
        Arc::clone(&api) as _,
        Arc::new(MemoryTimerStore::new()),
        MonitorConfig::new(),
    );
    monitor.set_credential(Some("jwt".into()));
    Harness {
        connector,
        source,
        api,
        monitor,
    }
}

async fn started(h: &Harness) {
    h.monitor.start();
    let mut state = h.monitor.connection().watch_state();
    wait_for_status(&mut state, ConnectionStatus::Connected).await;
    wait_until(|| h.source.opens() == 1).await;
}

async fn observed(h: &Harness, session_id: &str) {
    h.monitor.observe_session(session_id);
    let store = Arc::clone(h.monitor.store());
    let id = session_id.to_string();
    wait_until(move || {
        store.statistics(&id).is_some() && store.details(&id).is_some() && store.progress(&id).is_some()
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn push_event_survives_failed_refetch() {
    let h = harness();
    started(&h).await;
    observed(&h, "s-1").await;
    assert_eq!(h.monitor.store().statistics("s-1"), Some(stats(5, 0, 0, 0)));

    h.api.set_failing(true);
    h.connector.push(candidate_login_json(
        "s-1",
        candidate("c1", CandidateStatus::Active),
        stats(4, 0, 1, 0),
    ));

    let store = Arc::clone(h.monitor.store());
    wait_until(|| store.statistics("s-1") == Some(stats(4, 0, 1, 0))).await;
    // Let the failing refetch run.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(store.statistics("s-1"), Some(stats(4, 0, 1, 0)));
    let details = store.details("s-1").unwrap();
    assert_eq!(details.statistics, stats(4, 0, 1, 0));
    assert_eq!(details.candidates.len(), 1);
    assert_eq!(details.candidates[0].status, CandidateStatus::Active);
    assert_eq!(
        store.entry(&CacheKey::Statistics("s-1".into())).unwrap().origin,
        EntryOrigin::Push
    );
}

#[tokio::test(start_paused = true)]
async fn push_event_is_reconciled_by_refetch() {
    let h = harness();
    started(&h).await;
    observed(&h, "s-1").await;

    // The server's truth differs from what the event claims.
    h.api.set_statistics("s-1", stats(3, 0, 2, 0));
    h.connector.push(candidate_login_json(
        "s-1",
        candidate("c2", CandidateStatus::Active),
        stats(4, 0, 1, 0),
    ));

    let store = Arc::clone(h.monitor.store());
    wait_until(|| store.statistics("s-1") == Some(stats(3, 0, 2, 0))).await;
    assert_eq!(
        store.entry(&CacheKey::Statistics("s-1".into())).unwrap().origin,
        EntryOrigin::Pull
    );
}

#[tokio::test(start_paused = true)]
async fn events_for_other_sessions_are_ignored() {
    let h = harness();
    started(&h).await;
    observed(&h, "s-1").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fetches = h.api.fetches.load(Ordering::SeqCst);

    h.connector.push(candidate_login_json(
        "s-2",
        candidate("c9", CandidateStatus::Active),
        stats(0, 0, 1, 0),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let store = h.monitor.store();
    assert_eq!(store.statistics("s-1"), Some(stats(5, 0, 0, 0)));
    assert!(store.statistics("s-2").is_none());
    assert_eq!(h.api.fetches.load(Ordering::SeqCst), fetches);
}

#[tokio::test(start_paused = true)]
async fn category_updates_are_coalesced_into_one_write() {
    let h = harness();
    started(&h).await;
    let mut changes = h.monitor.store().subscribe();

    h.source.push_frame("system_update", &json!({ "cpu": 10 }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.source.push_frame("system_update", &json!({ "cpu": 20 }));
    h.source.push_frame("business_update", &json!({ "exams": 3 }));
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut writes = 0;
    while let Ok(change) = changes.try_recv() {
        if change.key == CacheKey::Dashboard && change.kind == ChangeKind::Written {
            writes += 1;
        }
    }
    assert_eq!(writes, 1);

    let dashboard = h.monitor.store().dashboard().unwrap();
    assert_eq!(dashboard.system, Some(json!({ "cpu": 20 })));
    assert_eq!(dashboard.business, Some(json!({ "exams": 3 })));
    assert!(dashboard.connection.is_none());
}

#[tokio::test(start_paused = true)]
async fn stream_metrics_take_precedence_over_push() {
    let h = harness();
    started(&h).await;
    let store = Arc::clone(h.monitor.store());

    // Before the stream owns the dashboard, a push is accepted.
    h.connector.push(
        json!({ "event": "metrics:update", "data": { "system": { "cpu": 1 } } }).to_string(),
    );
    wait_until(|| store.dashboard().is_some()).await;
    assert_eq!(
        store.entry(&CacheKey::Dashboard).unwrap().origin,
        EntryOrigin::Push
    );

    h.source
        .push_frame("metrics", &json!({ "system": { "cpu": 50 }, "business": { "exams": 2 } }));
    wait_until(|| {
        store
            .entry(&CacheKey::Dashboard)
            .is_some_and(|e| e.origin == EntryOrigin::Stream)
    })
    .await;

    h.connector.push(
        json!({ "event": "metrics:update", "data": { "system": { "cpu": 99 } } }).to_string(),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    let dashboard = store.dashboard().unwrap();
    assert_eq!(dashboard.system, Some(json!({ "cpu": 50 })));
    assert_eq!(dashboard.business, Some(json!({ "exams": 2 })));
}

#[tokio::test(start_paused = true)]
async fn start_joins_metrics_room_and_observe_switches_rooms() {
    let h = harness();
    started(&h).await;
    wait_until(|| h.connector.sent_events("subscribe:metrics").len() == 1).await;

    observed(&h, "s-1").await;
    h.monitor.observe_session("s-2");
    wait_until(|| h.connector.sent_events("subscribe:session").len() == 2).await;

    let unsubscribed = h.connector.sent_events("unsubscribe:session");
    assert_eq!(unsubscribed.len(), 1);
    assert_eq!(unsubscribed[0]["data"]["sessionId"], "s-1");
    let subscribed = h.connector.sent_events("subscribe:session");
    assert_eq!(subscribed[1]["data"]["sessionId"], "s-2");
    assert_eq!(h.monitor.store().observed_session().as_deref(), Some("s-2"));

    // Observing the same session again does not leave its room.
    h.monitor.observe_session("s-2");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.connector.sent_events("unsubscribe:session").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn control_session_posts_and_invalidates() {
    let h = harness();
    started(&h).await;

    let err = tokio_test::assert_err!(h.monitor.control_session(SessionControl::Pause, None).await);
    assert!(matches!(err, MonitorError::NoObservedSession));

    observed(&h, "s-1").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fetches = h.api.fetches.load(Ordering::SeqCst);

    tokio_test::assert_ok!(
        h.monitor
            .control_session(SessionControl::Pause, Some("fire alarm".into()))
            .await
    );
    assert_eq!(
        *h.api.controls.lock().unwrap(),
        vec![("s-1".to_string(), SessionControl::Pause, Some("fire alarm".to_string()))]
    );

    let api = Arc::clone(&h.api);
    wait_until(move || api.fetches.load(Ordering::SeqCst) >= fetches + 3).await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_pending_batch() {
    let h = harness();
    started(&h).await;

    h.source.push_frame("performance_update", &json!({ "p95": 120 }));
    let batcher = h.monitor.batcher().clone();
    wait_until(move || !batcher.pending().is_empty()).await;
    assert!(h.monitor.store().dashboard().is_none());

    h.monitor.shutdown().await;

    let dashboard = h.monitor.store().dashboard().unwrap();
    assert_eq!(dashboard.performance, Some(json!({ "p95": 120 })));
    assert_eq!(
        h.monitor.connection().state().status,
        ConnectionStatus::Disconnected
    );
    assert!(!h.monitor.reader().is_running());
}

#[tokio::test(start_paused = true)]
async fn missing_credential_leaves_stream_closed() {
    let h = harness();
    h.monitor.set_credential(None);
    h.monitor.start();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.source.opens(), 0);
    assert!(h.monitor.connection().is_connected());

    h.monitor.set_credential(Some("jwt-2".into()));
    h.monitor.start();
    wait_until(|| h.source.opens() == 1).await;
    assert_eq!(h.source.credentials(), vec!["jwt-2".to_string()]);
    // Restarting does not reconnect a healthy connection.
    assert_eq!(h.connector.dials(), 1);
}
