#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Tests of `TimerDriver` against a live (mock) connection.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use exam_monitor_client::protocol::TimerStatus;
use exam_monitor_client::timer::{
    FileTimerStore, MemoryTimerStore, TimerConfig, TimerDriver, TimerEngine, TimerStore,
};
use exam_monitor_client::{ConnectionConfig, ConnectionManager, ConnectionStatus};

fn connected_manager() -> (Arc<MockConnector>, Arc<ConnectionManager>) {
    let connector = MockConnector::new(vec![]);
    let manager = Arc::new(ConnectionManager::new(
        Arc::clone(&connector) as _,
        ConnectionConfig::new(),
    ));
    (connector, manager)
}

fn mount(
    manager: &Arc<ConnectionManager>,
    store: Arc<dyn TimerStore>,
    config: TimerConfig,
) -> TimerDriver {
    let engine = TimerEngine::mount("s-1", None, store, config, chrono::Utc::now());
    TimerDriver::spawn(engine, manager)
}

#[tokio::test(start_paused = true)]
async fn snapshot_requested_on_connect_and_every_reconnect() {
    let (connector, manager) = connected_manager();
    let mut state = manager.watch_state();

    // Mounted before the connection is up: the request waits for it.
    let driver = mount(&manager, Arc::new(MemoryTimerStore::new()), TimerConfig::new());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(connector.sent_events("timer:requestSnapshot").is_empty());

    manager.connect();
    wait_for_status(&mut state, ConnectionStatus::Connected).await;
    wait_until(|| connector.sent_events("timer:requestSnapshot").len() == 1).await;
    assert_eq!(
        connector.sent_events("timer:requestSnapshot")[0]["data"]["sessionId"],
        "s-1"
    );

    connector.close_from_server();
    wait_until(|| connector.dials() == 2).await;
    wait_until(|| connector.sent_events("timer:requestSnapshot").len() == 2).await;

    drop(driver);
}

#[tokio::test(start_paused = true)]
async fn mounted_while_connected_requests_immediately() {
    let (connector, manager) = connected_manager();
    let mut state = manager.watch_state();
    manager.connect();
    wait_for_status(&mut state, ConnectionStatus::Connected).await;

    let _driver = mount(&manager, Arc::new(MemoryTimerStore::new()), TimerConfig::new());
    wait_until(|| connector.sent_events("timer:requestSnapshot").len() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn server_snapshot_is_applied_and_persisted() {
    let (connector, manager) = connected_manager();
    let store = Arc::new(MemoryTimerStore::new());
    let mut state = manager.watch_state();
    manager.connect();
    wait_for_status(&mut state, ConnectionStatus::Connected).await;

    let driver = mount(&manager, Arc::clone(&store) as _, TimerConfig::new());
    assert_eq!(driver.state().status, TimerStatus::Stopped);
    assert_eq!(driver.state().remaining_seconds, 0);

    let mut timer_rx = driver.watch();
    connector.push(timer_update_json("s-1", 1_800, TimerStatus::Running));
    tokio::time::timeout(Duration::from_secs(5), timer_rx.changed())
        .await
        .unwrap()
        .unwrap();

    let current = driver.state();
    assert_eq!(current.status, TimerStatus::Running);
    assert_eq!(current.remaining_seconds, 1_800);
    assert_eq!(current.last_server_instant, Some(instant()));

    let saved = store.load("s-1").unwrap().unwrap();
    assert_eq!(saved.remaining_seconds, 1_800);
    assert_eq!(saved.status, TimerStatus::Running);
    assert_eq!(saved.last_server_ts, Some(instant()));
}

#[tokio::test(start_paused = true)]
async fn other_session_snapshot_is_ignored() {
    let (connector, manager) = connected_manager();
    let mut state = manager.watch_state();
    manager.connect();
    wait_for_status(&mut state, ConnectionStatus::Connected).await;

    let driver = mount(&manager, Arc::new(MemoryTimerStore::new()), TimerConfig::new());
    connector.push(timer_update_json("s-2", 600, TimerStatus::Running));
    connector.push(timer_update_json("s-1", 900, TimerStatus::Paused));

    wait_until(|| driver.state().remaining_seconds == 900).await;
    assert_eq!(driver.state().status, TimerStatus::Paused);
}

#[tokio::test(start_paused = true)]
async fn stopped_timer_ignores_resume() {
    let (connector, manager) = connected_manager();
    let mut state = manager.watch_state();
    manager.connect();
    wait_for_status(&mut state, ConnectionStatus::Connected).await;

    let driver = mount(&manager, Arc::new(MemoryTimerStore::new()), TimerConfig::new());
    connector.push(timer_update_json("s-1", 600, TimerStatus::Running));
    wait_until(|| driver.state().status == TimerStatus::Running).await;

    connector.push(timer_transition_json("timer:stopped", TimerStatus::Stopped));
    wait_until(|| driver.state().status == TimerStatus::Stopped).await;

    connector.push(timer_transition_json("timer:resumed", TimerStatus::Running));
    connector.push(timer_transition_json("timer:paused", TimerStatus::Paused));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(driver.state().status, TimerStatus::Stopped);

    connector.push(timer_transition_json("timer:started", TimerStatus::Running));
    wait_until(|| driver.state().status == TimerStatus::Running).await;
}

#[tokio::test]
async fn running_timer_counts_down_in_real_time() {
    let (connector, manager) = connected_manager();
    let mut state = manager.watch_state();
    manager.connect();
    wait_for_status(&mut state, ConnectionStatus::Connected).await;

    let config = TimerConfig::new().with_tick_interval(Duration::from_millis(100));
    let driver = mount(&manager, Arc::new(MemoryTimerStore::new()), config);
    connector.push(timer_update_json("s-1", 60, TimerStatus::Running));
    wait_until(|| driver.state().remaining_seconds == 60).await;

    tokio::time::sleep(Duration::from_millis(1_300)).await;
    let remaining = driver.state().remaining_seconds;
    assert!(remaining < 60, "expected a tick, still at {remaining}");
    assert!(remaining >= 57);
}

#[tokio::test(start_paused = true)]
async fn stop_saves_final_state_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileTimerStore::new(dir.path()));
    let (connector, manager) = connected_manager();
    let mut state = manager.watch_state();
    manager.connect();
    wait_for_status(&mut state, ConnectionStatus::Connected).await;

    let mut driver = mount(&manager, Arc::clone(&store) as _, TimerConfig::new());
    connector.push(timer_update_json("s-1", 300, TimerStatus::Paused));
    wait_until(|| driver.state().remaining_seconds == 300).await;
    driver.stop().await;

    // Events after stop no longer reach the engine.
    connector.push(timer_update_json("s-1", 10, TimerStatus::Running));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(driver.state().remaining_seconds, 300);

    let saved = store.load("s-1").unwrap().unwrap();
    assert_eq!(saved.remaining_seconds, 300);
    assert_eq!(saved.status, TimerStatus::Paused);

    // A fresh mount resumes from disk.
    let engine = TimerEngine::mount("s-1", None, store, TimerConfig::new(), chrono::Utc::now());
    assert_eq!(engine.state().remaining_seconds, 300);
    assert_eq!(engine.state().status, TimerStatus::Paused);
}
