//! # Session Monitor Example
//!
//! Watches one exam session end to end:
//!
//! 1. Connect the push channel and open the dashboard event stream
//! 2. Observe a session and mount its countdown
//! 3. Log every store change and timer tick
//! 4. Shut down gracefully on Ctrl+C
//!
//! ## Running
//!
//! ```sh
//! EXAM_TOKEN=... EXAM_SESSION=session-42 cargo run --example monitor
//!
//! # Override the server endpoints:
//! EXAM_WS_URL=wss://exams.example.com/monitoring \
//! EXAM_STREAM_URL=https://exams.example.com/api/monitoring/stream \
//! EXAM_API_URL=https://exams.example.com/api \
//!     cargo run --example monitor
//! ```

use std::sync::Arc;

use exam_monitor_client::monitor::{MonitorConfig, SessionMonitor};
use exam_monitor_client::store::{CacheKey, ChangeKind};
use exam_monitor_client::timer::FileTimerStore;
use exam_monitor_client::{HttpEventSource, HttpSessionApi, WebSocketConnector};

const DEFAULT_WS_URL: &str = "ws://localhost:3000/monitoring";
const DEFAULT_STREAM_URL: &str = "http://localhost:3000/api/monitoring/stream";
const DEFAULT_API_URL: &str = "http://localhost:3000/api";

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let token = std::env::var("EXAM_TOKEN")?;
    let session_id = env_or("EXAM_SESSION", "session-1");
    let ws_url = env_or("EXAM_WS_URL", DEFAULT_WS_URL);
    let stream_url = env_or("EXAM_STREAM_URL", DEFAULT_STREAM_URL);
    let api_url = env_or("EXAM_API_URL", DEFAULT_API_URL);
    let timer_dir = std::env::temp_dir().join("exam-monitor");

    let monitor = SessionMonitor::new(
        Arc::new(WebSocketConnector::new(ws_url).with_token(token.clone())),
        Arc::new(HttpEventSource::new(stream_url)),
        Arc::new(HttpSessionApi::new(api_url)?.with_token(token.clone())),
        Arc::new(FileTimerStore::new(timer_dir)),
        MonitorConfig::new(),
    );
    monitor.set_credential(Some(token));

    let mut changes = monitor.store().subscribe();
    let mut connection = monitor.connection().watch_state();

    monitor.start();
    monitor.observe_session(session_id.clone());
    let mut timer = monitor.mount_timer(session_id.clone(), None);
    let mut countdown = timer.watch();

    loop {
        tokio::select! {
            change = changes.recv() => {
                let Ok(change) = change else {
                    tracing::warn!("store change feed lagged or closed");
                    continue;
                };
                if change.kind == ChangeKind::Invalidated {
                    continue;
                }
                match &change.key {
                    CacheKey::Statistics(id) => {
                        if let Some(stats) = monitor.store().statistics(id) {
                            tracing::info!(
                                scheduled = stats.scheduled,
                                absent = stats.absent,
                                active = stats.active,
                                submitted = stats.submitted,
                                "statistics"
                            );
                        }
                    }
                    CacheKey::Details(id) => {
                        let count = monitor.store().details(id).map_or(0, |d| d.candidates.len());
                        tracing::info!(candidates = count, "details");
                    }
                    CacheKey::Progress(id) => {
                        let count = monitor.store().progress(id).map_or(0, |p| p.len());
                        tracing::info!(candidates = count, "progress");
                    }
                    CacheKey::Dashboard => {
                        if let Some(metrics) = monitor.store().dashboard() {
                            tracing::info!(?metrics, "dashboard");
                        }
                    }
                }
            }

            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = connection.borrow_and_update().clone();
                tracing::info!(status = ?state.status, attempts = state.reconnect_attempts, "connection");
            }

            changed = countdown.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = countdown.borrow_and_update().clone();
                tracing::info!(status = ?state.status, remaining = state.remaining_seconds, "timer");
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    timer.stop().await;
    monitor.shutdown().await;
    Ok(())
}
