//! Application-root context that owns the whole engine.
//!
//! [`SessionMonitor`] is constructed once with its collaborators injected,
//! started once, and shut down once. It owns the connection, the event
//! stream reader, the store and the refetch worker, and routes incoming
//! push events into the reconciliation policy.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use exam_monitor_client::api::HttpSessionApi;
//! use exam_monitor_client::monitor::{MonitorConfig, SessionMonitor};
//! use exam_monitor_client::timer::MemoryTimerStore;
//! use exam_monitor_client::transports::{HttpEventSource, WebSocketConnector};
//!
//! # async fn example() -> Result<(), exam_monitor_client::MonitorError> {
//! let monitor = SessionMonitor::new(
//!     Arc::new(WebSocketConnector::new("wss://exams.example.com/monitoring").with_token("jwt")),
//!     Arc::new(HttpEventSource::new("https://exams.example.com/api/monitoring/stream")),
//!     Arc::new(HttpSessionApi::new("https://exams.example.com/api")?.with_token("jwt")),
//!     Arc::new(MemoryTimerStore::new()),
//!     MonitorConfig::new(),
//! );
//! monitor.set_credential(Some("jwt".into()));
//! monitor.start();
//! monitor.observe_session("session-1");
//! let timer = monitor.mount_timer("session-1", None);
//!
//! // ... read monitor.store() on every change from monitor.store().subscribe() ...
//!
//! drop(timer);
//! monitor.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::api::SessionApi;
use crate::batcher::{BatchConfig, UpdateBatcher};
use crate::connection::{ConnectionConfig, ConnectionManager, Subscription};
use crate::error::{MonitorError, Result};
use crate::event_stream::{EventSource, EventStreamReader, StreamConfig};
use crate::protocol::{ServerEventKind, SessionControl, SessionId};
use crate::reconcile::{self, Reconciler};
use crate::store::{CacheKey, SessionStateStore, StoreConfig};
use crate::sync::lock;
use crate::timer::{TimerConfig, TimerDriver, TimerEngine, TimerStore};
use crate::transport::Connector;

/// Server events that feed the store.
const STORE_EVENTS: [ServerEventKind; 7] = [
    ServerEventKind::CandidateLogin,
    ServerEventKind::CandidateLogout,
    ServerEventKind::CandidateUpdate,
    ServerEventKind::SessionUpdate,
    ServerEventKind::ExamStarted,
    ServerEventKind::ExamAnswerSubmitted,
    ServerEventKind::MetricsUpdate,
];

/// Configuration of every component owned by a [`SessionMonitor`].
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    pub connection: ConnectionConfig,
    pub stream: StreamConfig,
    pub batch: BatchConfig,
    pub timer: TimerConfig,
    pub store: StoreConfig,
}

impl MonitorConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the connection configuration.
    #[must_use]
    pub fn with_connection(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Replace the event stream configuration.
    #[must_use]
    pub fn with_stream(mut self, config: StreamConfig) -> Self {
        self.stream = config;
        self
    }

    /// Replace the batching configuration.
    #[must_use]
    pub fn with_batch(mut self, config: BatchConfig) -> Self {
        self.batch = config;
        self
    }

    /// Replace the timer configuration.
    #[must_use]
    pub fn with_timer(mut self, config: TimerConfig) -> Self {
        self.timer = config;
        self
    }

    /// Replace the store configuration.
    #[must_use]
    pub fn with_store(mut self, config: StoreConfig) -> Self {
        self.store = config;
        self
    }
}

/// The monitoring engine. See the [module documentation](self).
pub struct SessionMonitor {
    connection: Arc<ConnectionManager>,
    store: Arc<SessionStateStore>,
    batcher: UpdateBatcher,
    reader: EventStreamReader,
    api: Arc<dyn SessionApi>,
    timer_store: Arc<dyn TimerStore>,
    timer_config: TimerConfig,
    refetch_rx: StdMutex<Option<mpsc::UnboundedReceiver<CacheKey>>>,
    reconciler: StdMutex<Option<Reconciler>>,
    listeners: StdMutex<Vec<Subscription>>,
}

impl SessionMonitor {
    /// Build every component. Nothing runs until [`start`](Self::start).
    pub fn new(
        connector: Arc<dyn Connector>,
        source: Arc<dyn EventSource>,
        api: Arc<dyn SessionApi>,
        timer_store: Arc<dyn TimerStore>,
        config: MonitorConfig,
    ) -> Self {
        let (store, refetch_rx) = SessionStateStore::new(config.store);
        let batcher = UpdateBatcher::new(Arc::clone(&store), config.batch);
        let reader = EventStreamReader::new(source, batcher.clone(), config.stream);
        Self {
            connection: Arc::new(ConnectionManager::new(connector, config.connection)),
            store,
            batcher,
            reader,
            api,
            timer_store,
            timer_config: config.timer,
            refetch_rx: StdMutex::new(Some(refetch_rx)),
            reconciler: StdMutex::new(None),
            listeners: StdMutex::new(Vec::new()),
        }
    }

    /// Set the bearer credential of the event stream.
    pub fn set_credential(&self, credential: Option<String>) {
        self.reader.set_credential(credential);
    }

    /// Start the refetch worker, route push events into the store, connect,
    /// join the metrics room and open the event stream.
    ///
    /// Calling it again restarts whatever has stopped (a connection in
    /// `Error`, a reader that had no credential) and leaves the rest alone.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        if let Some(refetch_rx) = lock(&self.refetch_rx).take() {
            let reconciler =
                Reconciler::spawn(Arc::clone(&self.store), Arc::clone(&self.api), refetch_rx);
            *lock(&self.reconciler) = Some(reconciler);
        }

        {
            let mut listeners = lock(&self.listeners);
            if listeners.is_empty() {
                for kind in STORE_EVENTS {
                    let store = Arc::clone(&self.store);
                    listeners.push(self.connection.on(kind, move |msg| {
                        let outcome = reconcile::apply_server_message(&store, msg);
                        debug!(event = %msg.kind(), ?outcome, "applied push event");
                    }));
                }
            }
        }

        info!("starting session monitor");
        self.connection.connect();
        self.connection.subscribe_metrics();
        self.reader.start();
    }

    /// Observe `session_id`: queue its initial pull and join its room,
    /// leaving the previously observed session's room.
    pub fn observe_session(&self, session_id: impl Into<SessionId>) {
        let session_id = session_id.into();
        if let Some(previous) = self.store.observe(session_id.clone()) {
            if previous != session_id {
                self.connection.unsubscribe_session(&previous);
            }
        }
        self.connection.subscribe_session(session_id);
    }

    /// Create and start the countdown of `session_id`.
    ///
    /// `initial` seeds the remaining seconds; without it the persisted state
    /// is restored. A snapshot is requested from the server on mount and on
    /// every reconnect.
    pub fn mount_timer(&self, session_id: impl Into<SessionId>, initial: Option<u64>) -> TimerDriver {
        let engine = TimerEngine::mount(
            session_id,
            initial,
            Arc::clone(&self.timer_store),
            self.timer_config.clone(),
            Utc::now(),
        );
        TimerDriver::spawn(engine, &self.connection)
    }

    /// Start, pause, resume or end the observed session, then invalidate its
    /// entries.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::NoObservedSession`] when nothing is observed,
    /// or the error of the pull endpoint.
    pub async fn control_session(&self, action: SessionControl, reason: Option<String>) -> Result<()> {
        let session_id = self
            .store
            .observed_session()
            .ok_or(MonitorError::NoObservedSession)?;
        info!(session_id = %session_id, ?action, "session control");
        self.api
            .post_session_control(&session_id, action, reason)
            .await?;
        for key in CacheKey::session_keys(&session_id) {
            self.store.invalidate(key);
        }
        Ok(())
    }

    /// Stop everything: the event stream (forcing the final batch flush),
    /// the push routing, the connection and the refetch worker.
    pub async fn shutdown(&self) {
        info!("shutting down session monitor");
        self.reader.stop().await;
        lock(&self.listeners).clear();
        self.connection.disconnect().await;
        let reconciler = lock(&self.reconciler).take();
        if let Some(mut reconciler) = reconciler {
            reconciler.shutdown().await;
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// The bidirectional connection.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// The shared cache.
    pub fn store(&self) -> &Arc<SessionStateStore> {
        &self.store
    }

    /// The dashboard update batcher.
    pub fn batcher(&self) -> &UpdateBatcher {
        &self.batcher
    }

    /// The event stream reader.
    pub fn reader(&self) -> &EventStreamReader {
        &self.reader
    }

    /// The pull endpoints.
    pub fn api(&self) -> &Arc<dyn SessionApi> {
        &self.api
    }
}

impl std::fmt::Debug for SessionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMonitor")
            .field("connection", &self.connection)
            .field("store", &self.store)
            .field("reader", &self.reader)
            .finish_non_exhaustive()
    }
}
