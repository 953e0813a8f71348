//! Persistent bidirectional connection with bounded reconnection.
//!
//! [`ConnectionManager`] is a handle over one background supervisor task. The
//! supervisor dials through a [`Connector`], runs the send/receive loop while
//! the link is up, and redials after it drops:
//!
//! - a server-initiated close is answered with one immediate redial;
//! - every other failure goes through exponential backoff, capped at
//!   [`ConnectionConfig::max_reconnect_delay`], for at most
//!   [`ConnectionConfig::max_reconnect_attempts`] attempts;
//! - a link counts as recovered only once it has stayed up for
//!   [`ConnectionConfig::stable_after`]. Until then the attempt counter is
//!   kept and no further immediate redial is granted, so a server that
//!   accepts and closes in a loop still hits the ceiling;
//! - exhausting the attempts, a rejected handshake or a rejection `error`
//!   event ends in [`ConnectionStatus::Error`], which only a fresh
//!   [`connect`](ConnectionManager::connect) leaves.
//!
//! Incoming [`ServerMessage`]s are dispatched on the supervisor task to the
//! listeners registered with [`on`](ConnectionManager::on), in subscription
//! order. Status changes are published through a [`tokio::sync::watch`]
//! channel.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use exam_monitor_client::connection::{ConnectionConfig, ConnectionManager};
//! use exam_monitor_client::protocol::{ServerEventKind, ServerMessage};
//! use exam_monitor_client::transports::WebSocketConnector;
//!
//! # async fn example() {
//! let connector = WebSocketConnector::new("wss://exams.example.com/monitoring").with_token("jwt");
//! let manager = ConnectionManager::new(Arc::new(connector), ConnectionConfig::new());
//!
//! let _logins = manager.on(ServerEventKind::CandidateLogin, |msg| {
//!     if let ServerMessage::CandidateLogin(event) = msg {
//!         println!("{} logged in", event.candidate.id);
//!     }
//! });
//!
//! manager.connect();
//! manager.subscribe_session("session-1");
//! # }
//! ```

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{MonitorError, Result};
use crate::protocol::{ClientMessage, ServerEventKind, ServerMessage, SessionId};
use crate::sync::{join_or_abort, lock};
use crate::transport::{Connector, Transport};

/// Default number of reconnect attempts before giving up.
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default delay before the first reconnect attempt.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default cap on the reconnect delay.
const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default uptime after which a link counts as recovered.
const DEFAULT_STABLE_AFTER: Duration = Duration::from_secs(5);

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`ConnectionManager`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use exam_monitor_client::connection::ConnectionConfig;
///
/// let config = ConnectionConfig::new()
///     .with_max_reconnect_attempts(3)
///     .with_reconnect_delay(Duration::from_millis(500));
/// assert_eq!(config.backoff_delay(1), Duration::from_millis(500));
/// assert_eq!(config.backoff_delay(2), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Reconnect attempts after a drop before the status becomes
    /// [`ConnectionStatus::Error`]. Defaults to **5**.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt; doubled for each further
    /// attempt. Defaults to **1 second**.
    pub reconnect_delay: Duration,
    /// Upper bound for the reconnect delay. Defaults to **5 seconds**.
    pub max_reconnect_delay: Duration,
    /// Uptime after which a link resets the attempt counter and re-arms the
    /// immediate redial. Defaults to **5 seconds**.
    pub stable_after: Duration,
    /// How long [`ConnectionManager::disconnect`] waits for the supervisor
    /// task before aborting it. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl ConnectionConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            stable_after: DEFAULT_STABLE_AFTER,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the reconnect attempt ceiling.
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the initial reconnect delay.
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the reconnect delay cap.
    #[must_use]
    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    /// Set the uptime after which a link counts as recovered.
    #[must_use]
    pub fn with_stable_after(mut self, uptime: Duration) -> Self {
        self.stable_after = uptime;
        self
    }

    /// Set the shutdown timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(reconnect_delay * 2^(attempt - 1), max_reconnect_delay)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Lifecycle status of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal until the next manual [`ConnectionManager::connect`].
    Error,
}

/// Observable connection state. Only the manager writes it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Reconnect attempt in progress. Zero while connected.
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    /// Connections established since the manager was created. Grows by one
    /// on every transition into `Connected`.
    pub connections: u64,
}

type Listener = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    kind: ServerEventKind,
    listener: Listener,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<ListenerEntry>,
}

/// Server-side rooms to rejoin after every (re)connect.
#[derive(Default)]
struct Rooms {
    metrics: bool,
    sessions: BTreeSet<SessionId>,
}

/// State shared between the handle, subscriptions and the supervisor task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    listeners: StdMutex<Listeners>,
    rooms: StdMutex<Rooms>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: watch::Sender::new(ConnectionState::default()),
            listeners: StdMutex::new(Listeners::default()),
            rooms: StdMutex::new(Rooms::default()),
        }
    }

    fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    fn set_state(&self, status: ConnectionStatus, attempts: u32, last_error: Option<String>) {
        let mut from = status;
        self.state.send_modify(|state| {
            from = state.status;
            if status == ConnectionStatus::Connected {
                state.connections = state.connections.saturating_add(1);
            }
            state.status = status;
            state.reconnect_attempts = attempts;
            state.last_error = last_error;
        });
        if from != status {
            debug!(from = ?from, to = ?status, attempts, "connection status changed");
        }
    }

    fn add_listener(self: &Arc<Self>, kind: ServerEventKind, listener: Listener) -> Subscription {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push(ListenerEntry { id, kind, listener });
        Subscription {
            id,
            kind,
            shared: Arc::downgrade(self),
        }
    }

    fn remove_listener(&self, id: u64) {
        lock(&self.listeners).entries.retain(|e| e.id != id);
    }

    /// Call every listener for the message's kind in subscription order.
    ///
    /// The registry lock is released before calling out, so a listener may
    /// subscribe or unsubscribe from inside its callback.
    fn dispatch(&self, msg: &ServerMessage) {
        let kind = msg.kind();
        let targets: Vec<Listener> = lock(&self.listeners)
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| Arc::clone(&e.listener))
            .collect();
        if targets.is_empty() {
            debug!(event = %kind, "no listener for server event");
        }
        for listener in targets {
            listener(msg);
        }
    }

    fn replay_messages(&self) -> Vec<ClientMessage> {
        let rooms = lock(&self.rooms);
        let mut messages = Vec::with_capacity(rooms.sessions.len() + 1);
        if rooms.metrics {
            messages.push(ClientMessage::SubscribeMetrics);
        }
        messages.extend(
            rooms
                .sessions
                .iter()
                .map(|id| ClientMessage::SubscribeSession {
                    session_id: id.clone(),
                }),
        );
        messages
    }
}

// ── Subscriptions ───────────────────────────────────────────────────

/// Registration of one listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener immediately"]
pub struct Subscription {
    id: u64,
    kind: ServerEventKind,
    shared: Weak<Shared>,
}

impl Subscription {
    /// The event kind this subscription listens to.
    pub fn kind(&self) -> ServerEventKind {
        self.kind
    }

    /// Remove the listener. Takes effect before this call returns.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_listener(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A listener whose callback lives in a swappable single-slot cell.
///
/// Dispatch always reads the current callback, so replacing it with
/// [`set_handler`](Self::set_handler) never touches the listener registry.
/// Only [`set_event`](Self::set_event) with a different kind re-registers.
#[must_use = "dropping an EventHandler unsubscribes it"]
pub struct EventHandler {
    slot: Arc<StdMutex<Listener>>,
    shared: Weak<Shared>,
    subscription: Option<Subscription>,
    kind: ServerEventKind,
}

impl EventHandler {
    /// Replace the callback. The registration is kept as-is.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        *lock(&self.slot) = Arc::new(handler);
    }

    /// Listen to `kind` instead. A no-op when the kind is unchanged.
    pub fn set_event(&mut self, kind: ServerEventKind) {
        if kind == self.kind {
            return;
        }
        self.kind = kind;
        // Unregister first so the old kind stops firing before the new one starts.
        self.subscription = None;
        if let Some(shared) = self.shared.upgrade() {
            self.subscription = Some(register_slot(&shared, kind, &self.slot));
        }
    }

    /// The event kind currently listened to.
    pub fn kind(&self) -> ServerEventKind {
        self.kind
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandler")
            .field("kind", &self.kind)
            .field("registered", &self.subscription.is_some())
            .finish_non_exhaustive()
    }
}

fn register_slot(
    shared: &Arc<Shared>,
    kind: ServerEventKind,
    slot: &Arc<StdMutex<Listener>>,
) -> Subscription {
    let slot = Arc::clone(slot);
    shared.add_listener(
        kind,
        Arc::new(move |msg: &ServerMessage| {
            let current = Arc::clone(&*lock(&slot));
            current(msg);
        }),
    )
}

// ── Manager ─────────────────────────────────────────────────────────

struct Worker {
    cmd_tx: mpsc::UnboundedSender<ClientMessage>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Owner of the persistent bidirectional connection.
///
/// See the [module documentation](self) for the lifecycle.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    worker: StdMutex<Option<Worker>>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state. Nothing is dialed until
    /// [`connect`](Self::connect).
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        Self {
            connector,
            config,
            shared: Arc::new(Shared::new()),
            worker: StdMutex::new(None),
        }
    }

    /// Start connecting.
    ///
    /// A no-op while a supervisor is already connecting, connected or
    /// reconnecting. From `Disconnected` or `Error` the attempt counter is
    /// reset to zero and a new supervisor is spawned.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let mut worker = lock(&self.worker);
        if let Some(current) = worker.as_ref() {
            if !current.task.is_finished() && self.shared.status() != ConnectionStatus::Error {
                debug!("connect() while supervisor is running, ignoring");
                return;
            }
        }
        if let Some(stale) = worker.take() {
            stale.task.abort();
        }

        info!("connecting");
        self.shared.set_state(ConnectionStatus::Connecting, 0, None);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            Arc::clone(&self.connector),
            self.config.clone(),
            Arc::clone(&self.shared),
            cmd_rx,
            shutdown_rx,
        ));
        *worker = Some(Worker {
            cmd_tx,
            shutdown_tx: Some(shutdown_tx),
            task,
        });
    }

    /// Close the connection, cancel any pending reconnect and reset the
    /// attempt counter.
    ///
    /// Listeners and recorded room subscriptions are kept for the next
    /// [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        let worker = lock(&self.worker).take();
        if let Some(mut worker) = worker {
            debug!("disconnect requested");
            if let Some(tx) = worker.shutdown_tx.take() {
                let _ = tx.send(());
            }
            drop(worker.cmd_tx);
            join_or_abort(worker.task, self.config.shutdown_timeout, "connection supervisor")
                .await;
        }
        self.shared.set_state(ConnectionStatus::Disconnected, 0, None);
    }

    /// Send a message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::NotConnected`] (after logging a warning) when
    /// the connection is not up. The message is dropped, not queued.
    pub fn emit(&self, msg: ClientMessage) -> Result<()> {
        if self.shared.status() != ConnectionStatus::Connected {
            warn!(?msg, "not connected, dropping outgoing message");
            return Err(MonitorError::NotConnected);
        }
        let worker = lock(&self.worker);
        let Some(worker) = worker.as_ref() else {
            warn!(?msg, "no connection supervisor, dropping outgoing message");
            return Err(MonitorError::NotConnected);
        };
        worker
            .cmd_tx
            .send(msg)
            .map_err(|_| MonitorError::NotConnected)
    }

    /// Send a heartbeat.
    ///
    /// # Errors
    ///
    /// See [`emit`](Self::emit).
    pub fn ping(&self) -> Result<()> {
        self.emit(ClientMessage::Ping)
    }

    /// Join the metrics room, now if connected and after every reconnect.
    pub fn subscribe_metrics(&self) {
        lock(&self.shared.rooms).metrics = true;
        self.emit_if_connected(ClientMessage::SubscribeMetrics);
    }

    /// Leave the metrics room.
    pub fn unsubscribe_metrics(&self) {
        lock(&self.shared.rooms).metrics = false;
        self.emit_if_connected(ClientMessage::UnsubscribeMetrics);
    }

    /// Join the room of `session_id`, now if connected and after every reconnect.
    pub fn subscribe_session(&self, session_id: impl Into<SessionId>) {
        let session_id = session_id.into();
        lock(&self.shared.rooms).sessions.insert(session_id.clone());
        self.emit_if_connected(ClientMessage::SubscribeSession { session_id });
    }

    /// Leave the room of `session_id`.
    pub fn unsubscribe_session(&self, session_id: &str) {
        lock(&self.shared.rooms).sessions.remove(session_id);
        self.emit_if_connected(ClientMessage::UnsubscribeSession {
            session_id: session_id.to_string(),
        });
    }

    /// Ask the server to push a `timer:update` for `session_id`.
    ///
    /// # Errors
    ///
    /// See [`emit`](Self::emit).
    pub fn request_timer_snapshot(&self, session_id: impl Into<SessionId>) -> Result<()> {
        self.emit(ClientMessage::TimerRequestSnapshot {
            session_id: session_id.into(),
        })
    }

    /// Register `listener` for server events of `kind`.
    ///
    /// Allowed in any state; the listener fires once messages arrive.
    /// Listeners for the same kind fire in registration order.
    pub fn on<F>(&self, kind: ServerEventKind, listener: F) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.shared.add_listener(kind, Arc::new(listener))
    }

    /// Register a swappable handler for `kind`. See [`EventHandler`].
    pub fn handler<F>(&self, kind: ServerEventKind, handler: F) -> EventHandler
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let slot: Arc<StdMutex<Listener>> = Arc::new(StdMutex::new(Arc::new(handler)));
        let subscription = register_slot(&self.shared, kind, &slot);
        EventHandler {
            slot,
            shared: Arc::downgrade(&self.shared),
            subscription: Some(subscription),
            kind,
        }
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: ServerEventKind) -> usize {
        lock(&self.shared.listeners)
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    // ── State accessors ─────────────────────────────────────────────

    /// A snapshot of the current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// A receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Returns `true` while the status is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.shared.status() == ConnectionStatus::Connected
    }

    fn emit_if_connected(&self, msg: ClientMessage) {
        if self.is_connected() {
            // Recorded rooms are replayed on reconnect, so a lost send is recovered.
            let _ = self.emit(msg);
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.task.abort();
        }
    }
}

// ── Supervisor ──────────────────────────────────────────────────────

/// Why one live connection ended.
enum LinkExit {
    /// Disconnect requested by the client.
    Shutdown,
    /// The server closed the connection cleanly.
    ServerClosed,
    /// Send/receive failure.
    Failed(String),
    /// The server refused the client.
    Rejected(String),
}

/// Dial, run, redial. Owns the reconnect counter.
///
/// The counter and the one-shot immediate redial are only reset by a link
/// that stayed up for `stable_after`.
async fn supervise(
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientMessage>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("connection supervisor started");
    let mut attempt: u32 = 0;
    let mut immediate_used = false;

    loop {
        let dialed = tokio::select! {
            dialed = connector.connect() => dialed,
            _ = &mut shutdown_rx => break,
        };

        let exit = match dialed {
            Ok(mut transport) => {
                shared.set_state(ConnectionStatus::Connected, 0, None);
                info!("connection established");
                let up_since = Instant::now();
                let exit =
                    run_link(transport.as_mut(), &shared, &mut cmd_rx, &mut shutdown_rx).await;
                if up_since.elapsed() >= config.stable_after {
                    attempt = 0;
                    immediate_used = false;
                }
                exit
            }
            Err(e) if e.is_terminal() => {
                error!("connection rejected: {e}");
                shared.set_state(ConnectionStatus::Error, attempt, Some(e.to_string()));
                break;
            }
            Err(e) => {
                error!("connect failed: {e}");
                LinkExit::Failed(e.to_string())
            }
        };

        let last_error = match exit {
            LinkExit::Shutdown => break,
            LinkExit::Rejected(message) => {
                shared.set_state(ConnectionStatus::Error, attempt, Some(message));
                break;
            }
            LinkExit::ServerClosed => {
                info!("connection closed by server");
                shared.set_state(ConnectionStatus::Disconnected, attempt, None);
                if !immediate_used {
                    immediate_used = true;
                    debug!("reconnecting immediately after server close");
                    continue;
                }
                Some("closed by server".to_string())
            }
            LinkExit::Failed(message) => {
                if shared.status() == ConnectionStatus::Connected {
                    shared.set_state(
                        ConnectionStatus::Disconnected,
                        attempt,
                        Some(message.clone()),
                    );
                }
                Some(message)
            }
        };

        if attempt >= config.max_reconnect_attempts {
            warn!(attempts = attempt, "reconnect attempts exhausted");
            shared.set_state(ConnectionStatus::Error, attempt, last_error);
            break;
        }
        attempt += 1;
        let delay = config.backoff_delay(attempt);
        info!(attempt, ?delay, "reconnecting after delay");
        shared.set_state(ConnectionStatus::Reconnecting, attempt, last_error);

        if !backoff(delay, &mut cmd_rx, &mut shutdown_rx).await {
            break;
        }
    }

    debug!("connection supervisor exited");
}

/// Sleep for `delay`, dropping outgoing messages meanwhile. Returns `false`
/// when shutdown was requested.
async fn backoff(
    delay: Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            _ = &mut *shutdown_rx => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(msg) => warn!(?msg, "dropping outgoing message while reconnecting"),
                None => return false,
            },
        }
    }
}

/// Run one live connection until it ends.
async fn run_link(
    transport: &mut dyn Transport,
    shared: &Shared,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> LinkExit {
    for msg in shared.replay_messages() {
        if let Err(e) = send(transport, &msg).await {
            return LinkExit::Failed(e.to_string());
        }
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(msg) => {
                    if let Err(e) = send(transport, &msg).await {
                        error!("transport send error: {e}");
                        return LinkExit::Failed(format!("transport send error: {e}"));
                    }
                }
                None => {
                    let _ = transport.close().await;
                    return LinkExit::Shutdown;
                }
            },

            _ = &mut *shutdown_rx => {
                debug!("shutdown signal received");
                let _ = transport.close().await;
                return LinkExit::Shutdown;
            }

            incoming = transport.recv() => match incoming {
                Some(Ok(text)) => {
                    match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            let rejection = match &msg {
                                ServerMessage::Error(payload) if payload.is_rejection() => {
                                    Some(payload.message.clone())
                                }
                                ServerMessage::Error(payload) => {
                                    warn!(code = ?payload.code, "server error: {}", payload.message);
                                    None
                                }
                                _ => None,
                            };
                            shared.dispatch(&msg);
                            if let Some(message) = rejection {
                                error!("server rejected the connection: {message}");
                                let _ = transport.close().await;
                                return LinkExit::Rejected(message);
                            }
                        }
                        Err(e) => warn!("failed to deserialize server message: {e}"),
                    }
                }
                Some(Err(e)) => {
                    error!("transport receive error: {e}");
                    return LinkExit::Failed(format!("transport receive error: {e}"));
                }
                None => return LinkExit::ServerClosed,
            },
        }
    }
}

async fn send(transport: &mut dyn Transport, msg: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    transport.send(json).await
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
    use crate::protocol::{ClientPresencePayload, ServerErrorPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn presence() -> ServerMessage {
        ServerMessage::ClientsConnected(ClientPresencePayload {
            client_id: Some("c".into()),
            total: Some(1),
        })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ConnectionConfig::new();
        let delays: Vec<u64> = (1..=5).map(|n| config.backoff_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(config.backoff_delay(40), Duration::from_secs(5));
    }

    #[test]
    fn listeners_fire_in_subscription_order() {
        let shared = Arc::new(Shared::new());
        let order = Arc::new(StdMutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        let _a = shared.add_listener(
            ServerEventKind::ClientsConnected,
            Arc::new(move |_: &ServerMessage| o1.lock().unwrap().push(1)),
        );
        let o2 = Arc::clone(&order);
        let _b = shared.add_listener(
            ServerEventKind::ClientsConnected,
            Arc::new(move |_: &ServerMessage| o2.lock().unwrap().push(2)),
        );
        let o3 = Arc::clone(&order);
        let _other = shared.add_listener(
            ServerEventKind::ClientsDisconnected,
            Arc::new(move |_: &ServerMessage| o3.lock().unwrap().push(3)),
        );

        shared.dispatch(&presence());
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_is_immediate() {
        let shared = Arc::new(Shared::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = shared.add_listener(
            ServerEventKind::ClientsConnected,
            Arc::new(move |_: &ServerMessage| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        shared.dispatch(&presence());
        sub.unsubscribe();
        shared.dispatch(&presence());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rooms_replay_metrics_then_sessions() {
        let shared = Shared::new();
        {
            let mut rooms = lock(&shared.rooms);
            rooms.sessions.insert("s-2".into());
            rooms.sessions.insert("s-1".into());
            rooms.metrics = true;
        }
        assert_eq!(
            shared.replay_messages(),
            vec![
                ClientMessage::SubscribeMetrics,
                ClientMessage::SubscribeSession {
                    session_id: "s-1".into()
                },
                ClientMessage::SubscribeSession {
                    session_id: "s-2".into()
                },
            ]
        );
    }

    #[test]
    fn rejection_error_payload_is_detected() {
        let payload = ServerErrorPayload {
            code: Some(crate::error_codes::ErrorCode::TokenExpired),
            message: "expired".into(),
        };
        assert!(payload.is_rejection());
    }
}
