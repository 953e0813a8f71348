//! Local countdown that follows the server's authoritative timer.
//!
//! [`TimerEngine`] is a synchronous state machine: it is given the current
//! wall-clock instant on every call, which keeps it deterministic under test.
//! [`TimerDriver`] wires an engine to a [`ConnectionManager`] and a tick
//! interval on the Tokio runtime.
//!
//! Remaining time is decremented by elapsed whole seconds measured against the
//! last tick, so a late or missed tick catches up instead of losing time.
//! Server values only replace the local value when they differ by more than
//! [`TimerConfig::drift_tolerance_secs`].
//!
//! Every change is saved to a [`TimerStore`] keyed by session, tagged with the
//! save instant, so a restore can replay the time that passed while the
//! process was gone.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::connection::{ConnectionManager, ConnectionStatus, Subscription};
use crate::error::Result;
use crate::sync::{join_or_abort, lock};
use crate::protocol::{
    ServerEventKind, ServerMessage, SessionId, TimerStatus, TimerTransitionPayload,
    TimerUpdatePayload,
};

/// Default drift tolerance in seconds.
const DEFAULT_DRIFT_TOLERANCE_SECS: u64 = 3;

/// Default tick interval.
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Default timeout for stopping the driver task.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a [`TimerEngine`] and its [`TimerDriver`].
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Largest local/server difference, in seconds, that is left alone.
    /// Defaults to **3**.
    pub drift_tolerance_secs: u64,
    /// How often the driver ticks. Defaults to **1 second**.
    pub tick_interval: Duration,
    /// How long [`TimerDriver::stop`] waits for the task. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl TimerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            drift_tolerance_secs: DEFAULT_DRIFT_TOLERANCE_SECS,
            tick_interval: DEFAULT_TICK_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the drift tolerance.
    #[must_use]
    pub fn with_drift_tolerance_secs(mut self, secs: u64) -> Self {
        self.drift_tolerance_secs = secs;
        self
    }

    /// Set the tick interval.
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Countdown state of one session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TimerState {
    pub status: TimerStatus,
    pub remaining_seconds: u64,
    /// When `remaining_seconds` was last taken from the server.
    pub last_server_instant: Option<DateTime<Utc>>,
}

impl TimerState {
    /// Returns `true` once the countdown has reached zero.
    pub fn is_expired(&self) -> bool {
        self.remaining_seconds == 0
    }
}

/// Stored form of a [`TimerState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTimer {
    pub remaining_seconds: u64,
    pub status: TimerStatus,
    #[serde(default)]
    pub last_server_ts: Option<DateTime<Utc>>,
    /// Save instant, milliseconds since the Unix epoch.
    pub saved_at: i64,
}

impl PersistedTimer {
    /// The state to resume with at `now`.
    ///
    /// A `RUNNING` record loses the whole seconds elapsed since it was saved,
    /// floored at zero. Other statuses are restored as saved.
    pub fn restore(&self, now: DateTime<Utc>) -> TimerState {
        let mut remaining = self.remaining_seconds;
        if self.status == TimerStatus::Running {
            let elapsed_ms = now.timestamp_millis().saturating_sub(self.saved_at).max(0);
            let elapsed_secs = u64::try_from(elapsed_ms / 1000).unwrap_or(0);
            remaining = remaining.saturating_sub(elapsed_secs);
        }
        TimerState {
            status: self.status,
            remaining_seconds: remaining,
            last_server_instant: self.last_server_ts,
        }
    }
}

// ── Persistence ─────────────────────────────────────────────────────

/// Durable per-session storage for timer state.
///
/// Sessions are isolated from each other; concurrent writers of the same
/// session are not coordinated and the last write wins.
pub trait TimerStore: Send + Sync + 'static {
    /// Load the saved record of `session_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage could not be read or the record is
    /// corrupt.
    fn load(&self, session_id: &str) -> Result<Option<PersistedTimer>>;

    /// Save `record` for `session_id`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage could not be written.
    fn save(&self, session_id: &str, record: &PersistedTimer) -> Result<()>;

    /// Remove the record of `session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage could not be written.
    fn remove(&self, session_id: &str) -> Result<()>;
}

/// One JSON file per session in a directory.
#[derive(Debug, Clone)]
pub struct FileTimerStore {
    dir: PathBuf,
}

impl FileTimerStore {
    /// Store records under `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name used for `session_id`.
    ///
    /// Lowercase ASCII letters, digits and `-` are kept; every other byte is
    /// written as `_` plus two lowercase hex digits. The mapping is
    /// injective, also on case-insensitive file systems.
    fn path(&self, session_id: &str) -> PathBuf {
        let mut name = String::with_capacity(session_id.len() + 16);
        name.push_str("exam-timer-");
        for byte in session_id.bytes() {
            if byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-' {
                name.push(char::from(byte));
            } else {
                let _ = write!(name, "_{byte:02x}");
            }
        }
        name.push_str(".json");
        self.dir.join(name)
    }
}

impl TimerStore for FileTimerStore {
    fn load(&self, session_id: &str) -> Result<Option<PersistedTimer>> {
        let text = match std::fs::read_to_string(self.path(session_id)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn save(&self, session_id: &str, record: &PersistedTimer) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string(record)?;
        std::fs::write(self.path(session_id), json)?;
        Ok(())
    }

    fn remove(&self, session_id: &str) -> Result<()> {
        match std::fs::remove_file(self.path(session_id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Process-local store, for tests and for hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemoryTimerStore {
    records: StdMutex<HashMap<SessionId, PersistedTimer>>,
}

impl MemoryTimerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<SessionId, PersistedTimer>> {
        lock(&self.records)
    }
}

impl TimerStore for MemoryTimerStore {
    fn load(&self, session_id: &str) -> Result<Option<PersistedTimer>> {
        Ok(self.records().get(session_id).cloned())
    }

    fn save(&self, session_id: &str, record: &PersistedTimer) -> Result<()> {
        self.records().insert(session_id.to_string(), record.clone());
        Ok(())
    }

    fn remove(&self, session_id: &str) -> Result<()> {
        self.records().remove(session_id);
        Ok(())
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// Which server transition event is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTransition {
    Started,
    Paused,
    Resumed,
    Stopped,
}

impl TimerTransition {
    /// Extract a transition from a server message.
    pub fn from_message(msg: &ServerMessage) -> Option<(Self, &TimerTransitionPayload)> {
        match msg {
            ServerMessage::TimerStarted(p) => Some((Self::Started, p)),
            ServerMessage::TimerPaused(p) => Some((Self::Paused, p)),
            ServerMessage::TimerResumed(p) => Some((Self::Resumed, p)),
            ServerMessage::TimerStopped(p) => Some((Self::Stopped, p)),
            _ => None,
        }
    }
}

/// The countdown state machine of one session. See the [module documentation](self).
pub struct TimerEngine {
    session_id: SessionId,
    state: TimerState,
    config: TimerConfig,
    store: Arc<dyn TimerStore>,
    /// Reference point for the next elapsed-time measurement.
    last_tick: DateTime<Utc>,
}

impl TimerEngine {
    /// Create the engine for `session_id`.
    ///
    /// Seeding order: `initial` remaining seconds (status `PAUSED` until the
    /// server says otherwise), then the persisted record, then zero/`STOPPED`.
    pub fn mount(
        session_id: impl Into<SessionId>,
        initial: Option<u64>,
        store: Arc<dyn TimerStore>,
        config: TimerConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let session_id = session_id.into();
        let state = match initial {
            Some(remaining) => TimerState {
                status: TimerStatus::Paused,
                remaining_seconds: remaining,
                last_server_instant: None,
            },
            None => match store.load(&session_id) {
                Ok(Some(record)) => record.restore(now),
                Ok(None) => TimerState::default(),
                Err(e) => {
                    warn!(session_id = %session_id, "ignoring unreadable persisted timer: {e}");
                    TimerState::default()
                }
            },
        };
        debug!(session_id = %session_id, status = ?state.status, remaining = state.remaining_seconds, "timer mounted");

        let mut engine = Self {
            session_id,
            state,
            config,
            store,
            last_tick: now,
        };
        engine.persist(now);
        engine
    }

    /// The session this engine counts down for.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The current state.
    pub fn state(&self) -> &TimerState {
        &self.state
    }

    /// Advance by the whole seconds elapsed since the last tick.
    ///
    /// Sub-second remainders carry over to the next tick. Returns `true` if
    /// the remaining time changed.
    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.status != TimerStatus::Running {
            self.last_tick = now;
            return false;
        }
        let elapsed_ms = now.signed_duration_since(self.last_tick).num_milliseconds();
        if elapsed_ms < 1000 {
            // Also covers a clock that went backwards.
            if elapsed_ms < 0 {
                self.last_tick = now;
            }
            return false;
        }
        let whole_secs = elapsed_ms / 1000;
        self.last_tick += TimeDelta::seconds(whole_secs);

        let before = self.state.remaining_seconds;
        self.state.remaining_seconds =
            before.saturating_sub(u64::try_from(whole_secs).unwrap_or(u64::MAX));
        let changed = self.state.remaining_seconds != before;
        if changed {
            self.persist(now);
        }
        changed
    }

    /// Apply an authoritative `timer:update`.
    ///
    /// The local value snaps to the server's only when they differ by more
    /// than the tolerance. Returns `true` if the state changed.
    pub fn apply_update(&mut self, update: &TimerUpdatePayload, now: DateTime<Utc>) -> bool {
        if !self.concerns(update.session_id.as_deref()) {
            return false;
        }
        self.tick(now);
        let before = self.state.clone();

        self.correct(update.remaining_seconds, now);
        self.set_status(update.status, now);
        self.state.last_server_instant = Some(update.timestamp);

        self.commit(&before, now)
    }

    /// Apply a `timer:started` / `paused` / `resumed` / `stopped` event.
    ///
    /// `STOPPED` is left only by `Started` (or a `timer:update` snapshot).
    /// Returns `true` if the state changed.
    pub fn apply_transition(
        &mut self,
        transition: TimerTransition,
        payload: &TimerTransitionPayload,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.concerns(payload.session_id.as_deref()) {
            return false;
        }
        self.tick(now);
        let before = self.state.clone();

        let status = match transition {
            TimerTransition::Started => TimerStatus::Running,
            TimerTransition::Stopped => TimerStatus::Stopped,
            TimerTransition::Paused | TimerTransition::Resumed
                if self.state.status == TimerStatus::Stopped =>
            {
                debug!(?transition, "ignoring timer transition while stopped");
                return false;
            }
            TimerTransition::Paused => TimerStatus::Paused,
            TimerTransition::Resumed => TimerStatus::Running,
        };
        if let Some(remaining) = payload.remaining_seconds {
            self.correct(remaining, now);
        }
        self.set_status(status, now);

        self.commit(&before, now)
    }

    /// The record that would be saved at `now`.
    pub fn persisted(&self, now: DateTime<Utc>) -> PersistedTimer {
        PersistedTimer {
            remaining_seconds: self.state.remaining_seconds,
            status: self.state.status,
            last_server_ts: self.state.last_server_instant,
            saved_at: now.timestamp_millis(),
        }
    }

    fn concerns(&self, session_id: Option<&str>) -> bool {
        match session_id {
            Some(id) if id != self.session_id => {
                debug!(session_id = id, "ignoring timer event for another session");
                false
            }
            _ => true,
        }
    }

    /// Snap to `server` if outside the tolerance.
    fn correct(&mut self, server: u64, now: DateTime<Utc>) {
        let drift = self.state.remaining_seconds.abs_diff(server);
        if drift > self.config.drift_tolerance_secs {
            debug!(local = self.state.remaining_seconds, server, "timer drift corrected");
            self.state.remaining_seconds = server;
            self.last_tick = now;
        }
    }

    fn set_status(&mut self, status: TimerStatus, now: DateTime<Utc>) {
        if status == TimerStatus::Running && self.state.status != TimerStatus::Running {
            self.last_tick = now;
        }
        self.state.status = status;
    }

    fn commit(&mut self, before: &TimerState, now: DateTime<Utc>) -> bool {
        let changed = self.state != *before;
        if changed {
            self.persist(now);
        }
        changed
    }

    fn persist(&self, now: DateTime<Utc>) {
        if let Err(e) = self.store.save(&self.session_id, &self.persisted(now)) {
            warn!(session_id = %self.session_id, "failed to persist timer: {e}");
        }
    }
}

impl std::fmt::Debug for TimerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEngine")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// ── Driver ──────────────────────────────────────────────────────────

/// Runs a [`TimerEngine`] against a live connection.
///
/// Ticks on the configured interval, applies `timer:*` events as they arrive
/// and requests a snapshot every time the connection becomes connected.
pub struct TimerDriver {
    engine: Arc<StdMutex<TimerEngine>>,
    state_rx: watch::Receiver<TimerState>,
    subscriptions: Vec<Subscription>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl TimerDriver {
    /// Start driving `engine`. Must be called from within a Tokio runtime.
    pub fn spawn(engine: TimerEngine, connection: &Arc<ConnectionManager>) -> Self {
        let session_id = engine.session_id.clone();
        let tick_interval = engine.config.tick_interval;
        let shutdown_timeout = engine.config.shutdown_timeout;
        let (state_tx, state_rx) = watch::channel(engine.state.clone());
        let state_tx = Arc::new(state_tx);
        let engine = Arc::new(StdMutex::new(engine));

        let mut subscriptions = Vec::with_capacity(5);
        {
            let engine = Arc::clone(&engine);
            let state_tx = Arc::clone(&state_tx);
            subscriptions.push(connection.on(ServerEventKind::TimerUpdate, move |msg| {
                if let ServerMessage::TimerUpdate(update) = msg {
                    let mut engine = lock(&engine);
                    if engine.apply_update(update, Utc::now()) {
                        state_tx.send_replace(engine.state.clone());
                    }
                }
            }));
        }
        for kind in [
            ServerEventKind::TimerStarted,
            ServerEventKind::TimerPaused,
            ServerEventKind::TimerResumed,
            ServerEventKind::TimerStopped,
        ] {
            let engine = Arc::clone(&engine);
            let state_tx = Arc::clone(&state_tx);
            subscriptions.push(connection.on(kind, move |msg| {
                if let Some((transition, payload)) = TimerTransition::from_message(msg) {
                    let mut engine = lock(&engine);
                    if engine.apply_transition(transition, payload, Utc::now()) {
                        state_tx.send_replace(engine.state.clone());
                    }
                }
            }));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(drive(
            Arc::clone(&engine),
            state_tx,
            Arc::clone(connection),
            session_id,
            tick_interval,
            shutdown_rx,
        ));

        Self {
            engine,
            state_rx,
            subscriptions,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        }
    }

    /// The current state.
    pub fn state(&self) -> TimerState {
        self.state_rx.borrow().clone()
    }

    /// A receiver notified on every state change.
    pub fn watch(&self) -> watch::Receiver<TimerState> {
        self.state_rx.clone()
    }

    /// The session being counted down.
    pub fn session_id(&self) -> SessionId {
        lock(&self.engine).session_id.clone()
    }

    /// Stop ticking and listening, saving the final state.
    pub async fn stop(&mut self) {
        self.subscriptions.clear();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            join_or_abort(task, self.shutdown_timeout, "timer task").await;
        }
        let engine = lock(&self.engine);
        engine.persist(Utc::now());
    }
}

impl std::fmt::Debug for TimerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerDriver")
            .field("state", &*self.state_rx.borrow())
            .field("listeners", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl Drop for TimerDriver {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn drive(
    engine: Arc<StdMutex<TimerEngine>>,
    state_tx: Arc<watch::Sender<TimerState>>,
    connection: Arc<ConnectionManager>,
    session_id: SessionId,
    tick_interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut conn_rx = connection.watch_state();
    // Connection count at the last snapshot request.
    let (status, mut requested_at) = {
        let state = conn_rx.borrow_and_update();
        (state.status, state.connections)
    };
    if status == ConnectionStatus::Connected {
        request_snapshot(&connection, &session_id);
    }

    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut watching = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut engine = lock(&engine);
                if engine.tick(Utc::now()) {
                    state_tx.send_replace(engine.state.clone());
                }
            }

            changed = conn_rx.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let (status, connections) = {
                    let state = conn_rx.borrow_and_update();
                    (state.status, state.connections)
                };
                if status == ConnectionStatus::Connected && connections > requested_at {
                    request_snapshot(&connection, &session_id);
                    requested_at = connections;
                }
            }

            _ = &mut shutdown_rx => break,
        }
    }
    debug!(session_id = %session_id, "timer driver exited");
}

fn request_snapshot(connection: &ConnectionManager, session_id: &str) {
    if let Err(e) = connection.request_timer_snapshot(session_id) {
        debug!(session_id, "timer snapshot not requested: {e}");
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
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + TimeDelta::milliseconds(ms)
    }

    fn running(remaining: u64) -> (Arc<MemoryTimerStore>, TimerEngine) {
        let store = Arc::new(MemoryTimerStore::new());
        let mut engine =
            TimerEngine::mount("s-1", Some(remaining), store.clone(), TimerConfig::new(), t0());
        engine.apply_transition(
            TimerTransition::Started,
            &TimerTransitionPayload {
                session_id: None,
                status: TimerStatus::Running,
                remaining_seconds: None,
            },
            t0(),
        );
        (store, engine)
    }

    fn update(remaining: u64, status: TimerStatus) -> TimerUpdatePayload {
        TimerUpdatePayload {
            session_id: Some("s-1".into()),
            remaining_seconds: remaining,
            status,
            timestamp: t0(),
        }
    }

    #[test]
    fn mount_without_anything_is_stopped_at_zero() {
        let engine = TimerEngine::mount(
            "s-1",
            None,
            Arc::new(MemoryTimerStore::new()),
            TimerConfig::new(),
            t0(),
        );
        assert_eq!(engine.state().status, TimerStatus::Stopped);
        assert_eq!(engine.state().remaining_seconds, 0);
    }

    #[test]
    fn tick_subtracts_elapsed_whole_seconds() {
        let (_, mut engine) = running(100);
        assert!(!engine.tick(at(999)));
        assert!(engine.tick(at(1_500)));
        assert_eq!(engine.state().remaining_seconds, 99);
        // The half second left over counts toward the next tick.
        assert!(engine.tick(at(2_000)));
        assert_eq!(engine.state().remaining_seconds, 98);
        // A long gap is caught up at once.
        assert!(engine.tick(at(12_000)));
        assert_eq!(engine.state().remaining_seconds, 88);
    }

    #[test]
    fn remaining_never_goes_below_zero() {
        let (_, mut engine) = running(2);
        engine.tick(at(60_000));
        assert_eq!(engine.state().remaining_seconds, 0);
        assert!(engine.state().is_expired());
        assert!(!engine.tick(at(61_000)));
        assert_eq!(engine.state().remaining_seconds, 0);
    }

    #[test]
    fn paused_timer_does_not_tick() {
        let store = Arc::new(MemoryTimerStore::new());
        let mut engine = TimerEngine::mount("s-1", Some(30), store, TimerConfig::new(), t0());
        assert!(!engine.tick(at(10_000)));
        assert_eq!(engine.state().remaining_seconds, 30);
    }

    #[test]
    fn small_drift_is_ignored_large_drift_snaps() {
        let (_, mut engine) = running(100);

        engine.apply_update(&update(103, TimerStatus::Running), t0());
        assert_eq!(engine.state().remaining_seconds, 100);
        assert_eq!(engine.state().last_server_instant, Some(t0()));

        assert!(!engine.apply_update(&update(97, TimerStatus::Running), t0()));
        assert_eq!(engine.state().remaining_seconds, 100);

        assert!(engine.apply_update(&update(104, TimerStatus::Running), t0()));
        assert_eq!(engine.state().remaining_seconds, 104);

        assert!(engine.apply_update(&update(50, TimerStatus::Paused), t0()));
        assert_eq!(engine.state().remaining_seconds, 50);
        assert_eq!(engine.state().status, TimerStatus::Paused);
    }

    #[test]
    fn update_for_other_session_is_ignored() {
        let (_, mut engine) = running(100);
        let mut other = update(10, TimerStatus::Paused);
        other.session_id = Some("s-2".into());
        assert!(!engine.apply_update(&other, t0()));
        assert_eq!(engine.state().remaining_seconds, 100);
        assert_eq!(engine.state().status, TimerStatus::Running);
    }

    #[test]
    fn stopped_is_left_only_by_start() {
        let (_, mut engine) = running(100);
        let payload = TimerTransitionPayload {
            session_id: None,
            status: TimerStatus::Stopped,
            remaining_seconds: None,
        };
        assert!(engine.apply_transition(TimerTransition::Stopped, &payload, at(1_000)));
        assert_eq!(engine.state().status, TimerStatus::Stopped);

        assert!(!engine.apply_transition(TimerTransition::Resumed, &payload, at(2_000)));
        assert!(!engine.apply_transition(TimerTransition::Paused, &payload, at(2_000)));
        assert_eq!(engine.state().status, TimerStatus::Stopped);

        assert!(engine.apply_transition(TimerTransition::Started, &payload, at(3_000)));
        assert_eq!(engine.state().status, TimerStatus::Running);
    }

    #[test]
    fn pause_then_resume_does_not_count_paused_time() {
        let (_, mut engine) = running(100);
        let payload = TimerTransitionPayload {
            session_id: None,
            status: TimerStatus::Paused,
            remaining_seconds: None,
        };
        engine.apply_transition(TimerTransition::Paused, &payload, at(5_000));
        assert_eq!(engine.state().remaining_seconds, 95);
        engine.apply_transition(TimerTransition::Resumed, &payload, at(65_000));
        engine.tick(at(66_000));
        assert_eq!(engine.state().remaining_seconds, 94);
    }

    #[test]
    fn restore_replays_elapsed_running_time() {
        let record = PersistedTimer {
            remaining_seconds: 600,
            status: TimerStatus::Running,
            last_server_ts: None,
            saved_at: t0().timestamp_millis(),
        };
        assert_eq!(record.restore(at(90_400)).remaining_seconds, 510);
        assert_eq!(record.restore(at(10_000_000)).remaining_seconds, 0);

        let paused = PersistedTimer {
            status: TimerStatus::Paused,
            ..record
        };
        assert_eq!(paused.restore(at(90_400)).remaining_seconds, 600);
    }

    #[test]
    fn every_change_is_persisted_and_restored_on_mount() {
        let (store, mut engine) = running(300);
        engine.tick(at(10_000));

        let saved = store.load("s-1").unwrap().unwrap();
        assert_eq!(saved.remaining_seconds, 290);
        assert_eq!(saved.status, TimerStatus::Running);
        assert_eq!(saved.saved_at, at(10_000).timestamp_millis());

        let restored = TimerEngine::mount("s-1", None, store, TimerConfig::new(), at(40_000));
        assert_eq!(restored.state().remaining_seconds, 260);
        assert_eq!(restored.state().status, TimerStatus::Running);
    }

    #[test]
    fn file_store_uses_camel_case_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTimerStore::new(dir.path());
        let record = PersistedTimer {
            remaining_seconds: 42,
            status: TimerStatus::Paused,
            last_server_ts: None,
            saved_at: 1_000,
        };
        store.save("room/7", &record).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("exam-timer-room_2f7.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["remainingSeconds"], 42);
        assert_eq!(json["status"], "PAUSED");
        assert_eq!(json["savedAt"], 1_000);

        assert_eq!(store.load("room/7").unwrap(), Some(record));
        store.remove("room/7").unwrap();
        assert_eq!(store.load("room/7").unwrap(), None);
        store.remove("room/7").unwrap();
    }

    #[test]
    fn file_store_keeps_similar_session_ids_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTimerStore::new(dir.path());
        let ids = ["exam.1", "exam_1", "exam/1", "Exam-1", "exam-1"];
        for (n, id) in (1u64..).zip(ids) {
            let record = PersistedTimer {
                remaining_seconds: n * 100,
                status: TimerStatus::Paused,
                last_server_ts: None,
                saved_at: 0,
            };
            store.save(id, &record).unwrap();
        }

        for (n, id) in (1u64..).zip(ids) {
            let saved = store.load(id).unwrap().unwrap();
            assert_eq!(saved.remaining_seconds, n * 100, "{id}");
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), ids.len());
    }

    #[test]
    fn corrupt_record_falls_back_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("exam-timer-s-1.json"), "{not json").unwrap();
        let store = Arc::new(FileTimerStore::new(dir.path()));
        let engine = TimerEngine::mount("s-1", None, store, TimerConfig::new(), t0());
        assert_eq!(engine.state().status, TimerStatus::Stopped);
    }
}
