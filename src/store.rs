//! Shared session cache.
//!
//! [`SessionStateStore`] is an explicit key → entry map. Each entry carries
//! its value, where the value came from, when it was written and an
//! invalidation flag. Mutation goes through [`set_entry`](SessionStateStore::set_entry),
//! [`invalidate`](SessionStateStore::invalidate) or an atomic
//! [`transaction`](SessionStateStore::transaction); nothing else touches the map.
//!
//! Invalidating a key marks the entry stale and queues the key on the refetch
//! channel returned by [`SessionStateStore::new`]. A
//! [`Reconciler`](crate::reconcile::Reconciler) drains that channel and pulls
//! fresh values from the server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::protocol::{
    CandidateProgress, DashboardMetrics, SessionDetails, SessionId, SessionStatistics,
};

/// Capacity of the change-notification broadcast channel.
const CHANGE_CHANNEL_CAPACITY: usize = 128;

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`SessionStateStore`].
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// How long a pulled entry counts as fresh.
    ///
    /// Defaults to **zero**: entries are stale as soon as they are written,
    /// which leaves server push as the primary update path.
    pub stale_time: Duration,
}

impl StoreConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how long a written entry counts as fresh.
    #[must_use]
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }
}

// ── Keys and entries ────────────────────────────────────────────────

/// Identifies one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Lightweight counts for a session.
    Statistics(SessionId),
    /// Statistics plus the full candidate list for a session.
    Details(SessionId),
    /// Per-candidate answer progress for a session.
    Progress(SessionId),
    /// Process-wide dashboard metrics.
    Dashboard,
}

impl CacheKey {
    /// The session this key belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Statistics(id) | Self::Details(id) | Self::Progress(id) => Some(id),
            Self::Dashboard => None,
        }
    }

    /// All per-session keys of `session_id`.
    pub fn session_keys(session_id: &str) -> [CacheKey; 3] {
        [
            CacheKey::Statistics(session_id.to_string()),
            CacheKey::Details(session_id.to_string()),
            CacheKey::Progress(session_id.to_string()),
        ]
    }
}

/// Value stored under a [`CacheKey`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Statistics(SessionStatistics),
    Details(SessionDetails),
    Progress(Vec<CandidateProgress>),
    Dashboard(DashboardMetrics),
}

impl CacheValue {
    fn fits(&self, key: &CacheKey) -> bool {
        matches!(
            (self, key),
            (Self::Statistics(_), CacheKey::Statistics(_))
                | (Self::Details(_), CacheKey::Details(_))
                | (Self::Progress(_), CacheKey::Progress(_))
                | (Self::Dashboard(_), CacheKey::Dashboard)
        )
    }
}

/// Where a cache entry's current value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    /// A request/response fetch.
    Pull,
    /// An event on the bidirectional channel.
    Push,
    /// The unidirectional event stream.
    Stream,
}

/// One cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: CacheValue,
    pub origin: EntryOrigin,
    pub updated_at: DateTime<Utc>,
    /// Set by [`SessionStateStore::invalidate`]; cleared by the next write.
    pub invalidated: bool,
}

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Written,
    Invalidated,
}

/// Notification broadcast after every committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: CacheKey,
    pub kind: ChangeKind,
}

// ── Store ───────────────────────────────────────────────────────────

struct StoreInner {
    entries: HashMap<CacheKey, CacheEntry>,
    observed: Option<SessionId>,
}

/// The shared session cache. See the [module documentation](self).
pub struct SessionStateStore {
    config: StoreConfig,
    inner: StdMutex<StoreInner>,
    changes: broadcast::Sender<StoreChange>,
    refetch_tx: mpsc::UnboundedSender<CacheKey>,
}

impl SessionStateStore {
    /// Create an empty store.
    ///
    /// Returns the store plus the receiver of refetch requests; every
    /// invalidated key is sent on it once per invalidation.
    #[must_use = "the refetch receiver must be drained by a Reconciler"]
    pub fn new(config: StoreConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<CacheKey>) {
        let (refetch_tx, refetch_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = Arc::new(Self {
            config,
            inner: StdMutex::new(StoreInner {
                entries: HashMap::new(),
                observed: None,
            }),
            changes,
            refetch_tx,
        });
        (store, refetch_rx)
    }

    /// Make `session_id` the observed session and queue its initial pull.
    ///
    /// Returns the previously observed session, if any.
    pub fn observe(&self, session_id: impl Into<SessionId>) -> Option<SessionId> {
        let session_id = session_id.into();
        let previous = self.lock().observed.replace(session_id.clone());
        debug!(session_id = %session_id, ?previous, "observing session");
        for key in CacheKey::session_keys(&session_id) {
            self.invalidate(key);
        }
        previous
    }

    /// Stop observing any session. Entries are kept.
    pub fn clear_observed(&self) -> Option<SessionId> {
        self.lock().observed.take()
    }

    /// The session whose push events are currently applied.
    pub fn observed_session(&self) -> Option<SessionId> {
        self.lock().observed.clone()
    }

    /// A copy of the entry stored under `key`.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.lock().entries.get(key).cloned()
    }

    /// Replace the entry under `key` wholesale.
    ///
    /// A value whose variant does not match the key is refused and logged.
    pub fn set_entry(&self, key: CacheKey, value: CacheValue, origin: EntryOrigin) {
        self.transaction(|tx| tx.put(key, value, origin));
    }

    /// Mark the entry under `key` stale and queue a refetch.
    ///
    /// Works for keys that have no entry yet; the refetch then creates it.
    pub fn invalidate(&self, key: CacheKey) {
        self.transaction(|tx| tx.invalidate(key));
    }

    /// Returns `true` if the entry is missing, invalidated, or older than
    /// the configured stale time.
    pub fn is_stale(&self, key: &CacheKey) -> bool {
        let inner = self.lock();
        let Some(entry) = inner.entries.get(key) else {
            return true;
        };
        if entry.invalidated {
            return true;
        }
        let age = Utc::now().signed_duration_since(entry.updated_at);
        age.to_std().map_or(false, |age| age >= self.config.stale_time)
    }

    /// Current statistics of a session.
    pub fn statistics(&self, session_id: &str) -> Option<SessionStatistics> {
        match self.entry(&CacheKey::Statistics(session_id.to_string()))?.value {
            CacheValue::Statistics(stats) => Some(stats),
            _ => None,
        }
    }

    /// Current details of a session.
    pub fn details(&self, session_id: &str) -> Option<SessionDetails> {
        match self.entry(&CacheKey::Details(session_id.to_string()))?.value {
            CacheValue::Details(details) => Some(details),
            _ => None,
        }
    }

    /// Current candidate progress of a session.
    pub fn progress(&self, session_id: &str) -> Option<Vec<CandidateProgress>> {
        match self.entry(&CacheKey::Progress(session_id.to_string()))?.value {
            CacheValue::Progress(progress) => Some(progress),
            _ => None,
        }
    }

    /// Current dashboard metrics.
    pub fn dashboard(&self) -> Option<DashboardMetrics> {
        match self.entry(&CacheKey::Dashboard)?.value {
            CacheValue::Dashboard(metrics) => Some(metrics),
            _ => None,
        }
    }

    /// Receive a [`StoreChange`] for every committed write or invalidation.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Run `f` against the entries under one lock and commit its changes
    /// atomically.
    ///
    /// Notifications and refetch requests are sent after the lock is
    /// released, once per touched key, in the order the changes were made.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut StoreTxn<'_>) -> R) -> R {
        let (result, changes) = {
            let mut inner = self.lock();
            let mut tx = StoreTxn {
                inner: &mut inner,
                changes: Vec::new(),
                now: Utc::now(),
            };
            let result = f(&mut tx);
            (result, tx.changes)
        };

        for change in changes {
            if change.kind == ChangeKind::Invalidated && self.refetch_tx.send(change.key.clone()).is_err() {
                debug!(key = ?change.key, "refetch receiver dropped");
            }
            // No subscribers is fine.
            let _ = self.changes.send(change);
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        crate::sync::lock(&self.inner)
    }
}

impl std::fmt::Debug for SessionStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("SessionStateStore")
            .field("entries", &inner.entries.len())
            .field("observed", &inner.observed)
            .finish()
    }
}

/// Mutable view of the store inside [`SessionStateStore::transaction`].
pub struct StoreTxn<'a> {
    inner: &'a mut StoreInner,
    changes: Vec<StoreChange>,
    now: DateTime<Utc>,
}

impl StoreTxn<'_> {
    /// The observed session.
    pub fn observed(&self) -> Option<&str> {
        self.inner.observed.as_deref()
    }

    /// The entry under `key`.
    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.inner.entries.get(key)
    }

    /// Replace the entry under `key` wholesale and clear its invalidation.
    pub fn put(&mut self, key: CacheKey, value: CacheValue, origin: EntryOrigin) {
        if !value.fits(&key) {
            warn!(?key, "refusing cache write with mismatched value type");
            return;
        }
        self.inner.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                origin,
                updated_at: self.now,
                invalidated: false,
            },
        );
        self.changes.push(StoreChange {
            key,
            kind: ChangeKind::Written,
        });
    }

    /// Mark `key` stale and queue a refetch once the transaction commits.
    pub fn invalidate(&mut self, key: CacheKey) {
        if let Some(entry) = self.inner.entries.get_mut(&key) {
            entry.invalidated = true;
        }
        self.changes.push(StoreChange {
            key,
            kind: ChangeKind::Invalidated,
        });
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

    fn stats(active: u32) -> SessionStatistics {
        SessionStatistics {
            scheduled: 5 - active,
            absent: 0,
            active,
            submitted: 0,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn observe_queues_initial_pull_for_all_session_keys() {
        let (store, mut refetch) = SessionStateStore::new(StoreConfig::new());
        assert!(store.observe("s-1").is_none());

        let mut keys = Vec::new();
        while let Ok(key) = refetch.try_recv() {
            keys.push(key);
        }
        assert_eq!(keys, CacheKey::session_keys("s-1").to_vec());
        assert_eq!(store.observed_session().as_deref(), Some("s-1"));
        assert_eq!(store.observe("s-2").as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn set_entry_replaces_and_clears_invalidation() {
        let (store, _refetch) = SessionStateStore::new(StoreConfig::new());
        let key = CacheKey::Statistics("s".into());

        store.set_entry(key.clone(), CacheValue::Statistics(stats(1)), EntryOrigin::Pull);
        store.invalidate(key.clone());
        assert!(store.entry(&key).unwrap().invalidated);

        store.set_entry(key.clone(), CacheValue::Statistics(stats(2)), EntryOrigin::Push);
        let entry = store.entry(&key).unwrap();
        assert!(!entry.invalidated);
        assert_eq!(entry.origin, EntryOrigin::Push);
        assert_eq!(store.statistics("s").unwrap().active, 2);
    }

    #[tokio::test]
    async fn mismatched_value_is_refused() {
        let (store, _refetch) = SessionStateStore::new(StoreConfig::new());
        let key = CacheKey::Details("s".into());
        store.set_entry(key.clone(), CacheValue::Statistics(stats(1)), EntryOrigin::Pull);
        assert!(store.entry(&key).is_none());
    }

    #[tokio::test]
    async fn zero_stale_time_makes_entries_stale_immediately() {
        let (store, _refetch) = SessionStateStore::new(StoreConfig::new());
        let key = CacheKey::Statistics("s".into());
        assert!(store.is_stale(&key));
        store.set_entry(key.clone(), CacheValue::Statistics(stats(0)), EntryOrigin::Pull);
        assert!(store.is_stale(&key));
    }

    #[tokio::test]
    async fn long_stale_time_keeps_entries_fresh_until_invalidated() {
        let config = StoreConfig::new().with_stale_time(Duration::from_secs(3600));
        let (store, _refetch) = SessionStateStore::new(config);
        let key = CacheKey::Statistics("s".into());
        store.set_entry(key.clone(), CacheValue::Statistics(stats(0)), EntryOrigin::Pull);
        assert!(!store.is_stale(&key));
        store.invalidate(key.clone());
        assert!(store.is_stale(&key));
    }

    #[tokio::test]
    async fn transaction_notifies_after_commit_in_order() {
        let (store, mut refetch) = SessionStateStore::new(StoreConfig::new());
        let mut changes = store.subscribe();

        store.transaction(|tx| {
            tx.put(
                CacheKey::Statistics("s".into()),
                CacheValue::Statistics(stats(1)),
                EntryOrigin::Push,
            );
            tx.invalidate(CacheKey::Statistics("s".into()));
        });

        assert_eq!(
            changes.try_recv().unwrap(),
            StoreChange {
                key: CacheKey::Statistics("s".into()),
                kind: ChangeKind::Written
            }
        );
        assert_eq!(changes.try_recv().unwrap().kind, ChangeKind::Invalidated);
        assert_eq!(refetch.try_recv().unwrap(), CacheKey::Statistics("s".into()));
        assert!(refetch.try_recv().is_err());
    }
}
