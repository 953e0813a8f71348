//! How push events and pulls meet in the [`SessionStateStore`].
//!
//! Push events are merged optimistically and then the touched keys are
//! invalidated, so a background pull corrects anything a dropped or
//! reordered event got wrong:
//!
//! 1. statistics are replaced wholesale with the event's statistics;
//! 2. the candidate is replaced by id in the details list, or appended;
//! 3. both keys are invalidated, which queues their refetch.
//!
//! Events for any session other than the observed one are ignored. An event
//! that finds no entry to merge into only invalidates; entries are never
//! originated from push data.
//!
//! [`Reconciler`] is the worker that drains the refetch queue through a
//! [`SessionApi`].

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::SessionApi;
use crate::protocol::{
    CandidateEventPayload, CandidateRecord, DashboardMetrics, ServerMessage, SessionStatistics,
};
use crate::store::{CacheKey, CacheValue, EntryOrigin, SessionStateStore, StoreTxn};

/// What applying one event did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The event does not concern the observed session or the cache.
    Ignored,
    /// Merged into existing entries; a reconciling refetch is queued.
    Merged,
    /// Nothing to merge into; a refetch is queued instead.
    Refetch,
    /// Keys invalidated without a merge.
    Invalidated,
    /// The dashboard entry was written.
    Written,
    /// Dropped because a more authoritative source owns the entry.
    Superseded,
}

/// Apply one message from the bidirectional channel.
pub fn apply_server_message(store: &SessionStateStore, msg: &ServerMessage) -> MergeOutcome {
    match msg {
        ServerMessage::CandidateLogin(event) | ServerMessage::CandidateLogout(event) => {
            apply_candidate_event(store, event)
        }
        ServerMessage::CandidateUpdate(update) => store.transaction(|tx| {
            if !observes(tx, &update.session_id) {
                return MergeOutcome::Ignored;
            }
            merge(tx, &update.session_id, None, &update.candidate)
        }),
        ServerMessage::SessionUpdate(update) => store.transaction(|tx| {
            if !observes(tx, &update.session_id) {
                return MergeOutcome::Ignored;
            }
            tx.invalidate(CacheKey::Statistics(update.session_id.clone()));
            tx.invalidate(CacheKey::Details(update.session_id.clone()));
            MergeOutcome::Invalidated
        }),
        ServerMessage::ExamStarted(activity) | ServerMessage::ExamAnswerSubmitted(activity) => {
            store.transaction(|tx| {
                if !observes(tx, &activity.session_id) {
                    return MergeOutcome::Ignored;
                }
                tx.invalidate(CacheKey::Progress(activity.session_id.clone()));
                MergeOutcome::Invalidated
            })
        }
        ServerMessage::MetricsUpdate(metrics) => apply_metrics_update(store, metrics),
        _ => MergeOutcome::Ignored,
    }
}

/// Merge a `candidate:login` / `candidate:logout` event.
pub fn apply_candidate_event(
    store: &SessionStateStore,
    event: &CandidateEventPayload,
) -> MergeOutcome {
    store.transaction(|tx| {
        if !observes(tx, &event.session_id) {
            debug!(session_id = %event.session_id, "ignoring candidate event for unobserved session");
            return MergeOutcome::Ignored;
        }
        merge(tx, &event.session_id, Some(&event.statistics), &event.candidate)
    })
}

/// Write a `metrics:update` unless the event stream already owns the
/// dashboard entry.
fn apply_metrics_update(store: &SessionStateStore, metrics: &DashboardMetrics) -> MergeOutcome {
    store.transaction(|tx| {
        if tx
            .get(&CacheKey::Dashboard)
            .is_some_and(|e| e.origin == EntryOrigin::Stream)
        {
            debug!("metrics:update superseded by the event stream");
            return MergeOutcome::Superseded;
        }
        tx.put(
            CacheKey::Dashboard,
            CacheValue::Dashboard(metrics.clone()),
            EntryOrigin::Push,
        );
        MergeOutcome::Written
    })
}

fn observes(tx: &StoreTxn<'_>, session_id: &str) -> bool {
    tx.observed() == Some(session_id)
}

/// Steps 1-3 for one session inside an open transaction.
fn merge(
    tx: &mut StoreTxn<'_>,
    session_id: &str,
    statistics: Option<&SessionStatistics>,
    candidate: &CandidateRecord,
) -> MergeOutcome {
    let stats_key = CacheKey::Statistics(session_id.to_string());
    let details_key = CacheKey::Details(session_id.to_string());
    let mut merged = false;

    if let Some(statistics) = statistics {
        if matches!(tx.get(&stats_key).map(|e| &e.value), Some(CacheValue::Statistics(_))) {
            tx.put(
                stats_key.clone(),
                CacheValue::Statistics(statistics.clone()),
                EntryOrigin::Push,
            );
            merged = true;
        }
    }

    let details = match tx.get(&details_key).map(|e| &e.value) {
        Some(CacheValue::Details(details)) => Some(details.clone()),
        _ => None,
    };
    if let Some(mut details) = details {
        if let Some(statistics) = statistics {
            details.statistics = statistics.clone();
        }
        upsert_candidate(&mut details.candidates, candidate);
        tx.put(details_key.clone(), CacheValue::Details(details), EntryOrigin::Push);
        merged = true;
    }

    tx.invalidate(stats_key);
    tx.invalidate(details_key);

    if merged {
        MergeOutcome::Merged
    } else {
        debug!(session_id, "push event raced the initial pull, refetching");
        MergeOutcome::Refetch
    }
}

/// Replace the record with the same id, or append.
fn upsert_candidate(candidates: &mut Vec<CandidateRecord>, candidate: &CandidateRecord) {
    match candidates.iter_mut().find(|c| c.id == candidate.id) {
        Some(existing) => *existing = candidate.clone(),
        None => candidates.push(candidate.clone()),
    }
}

// ── Refetch worker ──────────────────────────────────────────────────

/// Background task that answers invalidations with pulls.
///
/// Queued keys are deduplicated per burst. Keys of sessions other than the
/// observed one are skipped, as is the dashboard key, which has no pull
/// endpoint. Failed pulls are logged and left for the next invalidation.
pub struct Reconciler {
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Reconciler {
    /// Spawn the worker. Must be called from within a Tokio runtime.
    pub fn spawn(
        store: Arc<SessionStateStore>,
        api: Arc<dyn SessionApi>,
        refetch_rx: mpsc::UnboundedReceiver<CacheKey>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(reconcile_loop(store, api, refetch_rx, shutdown_rx));
        Self {
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Returns `true` while the worker is alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the worker, abandoning any in-flight pull.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(join_err) = task.await {
                warn!("reconciler terminated with join error: {join_err}");
            }
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn reconcile_loop(
    store: Arc<SessionStateStore>,
    api: Arc<dyn SessionApi>,
    mut refetch_rx: mpsc::UnboundedReceiver<CacheKey>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("reconciler started");
    loop {
        let first = tokio::select! {
            key = refetch_rx.recv() => match key {
                Some(key) => key,
                None => break,
            },
            _ = &mut shutdown_rx => break,
        };

        let mut batch = vec![first];
        while let Ok(key) = refetch_rx.try_recv() {
            if !batch.contains(&key) {
                batch.push(key);
            }
        }

        for key in batch {
            tokio::select! {
                _ = refetch(&store, api.as_ref(), key) => {}
                _ = &mut shutdown_rx => {
                    debug!("reconciler stopped mid-batch");
                    return;
                }
            }
        }
    }
    debug!("reconciler exited");
}

async fn refetch(store: &SessionStateStore, api: &dyn SessionApi, key: CacheKey) {
    let Some(session_id) = key.session_id().map(str::to_string) else {
        debug!("dashboard has no pull endpoint, skipping refetch");
        return;
    };
    if store.observed_session().as_deref() != Some(session_id.as_str()) {
        debug!(?key, "skipping refetch for unobserved session");
        return;
    }
    if !store.is_stale(&key) {
        debug!(?key, "entry still fresh, skipping refetch");
        return;
    }

    let fetched = match &key {
        CacheKey::Statistics(_) => api
            .fetch_session_statistics(&session_id)
            .await
            .map(CacheValue::Statistics),
        CacheKey::Details(_) => api
            .fetch_session_details(&session_id)
            .await
            .map(CacheValue::Details),
        CacheKey::Progress(_) => api
            .fetch_candidates_progress(&session_id)
            .await
            .map(CacheValue::Progress),
        CacheKey::Dashboard => return,
    };

    match fetched {
        // The observed session may have changed while the pull was in flight.
        Ok(value) if store.observed_session().as_deref() == Some(session_id.as_str()) => {
            debug!(?key, "refetched");
            store.set_entry(key, value, EntryOrigin::Pull);
        }
        Ok(_) => debug!(?key, "dropping refetch result for a session no longer observed"),
        Err(e) => warn!(?key, "refetch failed: {e}"),
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
    use crate::protocol::{CandidateStatus, SessionDetails, SessionUpdatePayload};
    use crate::store::StoreConfig;
    use chrono::{TimeZone, Utc};

    fn stats(scheduled: u32, active: u32) -> SessionStatistics {
        SessionStatistics {
            scheduled,
            absent: 0,
            active,
            submitted: 0,
            timestamp: Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap(),
        }
    }

    fn candidate(id: &str, status: CandidateStatus, seat: Option<&str>) -> CandidateRecord {
        CandidateRecord {
            id: id.into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            status,
            seat_number: seat.map(str::to_string),
            last_login: None,
            client: None,
            subjects: vec![],
        }
    }

    fn seeded(session: &str) -> (Arc<SessionStateStore>, mpsc::UnboundedReceiver<CacheKey>) {
        let (store, mut rx) = SessionStateStore::new(StoreConfig::new());
        store.observe(session);
        store.set_entry(
            CacheKey::Statistics(session.into()),
            CacheValue::Statistics(stats(5, 0)),
            EntryOrigin::Pull,
        );
        store.set_entry(
            CacheKey::Details(session.into()),
            CacheValue::Details(SessionDetails {
                session_id: session.into(),
                statistics: stats(5, 0),
                candidates: vec![candidate("c0", CandidateStatus::Scheduled, Some("A1"))],
            }),
            EntryOrigin::Pull,
        );
        while rx.try_recv().is_ok() {}
        (store, rx)
    }

    fn login(session: &str, record: CandidateRecord, statistics: SessionStatistics) -> CandidateEventPayload {
        CandidateEventPayload {
            session_id: session.into(),
            statistics,
            candidate: record,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn unknown_candidate_is_appended_and_keys_invalidated() {
        let (store, mut rx) = seeded("s-1");
        let outcome = apply_candidate_event(
            &store,
            &login("s-1", candidate("c1", CandidateStatus::Active, None), stats(4, 1)),
        );
        assert_eq!(outcome, MergeOutcome::Merged);

        assert_eq!(store.statistics("s-1").unwrap(), stats(4, 1));
        let details = store.details("s-1").unwrap();
        assert_eq!(details.candidates.len(), 2);
        assert_eq!(details.candidates[1].id, "c1");
        assert_eq!(details.statistics, stats(4, 1));

        let queued: Vec<CacheKey> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            queued,
            vec![CacheKey::Statistics("s-1".into()), CacheKey::Details("s-1".into())]
        );
        assert!(store.entry(&CacheKey::Statistics("s-1".into())).unwrap().invalidated);
    }

    #[test]
    fn known_candidate_is_replaced_entirely() {
        let (store, _rx) = seeded("s-1");
        apply_candidate_event(
            &store,
            &login("s-1", candidate("c0", CandidateStatus::Active, None), stats(4, 1)),
        );
        let details = store.details("s-1").unwrap();
        assert_eq!(details.candidates.len(), 1);
        assert_eq!(details.candidates[0].status, CandidateStatus::Active);
        // The old seat must not bleed through.
        assert_eq!(details.candidates[0].seat_number, None);
    }

    #[test]
    fn unobserved_session_leaves_entries_untouched() {
        let (store, mut rx) = seeded("s-1");
        let before_stats = store.entry(&CacheKey::Statistics("s-1".into()));
        let before_details = store.entry(&CacheKey::Details("s-1".into()));

        let outcome = apply_candidate_event(
            &store,
            &login("s-2", candidate("c1", CandidateStatus::Active, None), stats(4, 1)),
        );
        assert_eq!(outcome, MergeOutcome::Ignored);
        assert_eq!(store.entry(&CacheKey::Statistics("s-1".into())), before_stats);
        assert_eq!(store.entry(&CacheKey::Details("s-1".into())), before_details);
        assert!(rx.try_recv().is_err());
        assert!(store.statistics("s-2").is_none());
    }

    #[test]
    fn event_before_initial_pull_only_invalidates() {
        let (store, mut rx) = SessionStateStore::new(StoreConfig::new());
        store.observe("s-1");
        while rx.try_recv().is_ok() {}

        let outcome = apply_candidate_event(
            &store,
            &login("s-1", candidate("c1", CandidateStatus::Active, None), stats(4, 1)),
        );
        assert_eq!(outcome, MergeOutcome::Refetch);
        assert!(store.statistics("s-1").is_none());
        assert!(store.details("s-1").is_none());
        assert_eq!(rx.try_recv().unwrap(), CacheKey::Statistics("s-1".into()));
        assert_eq!(rx.try_recv().unwrap(), CacheKey::Details("s-1".into()));
    }

    #[test]
    fn session_update_and_exam_activity_invalidate() {
        let (store, mut rx) = seeded("s-1");
        let outcome = apply_server_message(
            &store,
            &ServerMessage::SessionUpdate(SessionUpdatePayload {
                session_id: "s-1".into(),
                changes: serde_json::Map::new(),
            }),
        );
        assert_eq!(outcome, MergeOutcome::Invalidated);
        assert_eq!(rx.try_recv().unwrap(), CacheKey::Statistics("s-1".into()));
        assert_eq!(rx.try_recv().unwrap(), CacheKey::Details("s-1".into()));

        let outcome = apply_server_message(
            &store,
            &ServerMessage::ExamAnswerSubmitted(crate::protocol::ExamActivityPayload {
                session_id: "s-1".into(),
                candidate_id: "c0".into(),
                timestamp: None,
            }),
        );
        assert_eq!(outcome, MergeOutcome::Invalidated);
        assert_eq!(rx.try_recv().unwrap(), CacheKey::Progress("s-1".into()));
    }

    #[test]
    fn socket_metrics_yield_to_event_stream() {
        let (store, _rx) = SessionStateStore::new(StoreConfig::new());
        let mut socket = DashboardMetrics::default();
        socket.system = Some(serde_json::json!({ "cpu": 1 }));

        assert_eq!(
            apply_server_message(&store, &ServerMessage::MetricsUpdate(socket.clone())),
            MergeOutcome::Written
        );

        let mut streamed = DashboardMetrics::default();
        streamed.system = Some(serde_json::json!({ "cpu": 2 }));
        store.set_entry(
            CacheKey::Dashboard,
            CacheValue::Dashboard(streamed.clone()),
            EntryOrigin::Stream,
        );

        assert_eq!(
            apply_server_message(&store, &ServerMessage::MetricsUpdate(socket)),
            MergeOutcome::Superseded
        );
        assert_eq!(store.dashboard().unwrap(), streamed);
    }
}
