//! Coalescing of high-frequency dashboard updates.
//!
//! The event stream can deliver many category updates per second. Writing
//! each one to the store would wake every reader each time, so
//! [`UpdateBatcher`] keeps the latest value per [`MetricCategory`] and writes
//! them all at once when the batching window closes.
//!
//! Each category update fully supersedes the previous one, so within a
//! window only the last value per category survives. A full dashboard
//! replacement supersedes everything pending.
//!
//! Every store write happens under the batcher lock, so writes reach the
//! store in the order they were handed to the batcher.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::{DashboardMetrics, MetricCategory};
use crate::store::{CacheKey, CacheValue, EntryOrigin, SessionStateStore};
use crate::sync::lock;

/// Default batching window.
const DEFAULT_WINDOW: Duration = Duration::from_millis(200);

/// Configuration for an [`UpdateBatcher`].
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Time between the first recorded update and the flush that writes it.
    ///
    /// Defaults to **200 ms** (at most five dashboard writes per second).
    pub window: Duration,
}

impl BatchConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            window: DEFAULT_WINDOW,
        }
    }

    /// Set the batching window.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// At most one pending value per metric category.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchedDelta {
    pub system: Option<serde_json::Value>,
    pub business: Option<serde_json::Value>,
    pub connection: Option<serde_json::Value>,
    pub performance: Option<serde_json::Value>,
}

impl BatchedDelta {
    /// Store `value` for `category`, dropping any earlier pending value.
    pub fn record(&mut self, category: MetricCategory, value: serde_json::Value) {
        let slot = match category {
            MetricCategory::System => &mut self.system,
            MetricCategory::Business => &mut self.business,
            MetricCategory::Connection => &mut self.connection,
            MetricCategory::Performance => &mut self.performance,
        };
        *slot = Some(value);
    }

    /// Returns `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.system.is_none()
            && self.business.is_none()
            && self.connection.is_none()
            && self.performance.is_none()
    }

    /// Overwrite the categories present in this delta.
    pub fn apply_to(self, metrics: &mut DashboardMetrics) {
        let pending = [
            (MetricCategory::System, self.system),
            (MetricCategory::Business, self.business),
            (MetricCategory::Connection, self.connection),
            (MetricCategory::Performance, self.performance),
        ];
        for (category, value) in pending {
            if let Some(value) = value {
                metrics.set(category, value);
            }
        }
    }
}

struct BatchInner {
    pending: BatchedDelta,
    scheduled: Option<JoinHandle<()>>,
    closed: bool,
}

/// Coalesces dashboard category updates into one store write per window.
///
/// Recording schedules a flush on the Tokio runtime, so [`record`](Self::record)
/// must be called from within a runtime.
#[derive(Clone)]
pub struct UpdateBatcher {
    store: Arc<SessionStateStore>,
    window: Duration,
    inner: Arc<StdMutex<BatchInner>>,
}

impl UpdateBatcher {
    /// Create a batcher that writes into `store`.
    pub fn new(store: Arc<SessionStateStore>, config: BatchConfig) -> Self {
        Self {
            store,
            window: config.window,
            inner: Arc::new(StdMutex::new(BatchInner {
                pending: BatchedDelta::default(),
                scheduled: None,
                closed: false,
            })),
        }
    }

    /// Record the latest value for `category`.
    ///
    /// Schedules a flush one window from now unless one is already pending.
    /// After [`shutdown`](Self::shutdown) the value is written immediately.
    pub fn record(&self, category: MetricCategory, value: serde_json::Value) {
        let mut inner = lock(&self.inner);
        inner.pending.record(category, value);

        if inner.closed {
            let delta = std::mem::take(&mut inner.pending);
            write(&self.store, delta);
            return;
        }

        if inner.scheduled.is_none() {
            let batcher = self.clone();
            inner.scheduled = Some(tokio::spawn(async move {
                tokio::time::sleep(batcher.window).await;
                batcher.flush_scheduled();
            }));
        }
    }

    /// Write everything pending now, cancelling the scheduled flush.
    pub fn flush(&self) {
        let mut inner = lock(&self.inner);
        if let Some(task) = inner.scheduled.take() {
            task.abort();
        }
        let delta = std::mem::take(&mut inner.pending);
        write(&self.store, delta);
    }

    /// Replace the whole dashboard with `metrics`.
    ///
    /// Pending category updates are older than `metrics` and are discarded,
    /// together with the scheduled flush.
    pub fn replace(&self, metrics: DashboardMetrics) {
        let mut inner = lock(&self.inner);
        if let Some(task) = inner.scheduled.take() {
            task.abort();
        }
        if !inner.pending.is_empty() {
            debug!("full dashboard replace supersedes pending category updates");
            inner.pending = BatchedDelta::default();
        }
        self.store.set_entry(
            CacheKey::Dashboard,
            CacheValue::Dashboard(metrics),
            EntryOrigin::Stream,
        );
    }

    /// Force a final flush and write any later update immediately.
    pub fn shutdown(&self) {
        lock(&self.inner).closed = true;
        self.flush();
        debug!("update batcher shut down");
    }

    /// A copy of the values waiting for the next flush.
    pub fn pending(&self) -> BatchedDelta {
        lock(&self.inner).pending.clone()
    }

    /// Called from the scheduled task; must not abort itself.
    fn flush_scheduled(&self) {
        let mut inner = lock(&self.inner);
        inner.scheduled = None;
        let delta = std::mem::take(&mut inner.pending);
        write(&self.store, delta);
    }
}

impl std::fmt::Debug for UpdateBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("UpdateBatcher")
            .field("window", &self.window)
            .field("pending", &!inner.pending.is_empty())
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Merge `delta` into the dashboard entry in a single store write.
fn write(store: &SessionStateStore, delta: BatchedDelta) {
    if delta.is_empty() {
        return;
    }
    store.transaction(|tx| {
        let mut metrics = match tx.get(&CacheKey::Dashboard).map(|e| &e.value) {
            Some(CacheValue::Dashboard(metrics)) => metrics.clone(),
            _ => DashboardMetrics::default(),
        };
        delta.apply_to(&mut metrics);
        tx.put(
            CacheKey::Dashboard,
            CacheValue::Dashboard(metrics),
            EntryOrigin::Stream,
        );
    });
    debug!("flushed batched dashboard update");
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
    use crate::store::{ChangeKind, StoreConfig};
    use serde_json::json;

    fn setup() -> (Arc<SessionStateStore>, UpdateBatcher) {
        let (store, _refetch) = SessionStateStore::new(StoreConfig::new());
        let batcher = UpdateBatcher::new(Arc::clone(&store), BatchConfig::new());
        (store, batcher)
    }

    fn dashboard_writes(rx: &mut tokio::sync::broadcast::Receiver<crate::store::StoreChange>) -> usize {
        let mut count = 0;
        while let Ok(change) = rx.try_recv() {
            if change.key == CacheKey::Dashboard && change.kind == ChangeKind::Written {
                count += 1;
            }
        }
        count
    }

    #[test]
    fn delta_keeps_last_value_per_category() {
        let mut delta = BatchedDelta::default();
        delta.record(MetricCategory::System, json!(1));
        delta.record(MetricCategory::Business, json!("b"));
        delta.record(MetricCategory::System, json!(2));

        let mut metrics = DashboardMetrics::default();
        metrics.set(MetricCategory::Performance, json!("kept"));
        delta.apply_to(&mut metrics);

        assert_eq!(metrics.system, Some(json!(2)));
        assert_eq!(metrics.business, Some(json!("b")));
        assert_eq!(metrics.performance, Some(json!("kept")));
        assert!(metrics.connection.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn updates_within_one_window_produce_one_write() {
        let (store, batcher) = setup();
        let mut changes = store.subscribe();

        batcher.record(MetricCategory::System, json!({ "cpu": 10 }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        batcher.record(MetricCategory::System, json!({ "cpu": 90 }));
        batcher.record(MetricCategory::Connection, json!({ "open": 3 }));
        assert_eq!(dashboard_writes(&mut changes), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(dashboard_writes(&mut changes), 1);
        let metrics = store.dashboard().unwrap();
        assert_eq!(metrics.system, Some(json!({ "cpu": 90 })));
        assert_eq!(metrics.connection, Some(json!({ "open": 3 })));
        assert!(batcher.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn next_window_starts_after_flush() {
        let (store, batcher) = setup();
        let mut changes = store.subscribe();

        batcher.record(MetricCategory::Business, json!(1));
        tokio::time::sleep(Duration::from_millis(250)).await;
        batcher.record(MetricCategory::Business, json!(2));
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(dashboard_writes(&mut changes), 2);
        assert_eq!(store.dashboard().unwrap().business, Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_forces_pending_flush() {
        let (store, batcher) = setup();
        let mut changes = store.subscribe();

        batcher.record(MetricCategory::Performance, json!({ "p99": 12 }));
        batcher.shutdown();

        assert_eq!(dashboard_writes(&mut changes), 1);
        assert_eq!(
            store.dashboard().unwrap().performance,
            Some(json!({ "p99": 12 }))
        );

        // The aborted timer must not produce a second, empty write.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(dashboard_writes(&mut changes), 0);

        batcher.record(MetricCategory::System, json!("late"));
        assert_eq!(dashboard_writes(&mut changes), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_replace_discards_older_pending_updates() {
        let (store, batcher) = setup();
        let mut changes = store.subscribe();

        batcher.record(MetricCategory::System, json!({ "cpu": 1 }));
        batcher.record(MetricCategory::Business, json!({ "exams": 1 }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut full = DashboardMetrics::default();
        full.set(MetricCategory::System, json!({ "cpu": 99 }));
        batcher.replace(full.clone());
        assert!(batcher.pending().is_empty());
        assert_eq!(store.dashboard(), Some(full.clone()));

        // The cancelled window must not write the stale values back.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(dashboard_writes(&mut changes), 1);
        assert_eq!(store.dashboard(), Some(full));

        // Updates after the replace are batched on top of it.
        batcher.record(MetricCategory::Connection, json!({ "open": 2 }));
        tokio::time::sleep(Duration::from_millis(250)).await;
        let metrics = store.dashboard().unwrap();
        assert_eq!(metrics.system, Some(json!({ "cpu": 99 })));
        assert_eq!(metrics.connection, Some(json!({ "open": 2 })));
        assert!(metrics.business.is_none());
    }

    #[tokio::test]
    async fn flush_with_nothing_pending_does_not_write() {
        let (store, batcher) = setup();
        let mut changes = store.subscribe();
        batcher.flush();
        assert_eq!(dashboard_writes(&mut changes), 0);
        assert!(store.dashboard().is_none());
    }
}
