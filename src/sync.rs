//! Helpers shared by the background workers.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

/// Lock `m`, taking the guard over even if an earlier holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait up to `timeout` for a signalled `task` to exit, then abort it.
pub(crate) async fn join_or_abort(mut task: JoinHandle<()>, timeout: Duration, name: &str) {
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(join_err)) => warn!("{name} terminated with join error: {join_err}"),
        Err(_) => {
            warn!("{name} did not exit within timeout; aborting task");
            task.abort();
        }
    }
}
