//! Process-wide owner of background pollers.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// Created once at process start and handed to every queue and runner.
///
/// Cancelling the pool cancels every child token; [`PollerPool::shutdown`]
/// then waits for all tracked tasks to return.
#[derive(Clone, Default)]
pub struct PollerPool {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl PollerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled together with the pool.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn `future` on the runtime, tracked by the pool.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(future)
    }

    /// Cancel every poller and wait for in-flight work to finish.
    pub async fn shutdown(&self) {
        info!(tasks = self.tracker.len(), "Stopping pollers");
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("All pollers stopped");
    }
}
