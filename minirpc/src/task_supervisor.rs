use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct TaskSupervisorState {
    /// Number of spawned tasks that have not finished yet.
    running: AtomicU64,
    /// Cancelled when stop is requested.
    stop: CancellationToken,
    /// Cancelled once `running` drops to zero after a stop.
    stopped: CancellationToken,
}

/// Tracks the background loops of one component (accept loop, connection
/// handlers, heartbeat, health sweep, cache poller) and stops them together.
///
/// Stopping is cooperative: [`stop`](Self::stop) cancels a shared token and
/// every supervised loop observes it at its next await point. Tasks that are
/// still running are waited for with [`join_timeout`](Self::join_timeout).
///
/// # Examples
///
/// ```rust,no_run
/// # use minirpc::TaskSupervisor;
/// # use std::time::Duration;
/// # #[tokio::main]
/// # async fn main() {
/// let supervisor = TaskSupervisor::create();
/// supervisor.spawn(async {
///     tokio::time::sleep(Duration::from_secs(3600)).await;
/// });
/// supervisor.stop();
/// assert!(supervisor.join_timeout(Duration::from_secs(1)).await);
/// # }
/// ```
#[derive(Debug)]
pub struct TaskSupervisor(Arc<TaskSupervisorState>);

/// Keeps the supervisor's running count raised while alive.
#[derive(Debug)]
pub struct TaskSupervisorGuard(Arc<TaskSupervisorState>);

impl TaskSupervisorState {
    fn finish_async_task(&self) {
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        if running == 0 {
            self.stopped.cancel();
        }
    }
}

impl TaskSupervisor {
    /// Creates a supervisor with one internal guard that is released when
    /// stop is requested, so `all_stopped` cannot fire before `stop`.
    #[must_use]
    pub fn create() -> Self {
        let supervisor = Self(Arc::default());

        let guard = supervisor.start_async_task();
        tokio::spawn(async move {
            guard.stopped().await;
        });

        supervisor
    }

    pub fn stop(&self) {
        self.0.stop.cancel();
    }

    /// A child of the stop token, for tasks that want to select on it
    /// without holding the supervisor.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.0.stop.child_token()
    }

    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    /// Waits for every supervised task to finish, giving up after `timeout`.
    ///
    /// Returns `true` if all tasks finished in time.
    pub async fn join_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.all_stopped()).await.is_ok()
    }

    #[must_use]
    pub fn start_async_task(&self) -> TaskSupervisorGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskSupervisorGuard(self.0.clone())
    }

    /// Spawns `fut` as a supervised task. The future is dropped at its next
    /// await point once stop is requested.
    pub fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<()>
    where
        F: Future + Send + 'static,
    {
        let guard = self.start_async_task();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.stopped() => {}
                _ = fut => {}
            }
        })
    }

    /// Spawns `fut` as a supervised task that runs to completion even after
    /// stop is requested. Used for connection handlers which check the stop
    /// token themselves between requests.
    pub fn spawn_unbounded<F>(&self, fut: F) -> tokio::task::JoinHandle<()>
    where
        F: Future + Send + 'static,
    {
        let guard = self.start_async_task();
        tokio::spawn(async move {
            let _ = fut.await;
            drop(guard);
        })
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskSupervisorGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskSupervisorGuard {
    fn drop(&mut self) {
        self.0.finish_async_task();
    }
}
