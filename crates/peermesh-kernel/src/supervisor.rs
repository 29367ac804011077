//! Process supervision: shutdown signalling and background task tracking.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shutdown signal manager that also owns every background loop.
pub struct Supervisor {
    /// Send side of the shutdown signal.
    shutdown_tx: watch::Sender<bool>,
    /// Receive side of the shutdown signal (clonable).
    shutdown_rx: watch::Receiver<bool>,
    /// Supervised tasks, joined on shutdown.
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    /// Total panics caught at dispatch boundaries.
    panic_count: AtomicU64,
}

impl Supervisor {
    /// Create a new supervisor.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            shutdown_tx: tx,
            shutdown_rx: rx,
            tasks: Mutex::new(Vec::new()),
            panic_count: AtomicU64::new(0),
        }
    }

    /// Get a receiver that will be notified on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Trigger a graceful shutdown.
    pub fn shutdown(&self) {
        info!("Supervisor: initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Spawn a named background loop and keep its handle for [`join`](Self::join).
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.adopt(name, tokio::spawn(future));
    }

    /// Track a task spawned elsewhere.
    pub fn adopt(&self, name: &'static str, handle: JoinHandle<()>) {
        debug!(task = name, "Supervising task");
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name, handle));
    }

    /// Number of supervised tasks still running.
    pub fn running_tasks(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .count()
    }

    /// Wait for every supervised task. Tasks still running after `timeout`
    /// are aborted. Returns the number of tasks that had to be aborted.
    pub async fn join(&self, timeout: Duration) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        let deadline = tokio::time::Instant::now() + timeout;
        let mut aborted = 0;

        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "Task stopped"),
                Ok(Err(e)) if e.is_panic() => {
                    self.record_panic();
                    warn!(task = name, "Task panicked");
                }
                Ok(Err(_)) => debug!(task = name, "Task cancelled"),
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, aborting");
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        aborted
    }

    /// Record that a panic was caught.
    pub fn record_panic(&self) {
        self.panic_count.fetch_add(1, Ordering::Relaxed);
        warn!(
            total_panics = self.panic_count.load(Ordering::Relaxed),
            "Panic recorded"
        );
    }

    /// Get the total number of panics caught.
    pub fn panic_count(&self) -> u64 {
        self.panic_count.load(Ordering::Relaxed)
    }

    /// Get a health summary.
    pub fn health(&self) -> SupervisorHealth {
        SupervisorHealth {
            is_shutting_down: self.is_shutting_down(),
            panic_count: self.panic_count(),
            running_tasks: self.running_tasks(),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Health report from the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHealth {
    pub is_shutting_down: bool,
    pub panic_count: u64,
    pub running_tasks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use peermesh_wire::shutdown_requested;

    #[test]
    fn test_shutdown() {
        let supervisor = Supervisor::new();
        assert!(!supervisor.is_shutting_down());
        supervisor.shutdown();
        assert!(supervisor.is_shutting_down());
    }

    #[test]
    fn test_subscribe() {
        let supervisor = Supervisor::new();
        let rx = supervisor.subscribe();
        assert!(!*rx.borrow());
        supervisor.shutdown();
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_panic_tracking() {
        let supervisor = Supervisor::new();
        assert_eq!(supervisor.panic_count(), 0);
        supervisor.record_panic();
        supervisor.record_panic();
        assert_eq!(supervisor.panic_count(), 2);
    }

    #[tokio::test]
    async fn test_join_waits_for_cooperative_tasks() {
        let supervisor = Supervisor::new();
        for _ in 0..3 {
            let mut rx = supervisor.subscribe();
            supervisor.spawn("waiter", async move { shutdown_requested(&mut rx).await });
        }
        assert_eq!(supervisor.running_tasks(), 3);

        supervisor.shutdown();
        assert_eq!(supervisor.join(Duration::from_secs(1)).await, 0);
        assert_eq!(supervisor.running_tasks(), 0);
    }

    #[tokio::test]
    async fn test_join_aborts_stuck_task() {
        let supervisor = Supervisor::new();
        supervisor.spawn("stuck", std::future::pending());
        supervisor.shutdown();
        assert_eq!(supervisor.join(Duration::from_millis(50)).await, 1);
    }

    #[tokio::test]
    async fn test_join_counts_panics() {
        let supervisor = Supervisor::new();
        supervisor.spawn("boom", async { panic!("boom") });
        supervisor.join(Duration::from_secs(1)).await;
        let health = supervisor.health();
        assert_eq!(health.panic_count, 1);
        assert_eq!(health.running_tasks, 0);
    }
}
