//! Process-wide shutdown coordination.
//!
//! Every long-lived task registers itself with [`Shutdown`] at launch and
//! holds the returned [`TaskGuard`] for its lifetime. Any task (or the OS
//! signal handler) may trigger shutdown once; all tasks observe a single
//! broadcast and wind down at their next suspension point. `main` then
//! waits for quiescence before removing on-disk state and terminating the
//! proxy child.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown barrier shared by every task in the process.
///
/// Combines a broadcast channel (trigger observation) with a task counter
/// (quiescence detection), the two halves of a phased termination.
#[derive(Debug, Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
    active_tasks: AtomicUsize,
    reason: Mutex<Option<String>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Create a new shutdown barrier.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                rx,
                active_tasks: AtomicUsize::new(0),
                reason: Mutex::new(None),
            }),
        }
    }

    /// Register a long-lived task.
    ///
    /// Returns a guard that decrements the task counter when dropped.
    pub fn register(&self) -> TaskGuard {
        self.inner.active_tasks.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            shutdown: self.clone(),
        }
    }

    /// Trigger shutdown with a reason. Idempotent: only the first call's
    /// reason is recorded.
    pub fn trigger(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self.inner.reason.lock().expect("reason lock poisoned");
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }
        info!(%reason, "shutdown triggered");
        let _ = self.inner.tx.send(true);
    }

    /// Check whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.inner.rx.borrow()
    }

    /// The reason recorded by the first [`trigger`](Self::trigger) call.
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().expect("reason lock poisoned").clone()
    }

    /// Get a future that resolves when shutdown is triggered.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.inner.rx.clone(),
        }
    }

    /// Number of registered tasks still alive.
    pub fn active_tasks(&self) -> usize {
        self.inner.active_tasks.load(Ordering::SeqCst)
    }

    /// Wait until every registered task has exited, up to `grace_period`.
    ///
    /// Returns `true` on quiescence, `false` on timeout.
    pub async fn wait_idle(&self, grace_period: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace_period;
        loop {
            if self.active_tasks() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.active_tasks(),
                    "tasks still active after grace period"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Guard for a registered task; decrements the counter when dropped.
#[derive(Debug)]
pub struct TaskGuard {
    shutdown: Shutdown,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.shutdown
            .inner
            .active_tasks
            .fetch_sub(1, Ordering::SeqCst);
    }
}

/// Future that resolves when shutdown is triggered.
///
/// Cheap to clone; safe to hold across `select!` arms.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for the shutdown broadcast.
    pub async fn wait(mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped, treat as shutdown
                return;
            }
        }
    }

    /// Non-blocking check.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle_and_untriggered() {
        let sd = Shutdown::new();
        assert!(!sd.is_triggered());
        assert_eq!(sd.active_tasks(), 0);
        assert!(sd.reason().is_none());
    }

    #[test]
    fn guard_tracks_tasks() {
        let sd = Shutdown::new();
        {
            let _g1 = sd.register();
            let _g2 = sd.register();
            assert_eq!(sd.active_tasks(), 2);
        }
        assert_eq!(sd.active_tasks(), 0);
    }

    #[test]
    fn first_reason_wins() {
        let sd = Shutdown::new();
        sd.trigger("watcher failed");
        sd.trigger("second reason");
        assert_eq!(sd.reason().as_deref(), Some("watcher failed"));
    }

    #[tokio::test]
    async fn signal_resolves_on_trigger() {
        let sd = Shutdown::new();
        let signal = sd.signal();

        let sd2 = sd.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sd2.trigger("test");
        });

        signal.wait().await;
        assert!(sd.is_triggered());
    }

    #[tokio::test]
    async fn signal_resolves_immediately_when_already_triggered() {
        let sd = Shutdown::new();
        sd.trigger("early");
        sd.signal().wait().await;
    }

    #[tokio::test]
    async fn wait_idle_observes_guard_drop() {
        let sd = Shutdown::new();
        let guard = sd.register();

        let sd2 = sd.clone();
        let handle =
            tokio::spawn(async move { sd2.wait_idle(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);

        assert!(handle.await.expect("wait_idle task"));
    }

    #[tokio::test]
    async fn wait_idle_times_out_with_live_task() {
        let sd = Shutdown::new();
        let _guard = sd.register();
        assert!(!sd.wait_idle(Duration::from_millis(100)).await);
    }
}
