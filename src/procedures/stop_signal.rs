//! Cooperative Stop Signal
//!
//! A shared flag for asking the procedure task to stop. The task polls it at step
//! boundaries and races it against every timed wait, so a stop takes effect as
//! soon as the task is suspended rather than at the end of the current tick.
//!
//! Backed by a `tokio::sync::watch` channel: setting the flag and waking waiters
//! is one operation, and a waiter that subscribes after the flag was set sees it
//! immediately (no lost wake-ups).
//!
//! # Example
//!
//! ```rust,ignore
//! let stop = StopSignal::new();
//! let waiter = stop.clone();
//!
//! tokio::spawn(async move {
//!     if waiter.sleep(Duration::from_secs(10)).await.is_stopped() {
//!         tracing::info!("woken early");
//!     }
//! });
//!
//! stop.trigger("operator request");
//! ```

use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

/// How a cancellable wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full duration elapsed
    Elapsed,
    /// The stop signal fired first
    Stopped,
}

impl WaitOutcome {
    /// True when the wait was cut short
    pub fn is_stopped(self) -> bool {
        self == WaitOutcome::Stopped
    }
}

/// Shared, cloneable stop flag.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
    reason: Arc<RwLock<Option<String>>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// A lowered flag
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            reason: Arc::new(RwLock::new(None)),
        }
    }

    /// Raise the flag and wake every waiter.
    pub fn trigger(&self, reason: impl Into<String>) {
        if let Ok(mut r) = self.reason.write() {
            *r = Some(reason.into());
        }
        self.tx.send_replace(true);
    }

    /// Whether the flag is up
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Why the flag was raised, if it was
    pub fn reason(&self) -> Option<String> {
        self.reason.read().ok().and_then(|r| r.clone())
    }

    /// Lower the flag for the next run.
    pub fn reset(&self) {
        self.tx.send_replace(false);
        if let Ok(mut r) = self.reason.write() {
            *r = None;
        }
    }

    /// Resolve once the flag is raised (immediately if it already is).
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `duration` unless the flag is raised first.
    pub async fn sleep(&self, duration: Duration) -> WaitOutcome {
        if self.is_triggered() {
            return WaitOutcome::Stopped;
        }
        tokio::select! {
            biased;
            _ = self.triggered() => WaitOutcome::Stopped,
            _ = sleep(duration) => {
                if self.is_triggered() {
                    WaitOutcome::Stopped
                } else {
                    WaitOutcome::Elapsed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn trigger_and_reset() {
        let stop = StopSignal::new();
        assert!(!stop.is_triggered());

        stop.trigger("operator");
        assert!(stop.is_triggered());
        assert_eq!(stop.reason(), Some("operator".to_string()));

        stop.reset();
        assert!(!stop.is_triggered());
        assert_eq!(stop.reason(), None);
    }

    #[test]
    fn triggered_wakes_pending_waiter() {
        let stop = StopSignal::new();
        let mut waiter = tokio_test::task::spawn(stop.triggered());

        tokio_test::assert_pending!(waiter.poll());
        stop.trigger("operator");
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_runs_to_completion_without_trigger() {
        let stop = StopSignal::new();
        let start = Instant::now();
        assert_eq!(stop.sleep(Duration::from_secs(1)).await, WaitOutcome::Elapsed);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_wakes_sleeper_immediately() {
        let stop = StopSignal::new();
        let remote = stop.clone();
        let start = Instant::now();

        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            remote.trigger("test");
        });

        assert_eq!(stop.sleep(Duration::from_secs(10)).await, WaitOutcome::Stopped);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn already_triggered_returns_without_waiting() {
        let stop = StopSignal::new();
        stop.trigger("early");
        assert!(stop.sleep(Duration::from_secs(3600)).await.is_stopped());
        stop.triggered().await;
    }
}
