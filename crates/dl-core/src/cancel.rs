use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CancelSignal: cooperative cancellation with an optional deadline
// ---------------------------------------------------------------------------

/// Cancellation signal threaded from the controller down to every
/// suspension point (provider calls, git and gate subprocesses).
///
/// Long-running work `select!`s on [`cancelled`](Self::cancelled); loop
/// boundaries poll [`is_cancelled`](Self::is_cancelled). The signal fires
/// either when [`cancel`](Self::cancel) is called or when the deadline
/// passes, whichever comes first.
///
/// ```ignore
/// let cancel = CancelSignal::with_timeout(Duration::from_secs(60));
///
/// tokio::select! {
///     _ = cancel.cancelled() => { /* clean up and return */ }
///     out = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
            rx,
            deadline: None,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        let mut signal = Self::new();
        signal.deadline = Some(deadline);
        signal
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A clone that also fires at `deadline` (or earlier, if this signal
    /// already has a tighter one). The cancel flag is shared: cancelling
    /// either signal cancels both.
    pub fn limited_to(&self, deadline: Instant) -> Self {
        let mut signal = self.clone();
        signal.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        signal
    }

    /// True only when [`cancel`](Self::cancel) was called, as opposed to the
    /// deadline passing.
    pub fn is_cancel_requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Check whether cancellation was requested or the deadline passed
    /// (non-blocking).
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Request cancellation for every clone of this signal.
    pub fn cancel(&self) {
        if self
            .flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("cancellation requested");
            let _ = self.tx.send(true);
        } else {
            warn!("cancellation already requested");
        }
    }

    /// Resolves once the signal fires. Never resolves for an untriggered
    /// signal without a deadline.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut rx = self.rx.clone();
        let wait_flag = async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender lives as long as any clone; park forever.
                    std::future::pending::<()>().await;
                }
            }
        };
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = wait_flag => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => wait_flag.await,
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_signal_is_not_cancelled() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert!(signal.deadline().is_none());
    }

    #[test]
    fn cancel_sets_flag_on_clones() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        signal.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn double_cancel_is_idempotent() {
        let signal = CancelSignal::new();
        signal.cancel();
        signal.cancel();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();

        let joined = tokio::time::timeout(Duration::from_millis(200), handle).await;
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn deadline_fires_without_explicit_cancel() {
        let signal = CancelSignal::with_timeout(Duration::from_millis(20));
        let result =
            tokio::time::timeout(Duration::from_millis(500), signal.cancelled()).await;
        assert!(result.is_ok());
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn limited_clone_expires_without_cancelling_parent() {
        let parent = CancelSignal::new();
        let child = parent.limited_to(Instant::now() + Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(child.is_cancelled());
        assert!(!child.is_cancel_requested());
        assert!(!parent.is_cancelled());

        parent.cancel();
        assert!(child.is_cancel_requested());
    }

    #[tokio::test]
    async fn untriggered_signal_does_not_resolve() {
        let signal = CancelSignal::new();
        let result =
            tokio::time::timeout(Duration::from_millis(30), signal.cancelled()).await;
        assert!(result.is_err());
    }
}
