//! Cooperative cancellation flag.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// A flag for cooperative cancellation.
///
/// Cancellation is idempotent; only the first reason is kept. Work checks the
/// flag between operations and never interrupts an operation in flight.
#[derive(Debug, Default)]
pub struct CancellationFlag {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    notify: Notify,
}

impl CancellationFlag {
    /// Creates a flag that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with a reason.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.reason.write() = Some(reason.into());
            self.notify.notify_waiters();
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Waits until cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration`, returning early with `true` if cancelled.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => self.is_cancelled(),
            () = self.cancelled() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_reason_wins() {
        let flag = CancellationFlag::new();
        assert!(!flag.is_cancelled());

        flag.cancel("operator request");
        flag.cancel("second");
        assert!(flag.is_cancelled());
        assert_eq!(flag.reason().as_deref(), Some("operator request"));
    }

    #[tokio::test]
    async fn test_sleep_wakes_on_cancel() {
        let flag = Arc::new(CancellationFlag::new());
        let sleeper = {
            let flag = Arc::clone(&flag);
            tokio::spawn(async move { flag.sleep(Duration::from_secs(60)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.cancel("shutdown");
        assert!(sleeper.await.unwrap());
    }

    #[test]
    fn test_cancelled_resolves_immediately_once_set() {
        let flag = CancellationFlag::new();
        flag.cancel("done");

        tokio_test::block_on(flag.cancelled());
        assert!(tokio_test::block_on(flag.sleep(Duration::from_secs(60))));
    }
}
