//! Dependency-completion barrier for plan execution.
//!
//! Each operation of a plan owns one `watch` slot. Finishing an operation
//! publishes its completion into the slot; an operation with prerequisites
//! waits on the slots of those prerequisites before it may be dispatched.

use tokio::sync::watch;

/// How an operation finished, as seen by the operations waiting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The operation reached its target state (applied or no-op).
    Succeeded,
    /// The operation failed or was skipped.
    Blocked,
    /// The operation was never started because of a cancellation.
    Cancelled,
}

/// One completion slot per operation of a plan.
#[derive(Debug)]
pub struct DependencyBarrier {
    slots: Vec<watch::Sender<Option<Completion>>>,
}

impl DependencyBarrier {
    /// Creates a barrier for a plan with `len` operations.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| watch::channel(None).0).collect(),
        }
    }

    /// Publishes the completion of an operation.
    ///
    /// The first completion wins; later calls for the same slot are ignored.
    pub fn complete(&self, index: usize, completion: Completion) {
        if let Some(slot) = self.slots.get(index) {
            slot.send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                *current = Some(completion);
                true
            });
        }
    }

    /// Returns the completion of an operation, if it has finished.
    #[must_use]
    pub fn completion(&self, index: usize) -> Option<Completion> {
        self.slots.get(index).and_then(|slot| *slot.borrow())
    }

    /// Waits until every listed prerequisite has finished.
    ///
    /// # Errors
    ///
    /// Returns the index of the first prerequisite (in list order) that did
    /// not succeed. Indices outside the plan count as blocked.
    pub async fn wait_for(&self, prerequisites: &[usize]) -> Result<(), usize> {
        for &index in prerequisites {
            let Some(slot) = self.slots.get(index) else {
                return Err(index);
            };
            let mut rx = slot.subscribe();
            let completion = match rx.wait_for(Option::is_some).await {
                Ok(value) => *value,
                Err(_) => None,
            };
            if completion != Some(Completion::Succeeded) {
                return Err(index);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waits_until_prerequisites_complete() {
        let barrier = Arc::new(DependencyBarrier::new(3));
        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.wait_for(&[0, 1]).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        barrier.complete(1, Completion::Succeeded);
        barrier.complete(0, Completion::Succeeded);
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_reports_blocking_prerequisite() {
        let barrier = DependencyBarrier::new(2);
        barrier.complete(0, Completion::Succeeded);
        barrier.complete(1, Completion::Blocked);

        assert_eq!(barrier.wait_for(&[0, 1]).await, Err(1));
        assert_eq!(barrier.wait_for(&[5]).await, Err(5));
    }

    #[test]
    fn test_first_completion_wins() {
        let barrier = DependencyBarrier::new(1);
        assert_eq!(barrier.completion(0), None);
        barrier.complete(0, Completion::Blocked);
        barrier.complete(0, Completion::Succeeded);
        assert_eq!(barrier.completion(0), Some(Completion::Blocked));
    }
}
