//! A reified unit of future work.
//!
//! A [`Deferred`] is the producing half of a computation that has been promised but
//! not yet performed; a [`DeferredHandle`] is the consuming half. Any number of
//! handle clones can wait on the settlement, and all of them observe the same
//! outcome. This is what makes request deduplication correct: every caller that
//! joined an in-flight render receives the exact same shared result.

use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

/// The settled outcome observed through a [`DeferredHandle`].
///
/// Both sides are wrapped in [`Arc`]s so the one outcome can be handed to every
/// waiter without copying the payload.
pub type SettledResult<T, E> = Result<Arc<T>, Arc<E>>;

// We want a shared future here because otherwise a settlement could only be
// observed by a single waiter.
type SettlementChannel<T, E> = Shared<oneshot::Receiver<SettledResult<T, E>>>;

/// The producer settled neither way before being dropped.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("deferred value was dropped without being settled")]
pub struct Abandoned;

/// The producing half of a deferred value.
///
/// Settlement happens at most once by construction: both [`fulfil`](Self::fulfil)
/// and [`reject`](Self::reject) consume the producer, so a second settlement
/// attempt does not compile.
pub struct Deferred<T, E> {
    sender: oneshot::Sender<SettledResult<T, E>>,
}

/// A cheaply clonable handle observing the settlement of a [`Deferred`].
pub struct DeferredHandle<T, E> {
    channel: SettlementChannel<T, E>,
}

impl<T, E> Deferred<T, E> {
    /// Creates a new deferred value and a first handle observing it.
    pub fn new() -> (Deferred<T, E>, DeferredHandle<T, E>) {
        let (sender, receiver) = oneshot::channel();
        let handle = DeferredHandle {
            channel: receiver.shared(),
        };
        (Deferred { sender }, handle)
    }

    /// Settles with a success value, waking all waiters.
    ///
    /// Returns the shared value, so the producer can use it without going through
    /// a handle of its own.
    pub fn fulfil(self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        // Sending fails iff every handle is already gone; the outcome is then
        // simply unobserved.
        self.sender.send(Ok(Arc::clone(&value))).ok();
        value
    }

    /// Settles with a failure, waking all waiters.
    pub fn reject(self, error: E) -> Arc<E> {
        let error = Arc::new(error);
        self.sender.send(Err(Arc::clone(&error))).ok();
        error
    }
}

impl<T, E> DeferredHandle<T, E> {
    /// Waits for the settlement.
    ///
    /// All clones of this handle resolve to the same [`SettledResult`]. If the
    /// producer goes away without settling, this resolves to [`Abandoned`].
    pub async fn wait(&self) -> Result<SettledResult<T, E>, Abandoned> {
        self.channel.clone().await.map_err(|_canceled| Abandoned)
    }
}

impl<T, E> Clone for DeferredHandle<T, E> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        DeferredHandle {
            channel: self.channel.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_handles_observe_the_same_value() {
        let (deferred, handle) = Deferred::<String, String>::new();
        let second = handle.clone();

        let waiter = tokio::spawn(async move { second.wait().await });

        let produced = deferred.fulfil("rendered".to_owned());

        let first = handle.wait().await.unwrap().unwrap();
        let second = waiter.await.unwrap().unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &produced));
        assert_eq!(first.as_str(), "rendered");
    }

    #[tokio::test]
    async fn test_rejection_is_shared() {
        let (deferred, handle) = Deferred::<String, String>::new();
        let second = handle.clone();

        deferred.reject("boom".to_owned());

        let first = handle.wait().await.unwrap().unwrap_err();
        let second = second.wait().await.unwrap().unwrap_err();

        assert_eq!(first.as_str(), "boom");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_abandoned_producer() {
        let (deferred, handle) = Deferred::<String, String>::new();
        drop(deferred);

        assert_eq!(handle.wait().await, Err(Abandoned));
    }
}
