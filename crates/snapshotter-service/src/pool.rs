//! A bounded pool of render contexts.
//!
//! The pool does not recycle context instances; it recycles *capacity*. A context
//! is opened freshly on acquire and closed on release, so no request ever sees
//! state left behind by a previous one. What is bounded is the number of contexts
//! outstanding at the same time: once the cap is reached, acquirers queue up and
//! are granted strictly in arrival order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::oneshot;

use crate::renderer::{ContextProvider, RenderContext, RenderError};

/// An error raised by [`ContextPool::acquire`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The acquire deadline elapsed before a slot was granted.
    #[error("timed out waiting for a free render context")]
    AcquireTimeout,

    /// The pool went away while the caller was queued.
    #[error("render context pool was dropped")]
    Closed,

    /// The provider failed to open a fresh context.
    #[error(transparent)]
    Provider(#[from] RenderError),
}

/// A waiter queued for a slot.
///
/// The grant sender transfers slot ownership: a successful send means the
/// outstanding count already accounts for the waiter.
struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct PoolState {
    outstanding: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

struct PoolInner {
    provider: Arc<dyn ContextProvider>,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    /// Returns a slot to the pool: hands it to the queue head, or decrements the
    /// outstanding count if nobody is waiting.
    ///
    /// Grants whose receiver is gone (timed out or canceled acquirers) fall
    /// through to the next waiter, so a slot is never lost to a dead waiter.
    fn free_slot(&self) {
        let mut state = self.state.lock().unwrap();
        Self::free_slot_locked(&mut state);
        metric!(gauge("pool.outstanding") = state.outstanding as u64);
    }

    fn free_slot_locked(state: &mut PoolState) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.grant.send(()).is_ok() {
                // Slot ownership transferred to the waiter; the count stays as is.
                return;
            }
        }
        state.outstanding -= 1;
    }

    /// Removes a timed-out waiter from the queue.
    ///
    /// If the waiter is no longer queued, a grant crossed paths with the timeout.
    /// Grants are sent while holding the state lock, so by the time we hold it
    /// the channel is decisive: either it carries the grant (the slot is ours and
    /// must be returned), or the sender was dropped after a failed send (the
    /// grantor already moved on to the next waiter).
    fn abandon_waiter(&self, id: u64, granted: &mut oneshot::Receiver<()>) {
        let mut state = self.state.lock().unwrap();
        if let Some(position) = state.waiters.iter().position(|waiter| waiter.id == id) {
            state.waiters.remove(position);
            return;
        }

        if let Ok(Some(())) = granted.try_recv() {
            Self::free_slot_locked(&mut state);
        }
    }
}

/// A bounded pool of render contexts with a FIFO wait queue.
#[derive(Clone)]
pub struct ContextPool {
    inner: Arc<PoolInner>,
}

impl ContextPool {
    /// Creates a pool that keeps at most `capacity` contexts outstanding.
    pub fn new(provider: Arc<dyn ContextProvider>, capacity: usize) -> Self {
        ContextPool {
            inner: Arc::new(PoolInner {
                provider,
                capacity: capacity.max(1),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// The maximum number of contexts outstanding at the same time.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// The number of contexts currently outstanding (including queued grants).
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().unwrap().outstanding
    }

    /// Acquires a fresh render context, waiting indefinitely for a free slot.
    pub async fn acquire(&self) -> Result<PooledContext, PoolError> {
        self.acquire_with_deadline(None).await
    }

    /// Acquires a fresh render context.
    ///
    /// If the pool is at capacity, the caller is queued behind earlier acquirers.
    /// With a `deadline`, waiting stops after that duration and the waiter leaves
    /// the queue without leaking its slot.
    pub async fn acquire_with_deadline(
        &self,
        deadline: Option<Duration>,
    ) -> Result<PooledContext, PoolError> {
        let waiter = {
            let mut state = self.inner.state.lock().unwrap();
            if state.outstanding < self.inner.capacity {
                state.outstanding += 1;
                metric!(gauge("pool.outstanding") = state.outstanding as u64);
                None
            } else {
                let (grant, granted) = oneshot::channel();
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.waiters.push_back(Waiter { id, grant });
                metric!(gauge("pool.waiting") = state.waiters.len() as u64);
                Some((id, granted))
            }
        };

        if let Some((id, mut granted)) = waiter {
            match deadline {
                None => {
                    if granted.await.is_err() {
                        return Err(PoolError::Closed);
                    }
                }
                Some(timeout) => {
                    let sleep = tokio::time::sleep(timeout);
                    tokio::pin!(sleep);

                    tokio::select! {
                        result = &mut granted => {
                            if result.is_err() {
                                return Err(PoolError::Closed);
                            }
                        }
                        _ = &mut sleep => {
                            self.inner.abandon_waiter(id, &mut granted);
                            metric!(counter("pool.acquire.timeout") += 1);
                            return Err(PoolError::AcquireTimeout);
                        }
                    }
                }
            }
        }

        match self.inner.provider.open_context().await {
            Ok(context) => Ok(PooledContext {
                context: Some(context),
                pool: Arc::clone(&self.inner),
            }),
            Err(error) => {
                self.inner.free_slot();
                Err(PoolError::Provider(error))
            }
        }
    }

    /// Releases a context back to the pool.
    ///
    /// The context is closed via the provider *before* the slot is freed, so a
    /// slot is only ever handed on once its previous context is gone. Close
    /// failures are swallowed: a provider that was shut down underneath us must
    /// not wedge the queue.
    pub async fn release(&self, mut handle: PooledContext) {
        if let Some(context) = handle.context.take() {
            if let Err(error) = self.inner.provider.close_context(context).await {
                tracing::warn!(%error, "failed to close render context");
            }
            self.inner.free_slot();
        }
    }
}

/// A live render context checked out of a [`ContextPool`].
///
/// Hand it back with [`ContextPool::release`]. Dropping it instead frees the slot
/// and closes the context in the background, as a safety net for canceled tasks.
pub struct PooledContext {
    context: Option<Box<dyn RenderContext>>,
    pool: Arc<PoolInner>,
}

impl PooledContext {
    /// The render context itself.
    pub fn context_mut(&mut self) -> &mut dyn RenderContext {
        match self.context.as_mut() {
            Some(context) => context.as_mut(),
            // `context` is only taken by `release` and `drop`, both of which
            // consume the handle.
            None => unreachable!("context already released"),
        }
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            let provider = Arc::clone(&self.pool.provider);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    provider.close_context(context).await.ok();
                });
            }
            self.pool.free_slot();
        }
    }
}
