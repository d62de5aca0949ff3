//! One-shot completion latches and serialized job queues. A [`Deferred`]
//! starts pending and settles exactly once, either resolved with a value or
//! rejected with a named error; every awaiter observes the same outcome.
//! Replacing a pending latch requires rejecting it first so awaiters fail
//! deterministically instead of hanging.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{Error, Result};

pub struct Deferred<T: Clone> {
    tx: Option<oneshot::Sender<Result<T>>>,
    rx: Shared<oneshot::Receiver<Result<T>>>,
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Some(tx),
            rx: rx.shared(),
        }
    }

    /// Whether neither `resolve` nor `reject` has been called yet.
    pub fn is_pending(&self) -> bool {
        self.tx.is_some()
    }

    /// Settle with a value. Returns `false` if the latch was already
    /// settled.
    pub fn resolve(&mut self, value: T) -> bool {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(Ok(value));
                true
            }
            None => false,
        }
    }

    /// Settle with an error. Returns `false` if the latch was already
    /// settled.
    pub fn reject(&mut self, reason: Error) -> bool {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(Err(reason));
                true
            }
            None => false,
        }
    }

    /// A future observing the settlement. Can be taken any number of times,
    /// before or after the latch settles.
    pub fn wait(&self) -> impl Future<Output = Result<T>> {
        let rx = self.rx.clone();
        async move {
            match rx.await {
                Ok(settled) => settled,
                // The sender half was dropped without settling; treat it
                // like a rejection so awaiters never hang.
                Err(_) => Err(Error::unknown("latch dropped")),
            }
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// FIFO serialization of async jobs sharing one key. Holders run their job
/// while keeping the guard; the next job in line proceeds when the guard
/// drops.
#[derive(Clone, Default)]
pub struct ProcessingQueue {
    lock: Arc<AsyncMutex<()>>,
}

impl ProcessingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.lock.clone().lock_owned().await
    }
}

impl fmt::Debug for ProcessingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingQueue").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_reaches_all_waiters() {
        let mut latch = Deferred::new();
        let first = latch.wait();
        let second = latch.wait();
        assert!(latch.resolve(7u32));
        assert_eq!(first.await.unwrap(), 7);
        assert_eq!(second.await.unwrap(), 7);
        // settling twice is a no-op
        assert!(!latch.resolve(9));
    }

    #[tokio::test]
    async fn reject_is_observed() {
        let mut latch: Deferred<()> = Deferred::new();
        let waiter = latch.wait();
        assert!(latch.reject(Error::navigation_canceled()));
        let err = waiter.await.unwrap_err();
        assert_eq!(err.code(), "unknown error");
    }

    #[tokio::test]
    async fn waiting_after_settlement_resolves_immediately() {
        let mut latch = Deferred::new();
        latch.resolve("done".to_string());
        assert_eq!(latch.wait().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn queue_serializes_jobs() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let queue = ProcessingQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = queue.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = queue.acquire().await;
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                // nobody else ran while we held the guard
                assert_eq!(counter.load(Ordering::SeqCst), seen + 1);
                let _ = i;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
