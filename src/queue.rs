//! A closeable, bounded, multi-waiter FIFO queue.
//!
//! [`AsyncQueue`] carries outbound frames toward the wire and inbound
//! messages toward the application. It supports suspending, cancellable and
//! non-blocking operation:
//!
//! - `enqueue` / `enqueue_range` suspend while the buffer is at its limit,
//!   then either fulfil the oldest waiting `dequeue` directly or append to
//!   the buffer.
//! - `dequeue` / `dequeue_with` suspend until an item arrives, the queue is
//!   closed, or a caller-supplied token fires.
//! - `try_dequeue` never suspends.
//!
//! Invariant: at most one of {buffered items, registered waiters} is
//! non-empty at any instant. All mutation happens under one internal mutex,
//! and waiter registration is atomic with respect to concurrent enqueues, so
//! wakeups cannot be lost.
//!
//! Closing is idempotent: it cancels every pending operation with
//! [`WebSocketError::Cancelled`] and makes future suspending operations fail
//! the same way. Items already buffered at close time can still be drained.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::{Result, WebSocketError};

/// Default bound on buffered items.
pub const DEFAULT_BUFFER_LIMIT: usize = 1024;

struct Shared<T> {
    buffer: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
}

/// A thread-safe FIFO queue connecting producer and consumer tasks.
///
/// See the [module docs](self) for the full contract.
pub struct AsyncQueue<T> {
    shared: Mutex<Shared<T>>,
    /// Signalled whenever a buffered item is removed, releasing enqueues
    /// waiting on the buffer limit.
    space: Notify,
    closed: CancellationToken,
    buffer_limit: usize,
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_LIMIT)
    }
}

impl<T> AsyncQueue<T> {
    /// Creates a queue that suspends enqueues once `buffer_limit` items are
    /// buffered.
    pub fn new(buffer_limit: usize) -> Self {
        Self {
            shared: Mutex::new(Shared {
                buffer: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
            space: Notify::new(),
            closed: CancellationToken::new(),
            buffer_limit,
        }
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.shared.lock().expect("queue lock").buffer.len()
    }

    /// Returns `true` when no items are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`AsyncQueue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Closes the queue, waking every pending operation with
    /// [`WebSocketError::Cancelled`]. Idempotent; returns immediately.
    pub fn close(&self) {
        self.closed.cancel();
        // Dropping the waiter senders resolves their receivers with an error,
        // but pending dequeues already observe the token; clearing here keeps
        // the waiter list from outliving the close.
        self.shared.lock().expect("queue lock").waiters.clear();
    }

    /// Adds an item, suspending while the buffer is at its limit.
    ///
    /// # Errors
    /// [`WebSocketError::Cancelled`] if the queue is closed, either before
    /// the call or while waiting for space.
    pub async fn enqueue(&self, item: T) -> Result<()> {
        if self.is_closed() {
            return Err(WebSocketError::Cancelled);
        }
        self.wait_for_space().await?;
        self.push(item);
        Ok(())
    }

    /// Adds several items in order, under a single critical section.
    ///
    /// Waits for buffer space once up front, like a single enqueue, then
    /// inserts every item atomically with respect to concurrent dequeues so
    /// the batch is never interleaved with another producer's items.
    ///
    /// # Errors
    /// [`WebSocketError::Cancelled`] if the queue is closed.
    pub async fn enqueue_range(&self, items: impl IntoIterator<Item = T>) -> Result<()> {
        if self.is_closed() {
            return Err(WebSocketError::Cancelled);
        }
        self.wait_for_space().await?;

        let mut shared = self.shared.lock().expect("queue lock");
        for item in items {
            Self::push_locked(&mut shared, item);
        }
        Ok(())
    }

    /// Removes the oldest item, suspending until one is available.
    ///
    /// # Errors
    /// [`WebSocketError::Cancelled`] if the queue is closed and empty, or
    /// closes while waiting.
    pub async fn dequeue(&self) -> Result<T> {
        self.dequeue_inner(None).await
    }

    /// Like [`AsyncQueue::dequeue`], but also resolves when `token` fires.
    ///
    /// Cancelling one pending dequeue this way does not disturb other
    /// waiters or the queue itself.
    pub async fn dequeue_with(&self, token: &CancellationToken) -> Result<T> {
        self.dequeue_inner(Some(token)).await
    }

    /// Removes the oldest item without suspending.
    ///
    /// Returns `None` when nothing is buffered. Works on a closed queue so
    /// shutdown paths can drain what is left.
    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.shared.lock().expect("queue lock").buffer.pop_front();
        if item.is_some() {
            self.space.notify_one();
        }
        item
    }

    async fn dequeue_inner(&self, token: Option<&CancellationToken>) -> Result<T> {
        let receiver = {
            let mut shared = self.shared.lock().expect("queue lock");
            if let Some(item) = shared.buffer.pop_front() {
                self.space.notify_one();
                return Ok(item);
            }
            if self.is_closed() {
                return Err(WebSocketError::Cancelled);
            }
            let (sender, receiver) = oneshot::channel();
            shared.waiters.push_back(sender);
            receiver
        };

        let extra = match token {
            Some(token) => token.clone(),
            None => CancellationToken::new(),
        };

        tokio::select! {
            biased;
            item = receiver => item.map_err(|_| WebSocketError::Cancelled),
            _ = self.closed.cancelled() => Err(WebSocketError::Cancelled),
            _ = extra.cancelled() => Err(WebSocketError::Cancelled),
        }
    }

    fn push(&self, item: T) {
        let mut shared = self.shared.lock().expect("queue lock");
        Self::push_locked(&mut shared, item);
    }

    fn push_locked(shared: &mut Shared<T>, mut item: T) {
        // A waiter whose dequeue was cancelled leaves a dead sender behind;
        // skip those until a live one accepts the item.
        loop {
            match shared.waiters.pop_front() {
                Some(waiter) => match waiter.send(item) {
                    Ok(()) => return,
                    Err(rejected) => item = rejected,
                },
                None => {
                    shared.buffer.push_back(item);
                    return;
                }
            }
        }
    }

    async fn wait_for_space(&self) -> Result<()> {
        loop {
            // Register interest before checking, otherwise a dequeue between
            // the check and the await could be missed.
            let space = self.space.notified();
            if self.shared.lock().expect("queue lock").buffer.len() < self.buffer_limit {
                return Ok(());
            }
            tokio::select! {
                _ = self.closed.cancelled() => return Err(WebSocketError::Cancelled),
                _ = space => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = AsyncQueue::default();
        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();
        queue.enqueue(3).await.unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().await.unwrap(), 1);
        assert_eq!(queue.dequeue().await.unwrap(), 2);
        assert_eq!(queue.dequeue().await.unwrap(), 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = Arc::new(AsyncQueue::default());

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        queue.enqueue(42).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 42);
        // The waiter consumed the item directly; the buffer never held it.
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_try_dequeue_never_blocks() {
        let queue = AsyncQueue::default();
        assert_eq!(queue.try_dequeue(), None);

        queue.enqueue(7).await.unwrap();
        assert_eq!(queue.try_dequeue(), Some(7));
        assert_eq!(queue.try_dequeue(), None);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let queue = Arc::new(AsyncQueue::<u32>::default());

        let first = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        let second = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        queue.close();
        assert!(matches!(
            first.await.unwrap(),
            Err(WebSocketError::Cancelled)
        ));
        assert!(matches!(
            second.await.unwrap(),
            Err(WebSocketError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let queue = AsyncQueue::<u32>::default();
        queue.close();
        queue.close();
        assert!(queue.is_closed());
        assert!(matches!(
            queue.dequeue().await,
            Err(WebSocketError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_enqueue() {
        let queue = AsyncQueue::default();
        queue.close();
        assert!(matches!(
            queue.enqueue(1).await,
            Err(WebSocketError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_drain_buffered_items_after_close() {
        let queue = AsyncQueue::default();
        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();
        queue.close();

        assert_eq!(queue.try_dequeue(), Some(1));
        assert_eq!(queue.dequeue().await.unwrap(), 2);
        assert!(matches!(
            queue.dequeue().await,
            Err(WebSocketError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_enqueue_range_is_ordered() {
        let queue = AsyncQueue::default();
        queue.enqueue_range([1, 2, 3]).await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap(), 1);
        assert_eq!(queue.dequeue().await.unwrap(), 2);
        assert_eq!(queue.dequeue().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_buffer_limit_suspends_enqueue() {
        let queue = Arc::new(AsyncQueue::new(2));
        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert_eq!(queue.dequeue().await.unwrap(), 1);
        blocked.await.unwrap().unwrap();
        assert_eq!(queue.dequeue().await.unwrap(), 2);
        assert_eq!(queue.dequeue().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dequeue_with_caller_token() {
        let queue = Arc::new(AsyncQueue::<u32>::default());
        let token = CancellationToken::new();

        let cancelled = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            tokio::spawn(async move { queue.dequeue_with(&token).await })
        };
        let untouched = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        // Cancel one pending dequeue; the other must stay live.
        token.cancel();
        assert!(matches!(
            cancelled.await.unwrap(),
            Err(WebSocketError::Cancelled)
        ));

        queue.enqueue(9).await.unwrap();
        assert_eq!(untouched.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_swallow_items() {
        let queue = Arc::new(AsyncQueue::<u32>::default());
        let token = CancellationToken::new();

        let cancelled = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            tokio::spawn(async move { queue.dequeue_with(&token).await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        let _ = cancelled.await.unwrap();

        // The dead waiter's sender is skipped; the item stays reachable.
        queue.enqueue(5).await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap(), 5);
    }
}
