//! Bounded admission queue between the store and the forwarder worker.
//!
//! Producers hold a [`ForwardingQueue`]; the worker owns the single
//! [`QueueReceiver`]. A pending counter tracks messages that were admitted
//! but not yet fully processed, so startup catch-up can wait for the
//! backlog to clear.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::store::MessageHandle;

/// Create a queue holding at most `capacity` handles.
pub fn channel(capacity: usize) -> (ForwardingQueue, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (pending, _) = watch::channel(0usize);
    let pending = Arc::new(pending);
    (
        ForwardingQueue {
            tx,
            pending: Arc::clone(&pending),
        },
        QueueReceiver { rx, pending },
    )
}

/// Producer side of the forwarding queue.
#[derive(Debug, Clone)]
pub struct ForwardingQueue {
    tx: mpsc::Sender<MessageHandle>,
    pending: Arc<watch::Sender<usize>>,
}

impl ForwardingQueue {
    /// Admit without waiting. `false` when the queue is full or closed.
    pub fn try_enqueue(&self, handle: MessageHandle) -> bool {
        let admission = Admission::begin(&self.pending);
        match self.tx.try_send(handle) {
            Ok(()) => {
                admission.commit();
                true
            }
            Err(_) => false,
        }
    }

    /// Admit, waiting for room. `false` when the queue is closed.
    ///
    /// Cancel safe: dropping the future before it resolves admits nothing.
    pub async fn enqueue(&self, handle: MessageHandle) -> bool {
        let admission = Admission::begin(&self.pending);
        match self.tx.send(handle).await {
            Ok(()) => {
                admission.commit();
                true
            }
            Err(_) => false,
        }
    }

    /// Messages admitted but not yet processed.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Resolves once every admitted message has been processed.
    pub async fn wait_drained(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Counts a message as pending before it reaches the channel, so the worker
/// can never complete it first. Rolled back on drop unless committed.
struct Admission<'a> {
    pending: &'a watch::Sender<usize>,
    committed: bool,
}

impl<'a> Admission<'a> {
    fn begin(pending: &'a watch::Sender<usize>) -> Self {
        pending.send_modify(|n| *n += 1);
        Self {
            pending,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
    }
}

/// Consumer side, owned by the forwarder worker.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<MessageHandle>,
    pending: Arc<watch::Sender<usize>>,
}

impl QueueReceiver {
    /// Next handle in FIFO order. `None` once closed and empty.
    pub async fn recv(&mut self) -> Option<MessageHandle> {
        self.rx.recv().await
    }

    /// Mark one received message as fully processed.
    pub fn complete(&self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Refuse new admissions. Already admitted handles can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::store::Envelope;

    fn handle() -> MessageHandle {
        MessageHandle {
            id: uuid::Uuid::new_v4(),
            path: PathBuf::from("/nowhere"),
            envelope: Envelope::default(),
        }
    }

    #[tokio::test]
    async fn try_enqueue_fails_when_full() {
        let (queue, _rx) = channel(2);
        assert!(queue.try_enqueue(handle()));
        assert!(queue.try_enqueue(handle()));
        assert!(!queue.try_enqueue(handle()));
        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.capacity(), 2);
    }

    #[tokio::test]
    async fn fifo_order_and_pending_count() {
        let (queue, mut rx) = channel(5);
        let first = handle();
        let second = handle();
        assert!(queue.try_enqueue(first.clone()));
        assert!(queue.try_enqueue(second.clone()));

        assert_eq!(rx.recv().await.unwrap(), first);
        rx.complete();
        assert_eq!(queue.pending(), 1);
        assert_eq!(rx.recv().await.unwrap(), second);
        rx.complete();
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn closed_queue_refuses_but_drains() {
        let (queue, mut rx) = channel(5);
        assert!(queue.try_enqueue(handle()));
        rx.close();

        assert!(!queue.try_enqueue(handle()));
        assert!(!queue.enqueue(handle()).await);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_enqueue_does_not_leak_pending() {
        let (queue, _rx) = channel(1);
        assert!(queue.try_enqueue(handle()));

        let blocked = tokio::time::timeout(Duration::from_millis(20), queue.enqueue(handle())).await;
        assert!(blocked.is_err());
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test]
    async fn wait_drained_resolves_after_completion() {
        let (queue, mut rx) = channel(5);
        assert!(queue.try_enqueue(handle()));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_drained().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        rx.recv().await.unwrap();
        rx.complete();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
