//! Live subscriber set
//!
//! Each connection registers a bounded queue drained by its own socket task.
//! Broadcasting only enqueues, so one slow viewer never stalls the others.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

pub type SubscriberId = u64;

/// Serialized frame shared by every queue
pub type Frame = Arc<str>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Subscribers whose queue was closed or full
    pub failed: Vec<SubscriberId>,
}

#[derive(Clone, Default)]
pub struct SubscriberSet {
    inner: Arc<Mutex<HashMap<SubscriberId, mpsc::Sender<Frame>>>>,
    next_id: Arc<AtomicU64>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber; the receiver feeds its socket writer.
    pub fn register(&self, queue: usize) -> (SubscriberId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.lock().insert(id, tx);
        (id, rx)
    }

    /// Returns false when the subscriber was already gone
    pub fn unregister(&self, id: SubscriberId) -> bool {
        self.inner.lock().remove(&id).is_some()
    }

    pub fn remove_all(&self, ids: &[SubscriberId]) -> usize {
        let mut inner = self.inner.lock();
        ids.iter().filter(|id| inner.remove(*id).is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    /// Enqueue `frame` for every subscriber without waiting on any socket.
    pub fn broadcast(&self, frame: Frame) -> BroadcastReport {
        let inner = self.inner.lock();
        let mut report = BroadcastReport::default();

        for (id, tx) in inner.iter() {
            match tx.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Closed(_)) | Err(TrySendError::Full(_)) => report.failed.push(*id),
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_all() {
        let set = SubscriberSet::new();
        let (_a, mut rx_a) = set.register(4);
        let (_b, mut rx_b) = set.register(4);

        let report = set.broadcast(Arc::from("hello"));
        assert_eq!(report.delivered, 2);
        assert!(report.failed.is_empty());
        assert_eq!(&*rx_a.recv().await.unwrap(), "hello");
        assert_eq!(&*rx_b.recv().await.unwrap(), "hello");
    }

    #[test]
    fn test_closed_and_full_queues_fail() {
        let set = SubscriberSet::new();
        let (closed, rx_closed) = set.register(4);
        drop(rx_closed);
        let (full, _rx_full) = set.register(1);
        let (ok, _rx_ok) = set.register(8);

        set.broadcast(Arc::from("one"));
        let report = set.broadcast(Arc::from("two"));

        let mut failed = report.failed.clone();
        failed.sort();
        assert_eq!(failed, vec![closed, full]);
        assert_eq!(report.delivered, 1);
        assert!(set.contains(ok));

        assert_eq!(set.remove_all(&failed), 2);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_unregister() {
        let set = SubscriberSet::new();
        let (id, _rx) = set.register(1);
        assert!(set.unregister(id));
        assert!(!set.unregister(id));
        assert!(set.is_empty());
    }
}
