//! FIFO queues connecting the pipeline stages.
//!
//! Both queues are backed by `flume` channels so several producers and
//! several consumers can share them. Each queue owns both channel ends, so
//! the channel never disconnects while the queue is alive: stages decide
//! when they are done through the shared counters, not through channel
//! closure.

use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Result, RpcError},
    message::{PdfReply, PdfRequest},
};

/// Requests waiting to be transmitted.
pub type BoundedRequestQueue = BoundedQueue<PdfRequest>;
/// Replies waiting to be persisted.
pub type UnboundedResponseQueue = UnboundedQueue<PdfReply>;

/// A fixed-capacity FIFO queue that applies backpressure to its producers.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
    capacity: usize,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Send + 'static> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items. A zero capacity is
    /// raised to one so that enqueue can always make progress.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Push an item, waiting while the queue is full.
    ///
    /// Returns [`RpcError::Cancelled`] if `cancel` fires before space becomes
    /// available; the item is dropped in that case.
    pub async fn enqueue(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RpcError::Cancelled),
            res = self.tx.send_async(item) => res.map_err(|_| {
                RpcError::ChannelClosed("request queue disconnected".to_string())
            }),
        }
    }

    /// Pop the oldest item, waiting at most `wait` for one to arrive.
    pub async fn try_dequeue(&self, wait: Duration) -> Option<T> {
        match timeout(wait, self.rx.recv_async()).await {
            Ok(Ok(item)) => Some(item),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// An unbounded FIFO queue. Enqueue never waits.
///
/// Memory grows without limit if consumers fall behind the producer for a
/// sustained period.
#[derive(Debug)]
pub struct UnboundedQueue<T> {
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
}

impl<T> Clone for UnboundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T: Send + 'static> Default for UnboundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> UnboundedQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn enqueue(&self, item: T) -> Result<()> {
        self.tx
            .send(item)
            .map_err(|_| RpcError::ChannelClosed("response queue disconnected".to_string()))
    }

    /// Pop the oldest item, waiting at most `wait` for one to arrive.
    pub async fn try_dequeue(&self, wait: Duration) -> Option<T> {
        match timeout(wait, self.rx.recv_async()).await {
            Ok(Ok(item)) => Some(item),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
