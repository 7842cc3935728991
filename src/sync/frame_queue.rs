// Bounded FIFO relay between one producer and one consumer
//
// Fan-out to several consumers is done by the producer pushing the same
// (cheaply cloned) item into several independent queues.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError};

/// Error type for queue operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("the other end of the queue is gone")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Outcome of a bounded-time `put`
#[derive(Debug)]
pub enum PutOutcome<T> {
    Delivered,
    /// Queue stayed full for the whole timeout; the item is handed back
    TimedOut(T),
}

/// Create a queue holding at most `capacity` items
pub fn frame_queue<T>(capacity: usize) -> (FrameProducer<T>, FrameConsumer<T>) {
    let capacity = capacity.max(1);
    let (sender, receiver) = bounded(capacity);
    (
        FrameProducer { sender, capacity },
        FrameConsumer { receiver },
    )
}

/// Producing half. Not `Clone`: each queue has exactly one producer.
pub struct FrameProducer<T> {
    sender: Sender<T>,
    capacity: usize,
}

impl<T> FrameProducer<T> {
    /// Append an item, blocking while the queue holds `capacity` items
    pub fn put(&self, item: T) -> Result<()> {
        self.sender.send(item).map_err(|_| QueueError::Disconnected)
    }

    /// Append an item, giving up after `timeout` if the queue stays full
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Result<PutOutcome<T>> {
        match self.sender.send_timeout(item, timeout) {
            Ok(()) => Ok(PutOutcome::Delivered),
            Err(SendTimeoutError::Timeout(item)) => Ok(PutOutcome::TimedOut(item)),
            Err(SendTimeoutError::Disconnected(_)) => Err(QueueError::Disconnected),
        }
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Consuming half. Not `Clone`: each queue has exactly one consumer.
pub struct FrameConsumer<T> {
    receiver: Receiver<T>,
}

impl<T> FrameConsumer<T> {
    /// Take the oldest item, blocking while the queue is empty
    pub fn get(&self) -> Result<T> {
        self.receiver.recv().map_err(|_| QueueError::Disconnected)
    }

    /// Take the oldest item, returning `Ok(None)` if nothing arrives in time.
    ///
    /// Items already queued are still delivered after the producer is gone;
    /// `Disconnected` is only reported once the queue is drained.
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Disconnected),
        }
    }

    pub fn try_get(&self) -> Result<Option<T>> {
        match self.receiver.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(QueueError::Disconnected),
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
