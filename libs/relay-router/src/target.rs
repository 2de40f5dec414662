//! Boundaries the router writes to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_api::{PartitionKey, Payload, QueueItemId, QueueRef, RelayError, StreamRef};
use relay_queue::DelayQueue;
use relay_stream::{AppendReceipt, StreamBuffer};

/// Ordered, partitioned destination of `put_to_stream`.
pub trait StreamTarget: Send + Sync {
    fn append(
        &self,
        key: PartitionKey,
        payload: Payload,
        arrived_at_ms: i64,
    ) -> Result<AppendReceipt, RelayError>;
}

/// Delayed destination of `put_to_queue`. `None` uses the queue's own
/// delivery delay.
pub trait QueueTarget: Send + Sync {
    fn enqueue(&self, payload: Payload, delay: Option<Duration>) -> Result<QueueItemId, RelayError>;
}

impl StreamTarget for StreamBuffer {
    fn append(
        &self,
        key: PartitionKey,
        payload: Payload,
        arrived_at_ms: i64,
    ) -> Result<AppendReceipt, RelayError> {
        StreamBuffer::append(self, key, payload, arrived_at_ms)
    }
}

impl QueueTarget for DelayQueue {
    fn enqueue(
        &self,
        payload: Payload,
        delay: Option<Duration>,
    ) -> Result<QueueItemId, RelayError> {
        match delay {
            Some(delay) => DelayQueue::enqueue(self, payload, delay),
            None => self.enqueue_default(payload),
        }
    }
}

/// Named stream and queue targets, resolved once when the router is built.
#[derive(Default, Clone)]
pub struct Targets {
    streams: HashMap<StreamRef, Arc<dyn StreamTarget>>,
    queues: HashMap<QueueRef, Arc<dyn QueueTarget>>,
}

impl Targets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(
        mut self,
        name: impl Into<StreamRef>,
        target: Arc<dyn StreamTarget>,
    ) -> Self {
        self.streams.insert(name.into(), target);
        self
    }

    pub fn with_queue(mut self, name: impl Into<QueueRef>, target: Arc<dyn QueueTarget>) -> Self {
        self.queues.insert(name.into(), target);
        self
    }

    pub fn stream(&self, name: &StreamRef) -> Option<&Arc<dyn StreamTarget>> {
        self.streams.get(name)
    }

    pub fn queue(&self, name: &QueueRef) -> Option<&Arc<dyn QueueTarget>> {
        self.queues.get(name)
    }
}
