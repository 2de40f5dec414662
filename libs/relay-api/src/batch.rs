use crate::ids::{
    PartitionId, PartitionKey, QueueItemId, QueueRef, ReceiptHandle, SequenceNumber, StreamRef,
};
use crate::message::Payload;

/// Where a batch was collected from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOrigin {
    Stream { stream: StreamRef, partition: PartitionId },
    Queue { queue: QueueRef },
}

impl std::fmt::Display for BatchOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchOrigin::Stream { stream, partition } => write!(f, "stream {stream}/{partition}"),
            BatchOrigin::Queue { queue } => write!(f, "queue {queue}"),
        }
    }
}

/// Source position of one batch item, used to commit the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemPosition {
    Stream { key: PartitionKey, sequence: SequenceNumber },
    Queue { item: QueueItemId, receipt: ReceiptHandle },
}

/// One delivered payload plus its metadata.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub payload: Payload,
    /// Wall-clock arrival time of the originating message.
    pub arrived_at_ms: i64,
    /// 1 on first delivery; incremented on every redelivery.
    pub attempt: u32,
    pub position: ItemPosition,
}

/// Ordered items handed to one processing unit invocation.
#[derive(Debug, Clone)]
pub struct Batch {
    pub origin: BatchOrigin,
    pub items: Vec<BatchItem>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn payloads(&self) -> impl Iterator<Item = &Payload> {
        self.items.iter().map(|i| &i.payload)
    }

    /// Highest attempt count among the items.
    pub fn max_attempt(&self) -> u32 {
        self.items.iter().map(|i| i.attempt).max().unwrap_or(0)
    }
}
