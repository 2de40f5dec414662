pub mod backoff;
pub mod batch;
pub mod error;
pub mod ids;
pub mod message;
pub mod processor;
pub mod sink;
pub mod topic;

pub use backoff::Backoff;
pub use batch::{Batch, BatchItem, BatchOrigin, ItemPosition};
pub use error::{ErrorKind, RelayError};
pub use ids::{
    ClientId, ConnectionId, ConsumerGroupId, PartitionId, PartitionKey, QueueItemId, QueueRef,
    ReceiptHandle, RuleId, SequenceNumber, StreamRef, UnitId,
};
pub use message::{Message, Payload, Publisher};
pub use processor::ProcessingUnit;
pub use sink::{ErrorRecord, ErrorSink};
pub use topic::{Topic, TopicFilter};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
