use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use relay_api::{
    Batch, BatchItem, BatchOrigin, ConsumerGroupId, ItemPosition, PartitionId, RelayError,
    SequenceNumber,
};
use relay_queue::{DeadLetter, DeadLetterQueue, DelayQueue};
use relay_stream::{PartitionLease, Position, StreamBuffer, StreamReader};

/// Where a dispatcher pulls items from and reports outcomes to.
///
/// `next_item` must be cancel-safe: dropping its future must not lose an
/// item that was not returned.
pub trait BatchSource: Send {
    fn origin(&self) -> BatchOrigin;

    /// Next item, or `None` once `deadline` passed. Without a deadline the
    /// call waits until an item arrives.
    fn next_item(
        &mut self,
        deadline: Option<Instant>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<BatchItem>, RelayError>> + Send + '_>>;

    /// The unit accepted the batch: make its items consumed.
    fn commit(&mut self, batch: &Batch) -> Result<(), RelayError>;

    /// The unit rejected the batch: make its items eligible for redelivery.
    fn rollback(&mut self, batch: &Batch, error: &RelayError) -> Result<(), RelayError>;

    /// Items read but never handed to the unit: undo the read so they are
    /// delivered again as if they had not been read.
    fn discard(&mut self, items: &[BatchItem]);
}

// ═══════════════════════════════════════════════════════════════
//  Stream source
// ═══════════════════════════════════════════════════════════════

/// One partition of a stream, consumed under a consumer-group lease.
///
/// A failed batch is re-read from the committed cursor. Once the records at
/// the cursor were delivered `max_attempts` times they go to the dead-letter
/// queue and the cursor moves past them.
pub struct StreamBatchSource {
    lease: PartitionLease,
    reader: StreamReader,
    max_attempts: u32,
    /// Deliveries per uncommitted sequence number.
    deliveries: BTreeMap<u64, u32>,
    dead_letters: Arc<DeadLetterQueue>,
}

impl StreamBatchSource {
    pub fn new(
        stream: &Arc<StreamBuffer>,
        group: &ConsumerGroupId,
        partition: PartitionId,
        max_attempts: u32,
        dead_letters: Arc<DeadLetterQueue>,
    ) -> Result<Self, RelayError> {
        let lease = stream.lease(group, partition)?;
        let reader = lease.reader()?;
        Ok(Self {
            lease,
            reader,
            max_attempts: max_attempts.max(1),
            deliveries: BTreeMap::new(),
            dead_letters,
        })
    }

    fn rewind(&mut self) {
        self.reader.seek(Position::At(self.lease.committed()));
    }

    fn forget_through(&mut self, sequence: SequenceNumber) {
        self.deliveries = self.deliveries.split_off(&(sequence.get() + 1));
    }
}

impl BatchSource for StreamBatchSource {
    fn origin(&self) -> BatchOrigin {
        BatchOrigin::Stream {
            stream: self.lease.stream().name().clone(),
            partition: self.lease.partition(),
        }
    }

    fn next_item(
        &mut self,
        deadline: Option<Instant>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<BatchItem>, RelayError>> + Send + '_>> {
        Box::pin(async move {
            let record = match deadline {
                Some(deadline) => self.reader.next_until(deadline).await,
                None => Some(self.reader.next().await),
            };
            Ok(record.map(|record| {
                let attempt = self.deliveries.entry(record.sequence.get()).or_insert(0);
                *attempt += 1;
                BatchItem {
                    payload: record.payload,
                    arrived_at_ms: record.arrived_at_ms,
                    attempt: *attempt,
                    position: ItemPosition::Stream {
                        key: record.key,
                        sequence: record.sequence,
                    },
                }
            }))
        })
    }

    fn commit(&mut self, batch: &Batch) -> Result<(), RelayError> {
        let Some(last) = last_sequence(batch.items.iter()) else {
            return Ok(());
        };
        self.lease.commit(last);
        self.forget_through(last);
        Ok(())
    }

    fn rollback(&mut self, batch: &Batch, error: &RelayError) -> Result<(), RelayError> {
        // Items come in sequence order and older items were delivered more
        // often, so the exhausted ones form a prefix.
        let exhausted: Vec<&BatchItem> = batch
            .items
            .iter()
            .take_while(|item| item.attempt >= self.max_attempts)
            .collect();

        if let Some(last) = last_sequence(exhausted.iter().copied()) {
            let origin = self.origin().to_string();
            let now = relay_api::now_ms();
            self.dead_letters.push(
                exhausted
                    .iter()
                    .map(|item| DeadLetter {
                        payload: item.payload.clone(),
                        origin: origin.clone(),
                        reason: error.to_string(),
                        attempts: item.attempt,
                        failed_at_ms: now,
                    })
                    .collect(),
            );
            self.lease.commit(last);
            self.forget_through(last);
        }

        self.rewind();
        Ok(())
    }

    fn discard(&mut self, items: &[BatchItem]) {
        for item in items {
            let ItemPosition::Stream { sequence, .. } = &item.position else {
                continue;
            };
            if let Some(count) = self.deliveries.get_mut(&sequence.get()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.deliveries.remove(&sequence.get());
                }
            }
        }
        self.rewind();
    }
}

fn last_sequence<'a>(items: impl Iterator<Item = &'a BatchItem>) -> Option<SequenceNumber> {
    items
        .filter_map(|item| match &item.position {
            ItemPosition::Stream { sequence, .. } => Some(*sequence),
            ItemPosition::Queue { .. } => None,
        })
        .max()
}

// ═══════════════════════════════════════════════════════════════
//  Queue source
// ═══════════════════════════════════════════════════════════════

/// One poller of a delay queue. Redelivery is left to the queue's
/// visibility timeout; dead-lettering to its attempt limit.
pub struct QueueBatchSource {
    queue: Arc<DelayQueue>,
    visibility_timeout: Duration,
}

/// Longest single wait when no deadline is set.
const IDLE_POLL: Duration = Duration::from_secs(60);

impl QueueBatchSource {
    pub fn new(queue: Arc<DelayQueue>) -> Self {
        let visibility_timeout = queue.config().visibility_timeout();
        Self {
            queue,
            visibility_timeout,
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

impl BatchSource for QueueBatchSource {
    fn origin(&self) -> BatchOrigin {
        BatchOrigin::Queue {
            queue: self.queue.name().clone(),
        }
    }

    fn next_item(
        &mut self,
        deadline: Option<Instant>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<BatchItem>, RelayError>> + Send + '_>> {
        Box::pin(async move {
            let delivery = match deadline {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    self.queue.poll_wait(self.visibility_timeout, wait).await
                }
                None => loop {
                    let polled = self.queue.poll_wait(self.visibility_timeout, IDLE_POLL).await;
                    if let Some(d) = polled {
                        break Some(d);
                    }
                },
            };
            Ok(delivery.map(|d| BatchItem {
                payload: d.payload,
                arrived_at_ms: d.enqueued_at_ms,
                attempt: d.attempt,
                position: ItemPosition::Queue {
                    item: d.item,
                    receipt: d.receipt,
                },
            }))
        })
    }

    fn commit(&mut self, batch: &Batch) -> Result<(), RelayError> {
        for item in &batch.items {
            if let ItemPosition::Queue { receipt, .. } = &item.position {
                // A stale receipt means the visibility timeout expired during
                // processing and the item was handed out again.
                if let Err(e) = self.queue.ack(*receipt) {
                    tracing::warn!(
                        queue = %self.queue.name(),
                        error = %e,
                        "ack failed, item will be redelivered"
                    );
                }
            }
        }
        Ok(())
    }

    fn rollback(&mut self, batch: &Batch, error: &RelayError) -> Result<(), RelayError> {
        tracing::debug!(
            queue = %self.queue.name(),
            items = batch.len(),
            error = %error,
            "batch left for redelivery after visibility timeout"
        );
        Ok(())
    }

    fn discard(&mut self, items: &[BatchItem]) {
        for item in items {
            let ItemPosition::Queue { receipt, .. } = &item.position else {
                continue;
            };
            if let Err(e) = self.queue.release(*receipt) {
                tracing::debug!(
                    queue = %self.queue.name(),
                    error = %e,
                    "release failed, item waits for its visibility timeout"
                );
            }
        }
    }
}
