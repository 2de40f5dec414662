use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Notify;
use tokio::time::Instant;

use relay_api::{
    ConsumerGroupId, PartitionId, PartitionKey, Payload, RelayError, SequenceNumber, StreamRef,
};

use crate::config::StreamConfig;
use crate::group::GroupState;

/// Record owned by the stream buffer.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub partition: PartitionId,
    pub key: PartitionKey,
    pub sequence: SequenceNumber,
    pub payload: Payload,
    pub arrived_at_ms: i64,
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReceipt {
    pub partition: PartitionId,
    pub sequence: SequenceNumber,
}

/// Read position within one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Oldest retained record.
    TrimHorizon,
    /// Next record to be appended.
    Latest,
    /// The record with this sequence number (or the next retained one).
    At(SequenceNumber),
    /// The record following this sequence number.
    After(SequenceNumber),
}

// ═══════════════════════════════════════════════════════════════
//  Partition
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub(crate) struct PartitionLog {
    records: VecDeque<StreamRecord>,
    next_sequence: u64,
}

impl PartitionLog {
    /// Sequence number of the oldest retained record.
    pub(crate) fn first_sequence(&self) -> u64 {
        self.records
            .front()
            .map(|r| r.sequence.get())
            .unwrap_or(self.next_sequence)
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    fn get(&self, sequence: u64) -> Option<&StreamRecord> {
        let first = self.first_sequence();
        if sequence < first {
            return None;
        }
        self.records.get((sequence - first) as usize)
    }

    /// Drop every record below `before`. Returns how many were removed.
    pub(crate) fn trim_before(&mut self, before: u64) -> usize {
        let mut removed = 0;
        while self.records.front().is_some_and(|r| r.sequence.get() < before) {
            self.records.pop_front();
            removed += 1;
        }
        removed
    }

    pub(crate) fn resolve(&self, position: Position) -> u64 {
        match position {
            Position::TrimHorizon => self.first_sequence(),
            Position::Latest => self.next_sequence,
            Position::At(seq) => seq.get(),
            Position::After(seq) => seq.get() + 1,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Partition {
    pub(crate) log: RwLock<PartitionLog>,
    notify: Notify,
}

impl Partition {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, PartitionLog> {
        match self.log.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("partition read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, PartitionLog> {
        match self.log.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("partition write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  StreamBuffer
// ═══════════════════════════════════════════════════════════════

/// Append-only, partitioned, ordered log.
///
/// Records with the same partition key land in the same partition and are
/// observed in append order. Reading never deletes; records are only
/// removed by [`trim_consumed`](StreamBuffer::trim_consumed) once every
/// registered consumer group has committed past them.
#[derive(Debug)]
pub struct StreamBuffer {
    name: StreamRef,
    partitions: Vec<Partition>,
    max_records_per_partition: usize,
    pub(crate) groups: Mutex<HashMap<ConsumerGroupId, GroupState>>,
}

impl StreamBuffer {
    pub fn new(config: &StreamConfig) -> Self {
        let count = config.partitions.max(1);
        Self {
            name: config.name.clone(),
            partitions: (0..count).map(|_| Partition::default()).collect(),
            max_records_per_partition: config.max_records_per_partition,
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &StreamRef {
        &self.name
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub fn partition_ids(&self) -> impl Iterator<Item = PartitionId> {
        (0..self.partition_count()).map(PartitionId)
    }

    /// Partition a key maps to. Stable for the lifetime of the buffer.
    pub fn partition_for(&self, key: &PartitionKey) -> PartitionId {
        let mut hasher = DefaultHasher::new();
        key.as_str().hash(&mut hasher);
        PartitionId((hasher.finish() % self.partitions.len() as u64) as u32)
    }

    /// Append a record. Fails fast with an overflow error when the target
    /// partition reached its depth limit.
    pub fn append(
        &self,
        key: PartitionKey,
        payload: Payload,
        arrived_at_ms: i64,
    ) -> Result<AppendReceipt, RelayError> {
        let partition_id = self.partition_for(&key);
        let partition = &self.partitions[partition_id.get() as usize];

        let sequence = {
            let mut log = partition.write();
            if log.records.len() >= self.max_records_per_partition {
                return Err(RelayError::overflow(format!(
                    "stream '{}' partition {partition_id}: depth limit {} reached",
                    self.name, self.max_records_per_partition
                )));
            }
            let sequence = SequenceNumber(log.next_sequence);
            log.records.push_back(StreamRecord {
                partition: partition_id,
                key,
                sequence,
                payload,
                arrived_at_ms,
            });
            log.next_sequence += 1;
            sequence
        };

        partition.notify.notify_waiters();
        Ok(AppendReceipt {
            partition: partition_id,
            sequence,
        })
    }

    /// Lazy, unbounded reader over one partition. Restartable from any
    /// position previously returned by a reader.
    pub fn read_from(
        self: &Arc<Self>,
        partition: PartitionId,
        position: Position,
    ) -> Result<StreamReader, RelayError> {
        let next = self.partition(partition)?.read().resolve(position);
        Ok(StreamReader {
            stream: self.clone(),
            partition,
            next,
        })
    }

    /// Records currently retained in a partition.
    pub fn depth(&self, partition: PartitionId) -> Result<usize, RelayError> {
        Ok(self.partition(partition)?.read().records.len())
    }

    pub fn total_depth(&self) -> usize {
        self.partitions.iter().map(|p| p.read().records.len()).sum()
    }

    pub(crate) fn partition(&self, id: PartitionId) -> Result<&Partition, RelayError> {
        self.partitions.get(id.get() as usize).ok_or_else(|| {
            RelayError::logic(format!("stream '{}': no partition {id}", self.name))
        })
    }

    pub(crate) fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub(crate) fn lock_groups(&self) -> MutexGuard<'_, HashMap<ConsumerGroupId, GroupState>> {
        match self.groups.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(stream = %self.name, "consumer group lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  StreamReader
// ═══════════════════════════════════════════════════════════════

/// Cursor over one partition. Holds no lock between calls.
pub struct StreamReader {
    stream: Arc<StreamBuffer>,
    partition: PartitionId,
    next: u64,
}

impl StreamReader {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Position to restart from to continue where this reader is.
    pub fn position(&self) -> Position {
        Position::At(SequenceNumber(self.next))
    }

    /// Next record if one is already available.
    pub fn try_next(&mut self) -> Option<StreamRecord> {
        let partition = self.stream.partition(self.partition).ok()?;
        let log = partition.read();
        // Skip over records trimmed since the last read.
        self.next = self.next.max(log.first_sequence());
        let record = log.get(self.next).cloned()?;
        self.next += 1;
        Some(record)
    }

    /// Wait for the next record. Cancel-safe: dropping the future before it
    /// resolves does not advance the reader.
    pub async fn next(&mut self) -> StreamRecord {
        let stream = self.stream.clone();
        loop {
            let Ok(partition) = stream.partition(self.partition) else {
                return std::future::pending().await;
            };
            let notified = partition.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.try_next() {
                return record;
            }
            notified.await;
        }
    }

    /// Wait for the next record until `deadline`.
    pub async fn next_until(&mut self, deadline: Instant) -> Option<StreamRecord> {
        tokio::time::timeout_at(deadline, self.next()).await.ok()
    }

    /// Move the reader to a position.
    pub fn seek(&mut self, position: Position) {
        if let Ok(partition) = self.stream.partition(self.partition) {
            self.next = partition.read().resolve(position);
        }
    }
}
