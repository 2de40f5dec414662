//! Consumer groups: per-partition committed cursors with exclusive leases.
//!
//! A partition of a group is consumed by at most one holder at a time. The
//! holder reads from the committed cursor, and only moves it forward through
//! [`PartitionLease::commit`]. Dropping a lease without committing leaves the
//! cursor where it was, so the next holder re-reads the same records.

use std::sync::Arc;

use relay_api::{ConsumerGroupId, PartitionId, RelayError, SequenceNumber};

use crate::buffer::{Position, StreamBuffer, StreamReader};
use crate::config::StartingPosition;

#[derive(Debug, Clone, Copy)]
pub(crate) struct GroupCursor {
    /// First sequence not yet committed.
    next: u64,
    leased: bool,
}

#[derive(Debug)]
pub(crate) struct GroupState {
    cursors: Vec<GroupCursor>,
}

impl StreamBuffer {
    /// Register a consumer group. Registering an existing group is a no-op
    /// and keeps its committed cursors.
    pub fn register_group(&self, group: ConsumerGroupId, start: StartingPosition) {
        let mut groups = self.lock_groups();
        if groups.contains_key(&group) {
            return;
        }
        let cursors = self
            .partitions()
            .iter()
            .map(|p| {
                let log = p.read();
                let next = match start {
                    StartingPosition::TrimHorizon => log.first_sequence(),
                    StartingPosition::Latest => log.next_sequence(),
                };
                GroupCursor {
                    next,
                    leased: false,
                }
            })
            .collect();
        tracing::debug!(
            stream = %self.name(),
            group = %group,
            start = ?start,
            "consumer group registered"
        );
        groups.insert(group, GroupState { cursors });
    }

    /// Take the exclusive lease on one partition of a group.
    pub fn lease(
        self: &Arc<Self>,
        group: &ConsumerGroupId,
        partition: PartitionId,
    ) -> Result<PartitionLease, RelayError> {
        self.partition(partition)?;
        let mut groups = self.lock_groups();
        let state = groups.get_mut(group).ok_or_else(|| {
            RelayError::logic(format!(
                "stream '{}': consumer group '{group}' is not registered",
                self.name()
            ))
        })?;
        let cursor = &mut state.cursors[partition.get() as usize];
        if cursor.leased {
            return Err(RelayError::logic(format!(
                "stream '{}': partition {partition} of group '{group}' is already leased",
                self.name()
            )));
        }
        cursor.leased = true;
        Ok(PartitionLease {
            stream: self.clone(),
            group: group.clone(),
            partition,
        })
    }

    /// Records of a partition not yet committed by the group.
    pub fn lag(&self, group: &ConsumerGroupId, partition: PartitionId) -> Result<u64, RelayError> {
        let next_sequence = self.partition(partition)?.read().next_sequence();
        let groups = self.lock_groups();
        let state = groups.get(group).ok_or_else(|| {
            RelayError::logic(format!("consumer group '{group}' is not registered"))
        })?;
        Ok(next_sequence.saturating_sub(state.cursors[partition.get() as usize].next))
    }

    /// Remove records every registered group has committed past.
    /// Without any registered group nothing is removed.
    pub fn trim_consumed(&self) -> usize {
        let groups = self.lock_groups();
        if groups.is_empty() {
            return 0;
        }
        let mut removed = 0;
        for (index, partition) in self.partitions().iter().enumerate() {
            let Some(floor) = groups.values().map(|g| g.cursors[index].next).min() else {
                continue;
            };
            removed += partition.write().trim_before(floor);
        }
        drop(groups);
        if removed > 0 {
            tracing::debug!(stream = %self.name(), removed, "trimmed consumed records");
        }
        removed
    }
}

/// Exclusive right to consume one partition for one consumer group.
/// Released on drop.
pub struct PartitionLease {
    stream: Arc<StreamBuffer>,
    group: ConsumerGroupId,
    partition: PartitionId,
}

impl PartitionLease {
    pub fn group(&self) -> &ConsumerGroupId {
        &self.group
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn stream(&self) -> &Arc<StreamBuffer> {
        &self.stream
    }

    /// First sequence number not yet committed.
    pub fn committed(&self) -> SequenceNumber {
        let groups = self.stream.lock_groups();
        let next = groups
            .get(&self.group)
            .map(|g| g.cursors[self.partition.get() as usize].next)
            .unwrap_or(0);
        SequenceNumber(next)
    }

    /// Reader positioned at the committed cursor.
    pub fn reader(&self) -> Result<StreamReader, RelayError> {
        self.stream
            .read_from(self.partition, Position::At(self.committed()))
    }

    /// Commit every record up to and including `through`. Cursors never move
    /// backwards; committing an older sequence is a no-op.
    pub fn commit(&self, through: SequenceNumber) {
        let mut groups = self.stream.lock_groups();
        if let Some(state) = groups.get_mut(&self.group) {
            let cursor = &mut state.cursors[self.partition.get() as usize];
            cursor.next = cursor.next.max(through.get() + 1);
        }
    }
}

impl Drop for PartitionLease {
    fn drop(&mut self) {
        let mut groups = self.stream.lock_groups();
        if let Some(state) = groups.get_mut(&self.group) {
            state.cursors[self.partition.get() as usize].leased = false;
        }
    }
}
