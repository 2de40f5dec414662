use serde::Deserialize;

use relay_api::StreamRef;

/// `[[streams]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamConfig {
    pub name: StreamRef,
    /// Number of ordered partitions (shards).
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Depth limit per partition; appends beyond it fail with an overflow error.
    #[serde(default = "default_max_records")]
    pub max_records_per_partition: usize,
}

fn default_partitions() -> u32 {
    4
}
fn default_max_records() -> usize {
    100_000
}

impl StreamConfig {
    pub fn new(name: impl Into<StreamRef>) -> Self {
        Self {
            name: name.into(),
            partitions: default_partitions(),
            max_records_per_partition: default_max_records(),
        }
    }
}

/// Where a new consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartingPosition {
    /// Oldest retained record.
    #[default]
    TrimHorizon,
    /// Only records appended after registration.
    Latest,
}
