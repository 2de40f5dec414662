pub mod buffer;
pub mod config;
pub mod group;

pub use buffer::{AppendReceipt, Position, StreamBuffer, StreamReader, StreamRecord};
pub use config::{StartingPosition, StreamConfig};
pub use group::PartitionLease;
