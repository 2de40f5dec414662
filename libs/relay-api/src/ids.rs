//! Typed identifiers. Components never build identifiers by string
//! concatenation; each kind of name or number gets its own type.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            pub fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Name of a routing rule.
    RuleId
);
string_id!(
    /// Name of a stream buffer.
    StreamRef
);
string_id!(
    /// Name of a delay queue.
    QueueRef
);
string_id!(
    /// Key that selects the stream partition a record lands in.
    PartitionKey
);
string_id!(
    /// Consumer group registered on a stream.
    ConsumerGroupId
);
string_id!(
    /// Identity of a processing unit (handler reference).
    UnitId
);
string_id!(
    /// Client identifier presented by a connection.
    ClientId
);

numeric_id!(
    /// Ordered partition of a stream buffer.
    PartitionId(u32)
);
numeric_id!(
    /// Position of a record within its partition. Monotonic per partition.
    SequenceNumber(u64)
);
numeric_id!(
    /// Identity of an enqueued delay queue item.
    QueueItemId(u64)
);
numeric_id!(
    /// Handle issued by a queue poll; required to acknowledge the delivery.
    ReceiptHandle(u64)
);
numeric_id!(
    /// Identity of an admitted connection.
    ConnectionId(u64)
);

impl SequenceNumber {
    pub fn next(self) -> SequenceNumber {
        SequenceNumber(self.0 + 1)
    }
}
