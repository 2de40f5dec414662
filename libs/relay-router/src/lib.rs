pub mod partition;
pub mod router;
pub mod rule;
pub mod sink;
pub mod sql;
pub mod target;

pub use partition::PartitionKeyExpr;
pub use router::Router;
pub use rule::{Action, ActionReceipt, ActionResult, Rule, RuleConfig};
pub use sink::{MemoryErrorSink, QueueErrorSink, TracingErrorSink};
pub use sql::{DEFAULT_QUEUE_RULE_SQL, DEFAULT_STREAM_RULE_SQL, parse_rule_sql};
pub use target::{QueueTarget, StreamTarget, Targets};
