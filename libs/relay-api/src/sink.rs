use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::ids::RuleId;

/// Structured record of a failed rule action.
///
/// Identifies the failure only: the original payload is never copied here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub topic: String,
    pub rule: RuleId,
    pub action: String,
    pub reason: String,
    pub ts_ms: i64,
}

/// Destination for error records (log, metrics, a queue).
pub trait ErrorSink: Send + Sync {
    fn record(
        &self,
        record: ErrorRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + '_>>;
}
