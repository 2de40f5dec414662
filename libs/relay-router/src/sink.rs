use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use relay_api::{ErrorRecord, ErrorSink, Payload, RelayError};

use crate::target::QueueTarget;

/// Logs every record at `error` level. Default error destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn record(
        &self,
        record: ErrorRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + '_>> {
        Box::pin(async move {
            tracing::error!(
                topic = %record.topic,
                rule = %record.rule,
                action = %record.action,
                reason = %record.reason,
                ts_ms = record.ts_ms,
                "rule action failed"
            );
            Ok(())
        })
    }
}

/// Serializes records as JSON onto a queue, visible immediately.
pub struct QueueErrorSink {
    queue: Arc<dyn QueueTarget>,
}

impl QueueErrorSink {
    pub fn new(queue: Arc<dyn QueueTarget>) -> Self {
        Self { queue }
    }
}

impl ErrorSink for QueueErrorSink {
    fn record(
        &self,
        record: ErrorRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + '_>> {
        Box::pin(async move {
            let body = serde_json::to_vec(&record)?;
            self.queue
                .enqueue(Payload::from(body), Some(std::time::Duration::ZERO))?;
            Ok(())
        })
    }
}

/// Keeps records in memory. Used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryErrorSink {
    records: Mutex<Vec<ErrorRecord>>,
}

impl MemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        match self.records.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ErrorSink for MemoryErrorSink {
    fn record(
        &self,
        record: ErrorRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + '_>> {
        Box::pin(async move {
            match self.records.lock() {
                Ok(mut g) => g.push(record),
                Err(poisoned) => poisoned.into_inner().push(record),
            }
            Ok(())
        })
    }
}
