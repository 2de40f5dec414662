use std::future::Future;
use std::pin::Pin;

use crate::batch::Batch;
use crate::error::RelayError;
use crate::ids::UnitId;

/// Stateless handler invoked with one batch at a time.
///
/// The return value is a per-invocation signal: `Ok` commits every item of
/// the batch, `Err` leaves the whole batch uncommitted for redelivery.
/// A unit that wants finer granularity keeps its own bookkeeping.
pub trait ProcessingUnit: Send + Sync {
    fn id(&self) -> &UnitId;

    fn invoke<'a>(
        &'a self,
        batch: &'a Batch,
    ) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + 'a>>;
}
