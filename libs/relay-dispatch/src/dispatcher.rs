use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use relay_api::{Backoff, Batch, ProcessingUnit};

use crate::policy::{BatchPolicy, WindowPolicy};
use crate::source::BatchSource;

/// Counters of one dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    batches_committed: AtomicU64,
    batches_failed: AtomicU64,
    items_committed: AtomicU64,
    read_failures: AtomicU64,
}

impl DispatchStats {
    pub fn batches_committed(&self) -> u64 {
        self.batches_committed.load(Ordering::Relaxed)
    }

    pub fn batches_failed(&self) -> u64 {
        self.batches_failed.load(Ordering::Relaxed)
    }

    pub fn items_committed(&self) -> u64 {
        self.items_committed.load(Ordering::Relaxed)
    }

    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }
}

/// Accumulates items from a source and hands each batch to a processing
/// unit. Success commits the batch; failure rolls it back for redelivery.
pub struct BatchDispatcher {
    name: String,
    unit: Arc<dyn ProcessingUnit>,
    policy: BatchPolicy,
    backoff: Backoff,
    stats: Arc<DispatchStats>,
}

impl BatchDispatcher {
    pub fn new(
        name: impl Into<String>,
        unit: Arc<dyn ProcessingUnit>,
        policy: BatchPolicy,
        backoff: Backoff,
    ) -> Self {
        Self {
            name: name.into(),
            unit,
            policy,
            backoff,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Share counters across dispatchers of the same configuration entry.
    pub fn with_stats(mut self, stats: Arc<DispatchStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    /// Run until `token` is cancelled or the source fails permanently.
    /// Cancellation during accumulation discards the partial batch: nothing
    /// is committed and the source is rewound so the same records are read
    /// again. An invocation already in progress completes first.
    pub async fn run<S: BatchSource>(&self, source: &mut S, token: CancellationToken) {
        let origin = source.origin();
        tracing::info!(
            dispatcher = %self.name,
            origin = %origin,
            unit = %self.unit.id(),
            "dispatcher started"
        );

        let mut window_start = Instant::now();
        let mut read_failures = 0u32;
        let mut unit_failures = 0u32;

        'run: loop {
            let mut items = Vec::with_capacity(self.policy.max_items.min(1024));
            let mut deadline = match self.policy.window {
                WindowPolicy::FirstItem => None,
                WindowPolicy::Tumbling => Some(window_start + self.policy.max_wait),
            };

            while items.len() < self.policy.max_items {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    next = source.next_item(deadline) => Some(next),
                };
                let Some(next) = next else {
                    tracing::debug!(
                        dispatcher = %self.name,
                        discarded = items.len(),
                        "cancelled during accumulation"
                    );
                    source.discard(&items);
                    break 'run;
                };

                match next {
                    Ok(Some(item)) => {
                        read_failures = 0;
                        if items.is_empty() && self.policy.window == WindowPolicy::FirstItem {
                            deadline = Some(Instant::now() + self.policy.max_wait);
                        }
                        items.push(item);
                    }
                    Ok(None) => break,
                    Err(e) if !e.is_transient() => {
                        self.stats.read_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            dispatcher = %self.name,
                            error = %e,
                            "source read failed permanently, stopping dispatcher"
                        );
                        source.discard(&items);
                        break 'run;
                    }
                    Err(e) => {
                        read_failures += 1;
                        self.stats.read_failures.fetch_add(1, Ordering::Relaxed);
                        let delay = self.backoff.delay_for_attempt(read_failures);
                        tracing::warn!(
                            dispatcher = %self.name,
                            attempt = read_failures,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "source read failed"
                        );
                        if !sleep_or_cancel(delay, &token).await {
                            source.discard(&items);
                            break 'run;
                        }
                    }
                }
            }

            if self.policy.window == WindowPolicy::Tumbling {
                window_start = Instant::now();
            }
            if items.is_empty() {
                continue;
            }

            let batch = Batch {
                origin: origin.clone(),
                items,
            };
            if self.dispatch(source, &batch).await {
                unit_failures = 0;
            } else {
                unit_failures += 1;
                let delay = self.backoff.delay_for_attempt(unit_failures);
                if !sleep_or_cancel(delay, &token).await {
                    break;
                }
            }
            if self.policy.window == WindowPolicy::Tumbling {
                window_start = Instant::now();
            }
        }

        tracing::info!(dispatcher = %self.name, origin = %origin, "dispatcher stopped");
    }

    /// Invoke the unit with one batch. Returns whether it succeeded.
    async fn dispatch<S: BatchSource>(&self, source: &mut S, batch: &Batch) -> bool {
        tracing::debug!(
            dispatcher = %self.name,
            items = batch.len(),
            max_attempt = batch.max_attempt(),
            "invoking processing unit"
        );

        match self.unit.invoke(batch).await {
            Ok(()) => {
                if let Err(e) = source.commit(batch) {
                    tracing::error!(dispatcher = %self.name, error = %e, "commit failed");
                    return false;
                }
                self.stats.batches_committed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .items_committed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    dispatcher = %self.name,
                    unit = %self.unit.id(),
                    items = batch.len(),
                    error = %e,
                    "processing unit failed, batch not committed"
                );
                if let Err(e) = source.rollback(batch, &e) {
                    tracing::error!(dispatcher = %self.name, error = %e, "rollback failed");
                }
                false
            }
        }
    }
}

/// Returns false when cancelled first.
async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Run a dispatcher on its own task.
pub fn spawn_dispatcher<S>(
    dispatcher: Arc<BatchDispatcher>,
    mut source: S,
    token: CancellationToken,
) -> JoinHandle<()>
where
    S: BatchSource + 'static,
{
    tokio::spawn(async move {
        dispatcher.run(&mut source, token).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use relay_api::{
        BatchItem, BatchOrigin, ConsumerGroupId, ItemPosition, PartitionId, PartitionKey, Payload,
        RelayError, SequenceNumber, UnitId,
    };
    use relay_queue::{DeadLetterQueue, DelayQueue, QueueConfig};
    use relay_stream::{StartingPosition, StreamBuffer, StreamConfig};

    use crate::source::{QueueBatchSource, StreamBatchSource};

    /// Records every batch with the (paused) time it was invoked at, and
    /// fails the first `fail_first` invocations.
    struct Recorder {
        id: UnitId,
        started: Instant,
        fail_first: usize,
        calls: Mutex<Vec<(Duration, Batch)>>,
    }

    impl Recorder {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                id: UnitId::new("recorder"),
                started: Instant::now(),
                fail_first,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(Duration, Batch)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ProcessingUnit for Recorder {
        fn id(&self) -> &UnitId {
            &self.id
        }

        fn invoke<'a>(
            &'a self,
            batch: &'a Batch,
        ) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + 'a>> {
            Box::pin(async move {
                let mut calls = self.calls.lock().unwrap();
                calls.push((self.started.elapsed(), batch.clone()));
                if calls.len() <= self.fail_first {
                    Err(RelayError::processing("downstream rejected batch"))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn stream() -> (Arc<StreamBuffer>, ConsumerGroupId) {
        let stream = Arc::new(StreamBuffer::new(&StreamConfig {
            name: "telemetry".into(),
            partitions: 1,
            max_records_per_partition: 10_000,
        }));
        let group = ConsumerGroupId::new("d");
        stream.register_group(group.clone(), StartingPosition::TrimHorizon);
        (stream, group)
    }

    fn append(stream: &StreamBuffer, n: usize) {
        for i in 0..n {
            stream
                .append(PartitionKey::new("k"), Payload::from(i.to_string().as_str()), 0)
                .unwrap();
        }
    }

    fn no_backoff() -> Backoff {
        Backoff {
            initial_delay_ms: 1,
            max_delay_ms: 1,
            jitter: 0.0,
            ..Backoff::default()
        }
    }

    fn start(
        stream: &Arc<StreamBuffer>,
        group: &ConsumerGroupId,
        unit: Arc<Recorder>,
        policy: BatchPolicy,
    ) -> (CancellationToken, JoinHandle<()>) {
        let source = StreamBatchSource::new(
            stream,
            group,
            PartitionId(0),
            5,
            Arc::new(DeadLetterQueue::new(100)),
        )
        .unwrap();
        let token = CancellationToken::new();
        let dispatcher = Arc::new(BatchDispatcher::new("test", unit, policy, no_backoff()));
        let handle = spawn_dispatcher(dispatcher, source, token.clone());
        (token, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn batch_never_exceeds_max_items() {
        let (s, g) = stream();
        append(&s, 25);
        let unit = Recorder::new(0);
        let policy = BatchPolicy::new(10, Duration::from_secs(60), WindowPolicy::FirstItem);
        let (token, handle) = start(&s, &g, unit.clone(), policy);

        tokio::time::sleep(Duration::from_secs(61)).await;
        token.cancel();
        handle.await.unwrap();

        let sizes: Vec<usize> = unit.calls().iter().map(|(_, b)| b.len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(s.lag(&g, PartitionId(0)).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_emitted_within_max_wait_of_first_item() {
        let (s, g) = stream();
        let unit = Recorder::new(0);
        let policy = BatchPolicy::new(100, Duration::from_secs(60), WindowPolicy::FirstItem);
        let (token, handle) = start(&s, &g, unit.clone(), policy);

        tokio::time::sleep(Duration::from_secs(10)).await;
        append(&s, 3);
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(unit.calls().is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;

        let calls = unit.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.len(), 3);
        assert!(calls[0].0 <= Duration::from_secs(70));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn tumbling_window_is_anchored_to_previous_invocation() {
        let (s, g) = stream();
        let unit = Recorder::new(0);
        let policy = BatchPolicy::new(100, Duration::from_secs(10), WindowPolicy::Tumbling);
        let (token, handle) = start(&s, &g, unit.clone(), policy);

        // Arrives late in the first window: dispatched at the window end,
        // not 10s after its arrival.
        tokio::time::sleep(Duration::from_secs(8)).await;
        append(&s, 1);
        tokio::time::sleep(Duration::from_secs(3)).await;

        let calls = unit.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0 >= Duration::from_secs(10) && calls[0].0 < Duration::from_secs(11));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_redelivered_from_committed_position() {
        let (s, g) = stream();
        append(&s, 3);
        let unit = Recorder::new(1);
        let policy = BatchPolicy::new(3, Duration::from_secs(1), WindowPolicy::FirstItem);
        let (token, handle) = start(&s, &g, unit.clone(), policy);

        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
        handle.await.unwrap();

        let calls = unit.calls();
        assert_eq!(calls.len(), 2);
        let first: Vec<_> = calls[0].1.items.iter().map(|i| i.position.clone()).collect();
        let second: Vec<_> = calls[1].1.items.iter().map(|i| i.position.clone()).collect();
        assert_eq!(first, second);
        assert_eq!(calls[1].1.max_attempt(), 2);
        assert_eq!(s.lag(&g, PartitionId(0)).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_discards_partial_batch() {
        let (s, g) = stream();
        append(&s, 2);
        let unit = Recorder::new(0);
        let policy = BatchPolicy::new(100, Duration::from_secs(60), WindowPolicy::FirstItem);
        let (token, handle) = start(&s, &g, unit.clone(), policy);

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(unit.calls().is_empty());
        assert_eq!(s.lag(&g, PartitionId(0)).unwrap(), 2);
        // The lease was released with the source.
        assert!(s.lease(&g, PartitionId(0)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_batch_redelivered_with_higher_attempt() {
        let queue = Arc::new(DelayQueue::new(QueueConfig {
            visibility_timeout_ms: 2_000,
            ..QueueConfig::new("presence")
        }));
        queue.enqueue(Payload::from("gone"), Duration::from_secs(5)).unwrap();

        let unit = Recorder::new(1);
        let token = CancellationToken::new();
        let dispatcher = Arc::new(BatchDispatcher::new(
            "presence",
            unit.clone(),
            BatchPolicy::new(10, Duration::from_millis(100), WindowPolicy::FirstItem),
            no_backoff(),
        ));
        let source = QueueBatchSource::new(queue.clone());
        let handle = spawn_dispatcher(dispatcher, source, token.clone());

        tokio::time::sleep(Duration::from_secs(10)).await;
        token.cancel();
        handle.await.unwrap();

        let calls = unit.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1.items[0].attempt, 1);
        assert_eq!(calls[1].1.items[0].attempt, 2);
        match (&calls[0].1.items[0].position, &calls[1].1.items[0].position) {
            (ItemPosition::Queue { item: a, .. }, ItemPosition::Queue { item: b, .. }) => {
                assert_eq!(a, b)
            }
            other => panic!("unexpected positions {other:?}"),
        }
        assert!(calls[0].0 >= Duration::from_secs(5));
        assert_eq!(queue.depth(), 0);
    }

    /// Fails reads with a transient error a few times before yielding.
    struct FlakySource {
        failures_left: u32,
        error: RelayError,
        delivered: bool,
    }

    impl BatchSource for FlakySource {
        fn origin(&self) -> BatchOrigin {
            BatchOrigin::Queue {
                queue: "flaky".into(),
            }
        }

        fn next_item(
            &mut self,
            deadline: Option<Instant>,
        ) -> Pin<Box<dyn Future<Output = Result<Option<BatchItem>, RelayError>> + Send + '_>> {
            Box::pin(async move {
                if self.failures_left > 0 {
                    self.failures_left -= 1;
                    return Err(self.error.clone());
                }
                if self.delivered {
                    if let Some(deadline) = deadline {
                        tokio::time::sleep_until(deadline).await;
                    } else {
                        std::future::pending::<()>().await;
                    }
                    return Ok(None);
                }
                self.delivered = true;
                Ok(Some(BatchItem {
                    payload: Payload::from("x"),
                    arrived_at_ms: 0,
                    attempt: 1,
                    position: ItemPosition::Stream {
                        key: PartitionKey::new("k"),
                        sequence: SequenceNumber(0),
                    },
                }))
            })
        }

        fn commit(&mut self, _batch: &Batch) -> Result<(), RelayError> {
            Ok(())
        }

        fn rollback(&mut self, _batch: &Batch, _error: &RelayError) -> Result<(), RelayError> {
            Ok(())
        }

        fn discard(&mut self, _items: &[BatchItem]) {}
    }

    #[tokio::test(start_paused = true)]
    async fn source_read_failures_are_retried() {
        let unit = Recorder::new(0);
        let token = CancellationToken::new();
        let dispatcher = Arc::new(BatchDispatcher::new(
            "flaky",
            unit.clone(),
            BatchPolicy::new(1, Duration::from_secs(1), WindowPolicy::FirstItem),
            no_backoff(),
        ));
        let stats = dispatcher.stats().clone();
        let handle = spawn_dispatcher(
            dispatcher,
            FlakySource {
                failures_left: 3,
                error: RelayError::io("broker unavailable"),
                delivered: false,
            },
            token.clone(),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(stats.read_failures(), 3);
        assert_eq!(stats.batches_committed(), 1);
        assert_eq!(unit.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_read_failure_stops_dispatcher() {
        let unit = Recorder::new(0);
        let dispatcher = BatchDispatcher::new(
            "broken",
            unit.clone(),
            BatchPolicy::new(1, Duration::from_secs(1), WindowPolicy::FirstItem),
            no_backoff(),
        );
        let mut source = FlakySource {
            failures_left: 1,
            error: RelayError::logic("partition lease lost"),
            delivered: false,
        };

        let stopped = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.run(&mut source, CancellationToken::new()),
        )
        .await;

        assert!(stopped.is_ok());
        assert_eq!(dispatcher.stats().read_failures(), 1);
        assert!(unit.calls().is_empty());
        assert!(!source.delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_leaves_partial_batch_for_the_next_run() {
        let (s, g) = stream();
        for body in ["a", "b"] {
            s.append(PartitionKey::new("k"), Payload::from(body), 0).unwrap();
        }
        let unit = Recorder::new(0);
        let dispatcher = BatchDispatcher::new(
            "test",
            unit.clone(),
            BatchPolicy::new(100, Duration::from_secs(60), WindowPolicy::FirstItem),
            no_backoff(),
        );
        let mut source =
            StreamBatchSource::new(&s, &g, PartitionId(0), 5, Arc::new(DeadLetterQueue::new(10)))
                .unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        dispatcher.run(&mut source, token).await;
        assert!(unit.calls().is_empty());

        s.append(PartitionKey::new("k"), Payload::from("c"), 0).unwrap();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(61)).await;
            canceller.cancel();
        });
        dispatcher.run(&mut source, token).await;

        let calls = unit.calls();
        assert_eq!(calls.len(), 1);
        let bodies: Vec<&[u8]> = calls[0].1.items.iter().map(|i| i.payload.as_bytes()).collect();
        assert_eq!(bodies, vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
        assert_eq!(calls[0].1.max_attempt(), 1);
        assert_eq!(s.lag(&g, PartitionId(0)).unwrap(), 0);
    }
}
