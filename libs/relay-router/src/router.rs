use std::sync::Arc;

use futures_util::future::join_all;

use relay_api::{Backoff, ErrorRecord, ErrorSink, Message, Payload, RelayError};

use crate::rule::{Action, ActionReceipt, ActionResult, Rule};
use crate::target::Targets;

/// Evaluates rules against admitted messages and runs their actions.
///
/// Routing keeps no per-message state. Routing the same message twice runs
/// every matching action twice: there is no deduplication, so a publisher
/// that retries a publish may produce duplicate records and queue items.
/// Consumers that need exactly-once effects must deduplicate themselves.
pub struct Router {
    rules: Vec<Rule>,
    targets: Targets,
    error_sink: Arc<dyn ErrorSink>,
    backoff: Backoff,
}

impl Router {
    /// Every stream and queue referenced by a rule must exist in `targets`.
    pub fn new(
        rules: Vec<Rule>,
        targets: Targets,
        error_sink: Arc<dyn ErrorSink>,
        backoff: Backoff,
    ) -> Result<Self, RelayError> {
        for rule in &rules {
            for action in rule.actions.iter().chain(rule.error_action.iter()) {
                match action {
                    Action::PutToStream { stream, .. } if targets.stream(stream).is_none() => {
                        return Err(RelayError::config(format!(
                            "rule '{}': unknown stream '{stream}'",
                            rule.id
                        )));
                    }
                    Action::PutToQueue { queue, .. } if targets.queue(queue).is_none() => {
                        return Err(RelayError::config(format!(
                            "rule '{}': unknown queue '{queue}'",
                            rule.id
                        )));
                    }
                    _ => {}
                }
            }
            tracing::debug!(
                rule = %rule.id,
                filter = %rule.filter.as_str(),
                actions = rule.actions.len(),
                "rule loaded"
            );
        }
        Ok(Self {
            rules,
            targets,
            error_sink,
            backoff,
        })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Run every action of every rule whose filter matches the topic.
    /// Actions run concurrently and independently: a failed or retrying
    /// action does not hold up its siblings, and a failure triggers the
    /// rule's error action if any. Results come back in rule order.
    pub async fn route(&self, message: &Message) -> Vec<ActionResult> {
        let runs = self
            .rules
            .iter()
            .filter(|r| r.matches(message.topic()))
            .flat_map(|rule| rule.actions.iter().map(move |action| (rule, action)))
            .map(|(rule, action)| self.run_action(rule, action, message));
        let results = join_all(runs).await;

        if results.is_empty() {
            tracing::trace!(topic = %message.topic(), "no rule matched");
        }
        results
    }

    async fn run_action(&self, rule: &Rule, action: &Action, message: &Message) -> ActionResult {
        let outcome = self.execute(rule, action, message).await;

        let error_action = match &outcome {
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(
                    rule = %rule.id,
                    topic = %message.topic(),
                    action = %action,
                    error = %e,
                    "action failed"
                );
                self.on_failure(rule, action, message, e).await
            }
        };

        ActionResult {
            rule: rule.id.clone(),
            action: action.to_string(),
            outcome,
            error_action,
        }
    }

    async fn execute(
        &self,
        rule: &Rule,
        action: &Action,
        message: &Message,
    ) -> Result<ActionReceipt, RelayError> {
        match action {
            Action::LogError => {
                let record =
                    self.error_record(rule, action, message, "matched log_error action".into());
                self.error_sink.record(record).await?;
                Ok(ActionReceipt::Recorded)
            }
            _ => self.deliver(action, message, message.payload()).await,
        }
    }

    /// Append or enqueue `payload`, retrying transient target errors.
    async fn deliver(
        &self,
        action: &Action,
        message: &Message,
        payload: &Payload,
    ) -> Result<ActionReceipt, RelayError> {
        let what = action.to_string();
        match action {
            Action::PutToStream {
                stream,
                partition_key,
            } => {
                let target = self
                    .targets
                    .stream(stream)
                    .ok_or_else(|| RelayError::logic(format!("unknown stream '{stream}'")))?;
                let key = partition_key.evaluate(message)?;
                let receipt = self
                    .backoff
                    .retry(&what, || {
                        let result =
                            target.append(key.clone(), payload.clone(), message.arrived_at_ms());
                        async move { result }
                    })
                    .await?;
                Ok(ActionReceipt::Appended {
                    stream: stream.clone(),
                    partition: receipt.partition,
                    sequence: receipt.sequence,
                })
            }
            Action::PutToQueue { queue, .. } => {
                let target = self
                    .targets
                    .queue(queue)
                    .ok_or_else(|| RelayError::logic(format!("unknown queue '{queue}'")))?;
                let delay = action.delay();
                let item = self
                    .backoff
                    .retry(&what, || {
                        let result = target.enqueue(payload.clone(), delay);
                        async move { result }
                    })
                    .await?;
                Ok(ActionReceipt::Enqueued {
                    queue: queue.clone(),
                    item,
                })
            }
            Action::LogError => Ok(ActionReceipt::Recorded),
        }
    }

    /// Run the rule's error action with a record that identifies the failure.
    /// The original payload is never forwarded.
    async fn on_failure(
        &self,
        rule: &Rule,
        failed: &Action,
        message: &Message,
        error: &RelayError,
    ) -> Option<Result<ActionReceipt, RelayError>> {
        let error_action = rule.error_action.as_ref()?;
        let record = self.error_record(rule, failed, message, error.to_string());

        let result = match error_action {
            Action::LogError => self
                .error_sink
                .record(record)
                .await
                .map(|()| ActionReceipt::Recorded),
            other => match serde_json::to_vec(&record) {
                Ok(body) => self.deliver(other, message, &Payload::from(body)).await,
                Err(e) => Err(e.into()),
            },
        };

        if let Err(e) = &result {
            tracing::error!(
                rule = %rule.id,
                topic = %message.topic(),
                action = %error_action,
                error = %e,
                "error action failed"
            );
        }
        Some(result)
    }

    fn error_record(
        &self,
        rule: &Rule,
        action: &Action,
        message: &Message,
        reason: String,
    ) -> ErrorRecord {
        ErrorRecord {
            topic: message.topic().to_string(),
            rule: rule.id.clone(),
            action: action.to_string(),
            reason,
            ts_ms: relay_api::now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use relay_api::{
        ClientId, ConnectionId, ErrorKind, PartitionId, PartitionKey, Publisher, QueueItemId,
        SequenceNumber, Topic, TopicFilter,
    };
    use relay_queue::{DelayQueue, QueueConfig};
    use relay_stream::{AppendReceipt, Position, StreamBuffer, StreamConfig};

    use crate::partition::PartitionKeyExpr;
    use crate::sink::MemoryErrorSink;
    use crate::target::{QueueTarget, StreamTarget};

    fn message(topic: &str, body: &str) -> Message {
        Message::new(
            Topic::parse(topic).unwrap(),
            Payload::from(body),
            Publisher::Client {
                connection: ConnectionId(1),
                client_id: ClientId::new("dev-1"),
            },
        )
    }

    fn put_to_stream(stream: &str) -> Action {
        Action::PutToStream {
            stream: stream.into(),
            partition_key: PartitionKeyExpr::ClientId,
        }
    }

    fn rule(id: &str, filter: &str, actions: Vec<Action>) -> Rule {
        Rule::new(id, TopicFilter::parse(filter).unwrap(), actions)
    }

    fn no_retry() -> Backoff {
        Backoff {
            max_retries: 0,
            ..Backoff::default()
        }
    }

    /// Counts appends and fails the first `fail_first` with `kind`.
    struct CountingStream {
        calls: AtomicU32,
        fail_first: u32,
        kind: ErrorKind,
    }

    impl CountingStream {
        fn new(fail_first: u32, kind: ErrorKind) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first,
                kind,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl StreamTarget for CountingStream {
        fn append(
            &self,
            _key: PartitionKey,
            _payload: Payload,
            _arrived_at_ms: i64,
        ) -> Result<AppendReceipt, RelayError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(RelayError {
                    kind: self.kind,
                    message: "storage unavailable".into(),
                });
            }
            Ok(AppendReceipt {
                partition: PartitionId(0),
                sequence: SequenceNumber(u64::from(n)),
            })
        }
    }

    struct RecordingQueue(std::sync::Mutex<Vec<Payload>>);

    impl QueueTarget for RecordingQueue {
        fn enqueue(
            &self,
            payload: Payload,
            _delay: Option<Duration>,
        ) -> Result<QueueItemId, RelayError> {
            let mut items = self.0.lock().unwrap();
            items.push(payload);
            Ok(QueueItemId(items.len() as u64 - 1))
        }
    }

    #[tokio::test]
    async fn invokes_exactly_the_matching_rules() {
        let a = CountingStream::new(0, ErrorKind::Io);
        let b = CountingStream::new(0, ErrorKind::Io);
        let c = CountingStream::new(0, ErrorKind::Io);
        let targets = Targets::new()
            .with_stream("a", a.clone())
            .with_stream("b", b.clone())
            .with_stream("c", c.clone());
        let router = Router::new(
            vec![
                rule("exact", "iot/stream", vec![put_to_stream("a")]),
                rule("single", "iot/+", vec![put_to_stream("b")]),
                rule("other", "fleet/#", vec![put_to_stream("c")]),
            ],
            targets,
            Arc::new(MemoryErrorSink::new()),
            no_retry(),
        )
        .unwrap();

        let results = router.route(&message("iot/stream", "{}")).await;
        let rules: Vec<_> = results.iter().map(|r| r.rule.as_str()).collect();
        assert_eq!(rules, vec!["exact", "single"]);
        assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 0));

        let results = router.route(&message("iot/stream/extra", "{}")).await;
        assert!(results.is_empty());
        assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 0));
    }

    #[tokio::test]
    async fn failed_action_does_not_stop_siblings() {
        let broken = CountingStream::new(u32::MAX, ErrorKind::Overflow);
        let healthy = CountingStream::new(0, ErrorKind::Io);
        let targets = Targets::new()
            .with_stream("broken", broken.clone())
            .with_stream("healthy", healthy.clone());
        let router = Router::new(
            vec![rule("fanout", "iot/#", vec![put_to_stream("broken"), put_to_stream("healthy")])],
            targets,
            Arc::new(MemoryErrorSink::new()),
            no_retry(),
        )
        .unwrap();

        let results = router.route(&message("iot/stream", "{}")).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].outcome.as_ref().unwrap_err().kind(), ErrorKind::Overflow);
        assert!(results[0].error_action.is_none());
        assert!(results[1].is_ok());
        assert_eq!(healthy.calls(), 1);
    }

    #[tokio::test]
    async fn error_action_gets_failure_context_not_payload() {
        let broken = CountingStream::new(u32::MAX, ErrorKind::Overflow);
        let sink = Arc::new(MemoryErrorSink::new());
        let router = Router::new(
            vec![
                rule("ingest", "iot/stream", vec![put_to_stream("telemetry")])
                    .with_error_action(Action::LogError),
            ],
            Targets::new().with_stream("telemetry", broken),
            sink.clone(),
            no_retry(),
        )
        .unwrap();

        let results = router.route(&message("iot/stream", "{\"secret\":42}")).await;
        assert!(matches!(results[0].error_action, Some(Ok(ActionReceipt::Recorded))));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "iot/stream");
        assert_eq!(records[0].rule.as_str(), "ingest");
        assert_eq!(records[0].action, "put_to_stream(telemetry)");
        assert!(records[0].reason.contains("overflow"));
        assert!(!records[0].reason.contains("secret"));
    }

    #[tokio::test]
    async fn queue_error_action_receives_serialized_record() {
        let broken = CountingStream::new(u32::MAX, ErrorKind::Overflow);
        let errors = Arc::new(RecordingQueue(Default::default()));
        let router = Router::new(
            vec![rule("ingest", "iot/stream", vec![put_to_stream("telemetry")]).with_error_action(
                Action::PutToQueue {
                    queue: "errors".into(),
                    delay_ms: None,
                },
            )],
            Targets::new()
                .with_stream("telemetry", broken)
                .with_queue("errors", errors.clone()),
            Arc::new(MemoryErrorSink::new()),
            no_retry(),
        )
        .unwrap();

        router.route(&message("iot/stream", "payload-bytes")).await;
        let items = errors.0.lock().unwrap();
        assert_eq!(items.len(), 1);
        let record: ErrorRecord = serde_json::from_slice(items[0].as_bytes()).unwrap();
        assert_eq!(record.rule.as_str(), "ingest");
        assert!(!String::from_utf8_lossy(items[0].as_bytes()).contains("payload-bytes"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_with_backoff() {
        let flaky = CountingStream::new(2, ErrorKind::Io);
        let router = Router::new(
            vec![rule("ingest", "iot/stream", vec![put_to_stream("telemetry")])],
            Targets::new().with_stream("telemetry", flaky.clone()),
            Arc::new(MemoryErrorSink::new()),
            Backoff::default(),
        )
        .unwrap();

        let results = router.route(&message("iot/stream", "{}")).await;
        assert!(results[0].is_ok());
        assert_eq!(flaky.calls(), 3);
    }

    /// Records the (paused) time of every append.
    #[derive(Default)]
    struct TimedStream(std::sync::Mutex<Vec<tokio::time::Instant>>);

    impl StreamTarget for TimedStream {
        fn append(
            &self,
            _key: PartitionKey,
            _payload: Payload,
            _arrived_at_ms: i64,
        ) -> Result<AppendReceipt, RelayError> {
            let mut times = self.0.lock().unwrap();
            times.push(tokio::time::Instant::now());
            Ok(AppendReceipt {
                partition: PartitionId(0),
                sequence: SequenceNumber(times.len() as u64 - 1),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_action_does_not_delay_siblings() {
        let flaky = CountingStream::new(2, ErrorKind::Io);
        let timed = Arc::new(TimedStream::default());
        let router = Router::new(
            vec![
                rule("first", "iot/#", vec![put_to_stream("flaky")]),
                rule("second", "iot/#", vec![put_to_stream("timed")]),
            ],
            Targets::new()
                .with_stream("flaky", flaky.clone())
                .with_stream("timed", timed.clone()),
            Arc::new(MemoryErrorSink::new()),
            Backoff::default(),
        )
        .unwrap();

        let start = tokio::time::Instant::now();
        let results = router.route(&message("iot/stream", "{}")).await;

        assert!(start.elapsed() >= Duration::from_millis(100));
        let rules: Vec<_> = results.iter().map(|r| r.rule.as_str()).collect();
        assert_eq!(rules, vec!["first", "second"]);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(flaky.calls(), 3);
        assert_eq!(timed.0.lock().unwrap().as_slice(), &[start]);
    }

    #[tokio::test]
    async fn replay_produces_independent_deliveries() {
        let stream = Arc::new(StreamBuffer::new(&StreamConfig::new("telemetry")));
        let router = Router::new(
            vec![rule("ingest", "iot/stream", vec![put_to_stream("telemetry")])],
            Targets::new().with_stream("telemetry", stream.clone()),
            Arc::new(MemoryErrorSink::new()),
            no_retry(),
        )
        .unwrap();

        let m = message("iot/stream", "same");
        let first = router.route(&m).await;
        let second = router.route(&m).await;
        assert!(first[0].is_ok() && second[0].is_ok());
        assert_ne!(first[0].outcome, second[0].outcome);
        assert_eq!(stream.total_depth(), 2);

        let partition = stream.partition_for(&PartitionKey::new("dev-1"));
        let mut reader = stream.read_from(partition, Position::TrimHorizon).unwrap();
        assert_eq!(reader.try_next().unwrap().payload.as_bytes(), b"same");
        assert_eq!(reader.try_next().unwrap().payload.as_bytes(), b"same");
    }

    #[tokio::test(start_paused = true)]
    async fn put_to_queue_honors_delay_override() {
        let queue = Arc::new(DelayQueue::new(QueueConfig::new("presence")));
        let router = Router::new(
            vec![rule(
                "presence",
                "iot/queue",
                vec![Action::PutToQueue {
                    queue: "presence".into(),
                    delay_ms: Some(1_000),
                }],
            )],
            Targets::new().with_queue("presence", queue.clone()),
            Arc::new(MemoryErrorSink::new()),
            no_retry(),
        )
        .unwrap();

        let results = router.route(&message("iot/queue", "gone")).await;
        assert!(matches!(results[0].outcome, Ok(ActionReceipt::Enqueued { .. })));
        assert!(queue.poll(Duration::from_secs(30)).is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(queue.poll(Duration::from_secs(30)).is_some());
    }

    #[test]
    fn unknown_targets_are_rejected_at_construction() {
        let result = Router::new(
            vec![rule("r", "a", vec![put_to_stream("missing")])],
            Targets::new(),
            Arc::new(MemoryErrorSink::new()),
            no_retry(),
        );
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Config));
    }
}
