use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use relay_admission::{AdmissionGate, ConnectionMetadata, Credential, Decision};
use relay_api::{
    ConnectionId, ConsumerGroupId, ErrorSink, Payload, ProcessingUnit, QueueRef, RelayError,
    StreamRef, Topic,
};
use relay_dispatch::{
    BatchDispatcher, DispatchStats, QueueBatchSource, StreamBatchSource, spawn_dispatcher,
};
use relay_queue::{DeadLetterQueue, DelayQueue};
use relay_router::{ActionResult, QueueErrorSink, Router, Targets, TracingErrorSink};
use relay_stream::StreamBuffer;

use crate::config::{DispatchSource, DispatcherConfig, ErrorDestination, RelayConfig};
use crate::connection::{Connection, Shared};
use crate::error::EngineError;
use crate::handlers::{DisconnectConfirmer, HandlerRegistry, LogHandler};
use crate::presence::PresenceRegistry;

/// Background task + its name, for logging at shutdown.
struct TaskSlot {
    name: String,
    handle: JoinHandle<()>,
}

/// Counters and dead letters of one `[[dispatchers]]` entry, shared by all
/// of its tasks.
struct DispatcherSlot {
    stats: Arc<DispatchStats>,
    dead_letters: Arc<DeadLetterQueue>,
}

/// The running engine: admission, routing, buffers and dispatcher tasks.
pub struct Engine {
    shared: Arc<Shared>,
    gate: AdmissionGate,
    streams: HashMap<StreamRef, Arc<StreamBuffer>>,
    queues: HashMap<QueueRef, Arc<DelayQueue>>,
    dispatchers: HashMap<String, DispatcherSlot>,
    handlers: Arc<HandlerRegistry>,
    confirmer: Arc<DisconnectConfirmer>,
    next_connection: AtomicU64,
    tasks: Vec<TaskSlot>,
    token: CancellationToken,
    config: RelayConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("tasks", &self.tasks.len())
            .field("app_name", &self.config.app_name)
            .finish()
    }
}

impl Engine {
    /// Bootstrap the engine from a parsed configuration.
    ///
    /// Builds streams and queues, wires the router to them, then spawns one
    /// dispatcher task per stream partition (or per queue poller) and the
    /// retention task. Handlers not supplied in `handlers` fall back to the
    /// built-ins.
    pub async fn bootstrap(
        config: RelayConfig,
        handlers: HandlerRegistry,
    ) -> Result<Self, EngineError> {
        let rules = config.validate()?;
        let gate = AdmissionGate::from_config(&config.admission);

        // --- 1. Streams and queues ---
        let mut streams = HashMap::new();
        for stream_cfg in &config.streams {
            let stream = Arc::new(StreamBuffer::new(stream_cfg));
            tracing::info!(
                stream = %stream_cfg.name,
                partitions = stream_cfg.partitions,
                "created stream"
            );
            streams.insert(stream_cfg.name.clone(), stream);
        }
        let mut queues = HashMap::new();
        for queue_cfg in &config.queues {
            let queue = Arc::new(DelayQueue::new(queue_cfg.clone()));
            tracing::info!(
                queue = %queue_cfg.name,
                delivery_delay_ms = queue_cfg.delivery_delay_ms,
                visibility_timeout_ms = queue_cfg.visibility_timeout_ms,
                "created queue"
            );
            queues.insert(queue_cfg.name.clone(), queue);
        }

        // --- 2. Router ---
        let mut targets = Targets::new();
        for (name, stream) in &streams {
            targets = targets.with_stream(name.clone(), stream.clone());
        }
        for (name, queue) in &queues {
            targets = targets.with_queue(name.clone(), queue.clone());
        }
        let error_sink: Arc<dyn ErrorSink> = match &config.error_destination {
            ErrorDestination::Log => Arc::new(TracingErrorSink),
            ErrorDestination::Queue(name) => {
                let queue = queues.get(name).ok_or_else(|| {
                    EngineError::Config(format!("error_destination: unknown queue '{name}'"))
                })?;
                Arc::new(QueueErrorSink::new(queue.clone()))
            }
        };
        let router = Router::new(rules, targets, error_sink, config.backoff.clone())?;

        // --- 3. Handlers ---
        let presence = Arc::new(PresenceRegistry::new());
        let handlers = Arc::new(handlers);
        let confirmer = Arc::new(DisconnectConfirmer::new(presence.clone()));
        handlers.register_default(Arc::new(LogHandler::default()));
        handlers.register_default(confirmer.clone());

        // --- 4. Dispatchers ---
        // Every handler is resolved before the first task starts.
        let mut units = Vec::with_capacity(config.dispatchers.len());
        for dispatcher_cfg in &config.dispatchers {
            let unit = handlers.get(&dispatcher_cfg.handler).ok_or_else(|| {
                EngineError::HandlerNotFound(dispatcher_cfg.handler.to_string())
                    .with_context(format!("dispatcher '{}'", dispatcher_cfg.name))
            })?;
            units.push(unit);
        }

        let token = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut dispatchers = HashMap::new();
        for (dispatcher_cfg, unit) in config.dispatchers.iter().zip(units) {
            let spawned = spawn_dispatchers(
                dispatcher_cfg,
                unit,
                &streams,
                &queues,
                &config,
                &token,
                &mut tasks,
            );
            match spawned {
                Ok(slot) => {
                    dispatchers.insert(dispatcher_cfg.name.clone(), slot);
                }
                Err(e) => {
                    stop_tasks(&token, tasks).await;
                    return Err(e.with_context(format!("dispatcher '{}'", dispatcher_cfg.name)));
                }
            }
        }

        // --- 5. Retention ---
        if !streams.is_empty() {
            tasks.push(TaskSlot {
                name: "retention".into(),
                handle: spawn_retention(
                    streams.values().cloned().collect(),
                    config.retention_interval(),
                    token.child_token(),
                ),
            });
        }

        tracing::info!(
            app = %config.app_name,
            rules = router.rules().len(),
            tasks = tasks.len(),
            "engine started"
        );

        Ok(Engine {
            shared: Arc::new(Shared { router, presence }),
            gate,
            streams,
            queues,
            dispatchers,
            handlers,
            confirmer,
            next_connection: AtomicU64::new(1),
            tasks,
            token,
            config,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.shared.router
    }

    pub fn stream(&self, name: &StreamRef) -> Option<&Arc<StreamBuffer>> {
        self.streams.get(name)
    }

    pub fn queue(&self, name: &QueueRef) -> Option<&Arc<DelayQueue>> {
        self.queues.get(name)
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.shared.presence
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// The built-in `disconnect-confirm` unit.
    pub fn disconnect_confirmer(&self) -> &Arc<DisconnectConfirmer> {
        &self.confirmer
    }

    pub fn dispatcher_stats(&self, name: &str) -> Option<&Arc<DispatchStats>> {
        self.dispatchers.get(name).map(|d| &d.stats)
    }

    /// Dead letters of a dispatcher. Queue dispatchers share the queue's
    /// dead-letter queue.
    pub fn dead_letters(&self, name: &str) -> Option<&Arc<DeadLetterQueue>> {
        self.dispatchers.get(name).map(|d| &d.dead_letters)
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    /// Run the admission gate. A denied connection gets an `Auth` error and
    /// no policy, so none of its messages are ever routed.
    pub fn connect(
        &self,
        meta: ConnectionMetadata,
        credential: &Credential,
    ) -> Result<Connection, RelayError> {
        match self.gate.authorize(&meta, credential) {
            Decision::Allow(policy) => {
                self.shared.presence.connected(&meta.client_id, relay_api::now_ms());
                Ok(Connection::new(self.shared.clone(), meta, policy))
            }
            Decision::Deny(reason) => Err(RelayError::auth(reason.to_string())),
        }
    }

    /// Route a message published by the engine itself.
    pub async fn publish_system(&self, topic: Topic, payload: Payload) -> Vec<ActionResult> {
        self.shared.publish_system(topic, payload).await
    }

    /// Graceful shutdown: cancel every task and wait for them. Partial
    /// batches are dropped uncommitted and redelivered on the next start.
    pub async fn shutdown(self) {
        stop_tasks(&self.token, self.tasks).await;
        tracing::info!("engine shut down");
    }
}

async fn stop_tasks(token: &CancellationToken, tasks: Vec<TaskSlot>) {
    token.cancel();
    for slot in tasks {
        if let Err(e) = slot.handle.await {
            tracing::warn!(task = %slot.name, error = %e, "task ended abnormally");
        }
    }
}

// ---------------------------------------------------------------------------
// Spawn the tasks of one dispatcher entry
// ---------------------------------------------------------------------------

fn spawn_dispatchers(
    cfg: &DispatcherConfig,
    unit: Arc<dyn ProcessingUnit>,
    streams: &HashMap<StreamRef, Arc<StreamBuffer>>,
    queues: &HashMap<QueueRef, Arc<DelayQueue>>,
    config: &RelayConfig,
    token: &CancellationToken,
    tasks: &mut Vec<TaskSlot>,
) -> Result<DispatcherSlot, EngineError> {
    let policy = cfg.policy()?;
    let stats = Arc::new(DispatchStats::default());

    let dead_letters = match cfg.source()? {
        DispatchSource::Stream(name) => {
            let stream = streams
                .get(&name)
                .ok_or_else(|| EngineError::Config(format!("unknown stream '{name}'")))?;
            let group = ConsumerGroupId::new(cfg.name.as_str());
            stream.register_group(group.clone(), cfg.starting_position);
            let dead_letters = Arc::new(DeadLetterQueue::new(cfg.dead_letter_capacity));

            for partition in stream.partition_ids() {
                let source = StreamBatchSource::new(
                    stream,
                    &group,
                    partition,
                    cfg.max_attempts,
                    dead_letters.clone(),
                )?;
                let task_name = format!("{}/{}", cfg.name, partition);
                let dispatcher = BatchDispatcher::new(
                    task_name.clone(),
                    unit.clone(),
                    policy,
                    config.backoff.clone(),
                )
                .with_stats(stats.clone());
                tasks.push(TaskSlot {
                    name: task_name,
                    handle: spawn_dispatcher(Arc::new(dispatcher), source, token.child_token()),
                });
            }
            tracing::info!(
                dispatcher = %cfg.name,
                stream = %name,
                partitions = stream.partition_count(),
                handler = %cfg.handler,
                "spawned stream dispatcher"
            );
            dead_letters
        }
        DispatchSource::Queue(name) => {
            let queue = queues
                .get(&name)
                .ok_or_else(|| EngineError::Config(format!("unknown queue '{name}'")))?;
            for poller in 0..cfg.concurrency {
                let mut source = QueueBatchSource::new(queue.clone());
                if let Some(ms) = cfg.visibility_timeout_ms {
                    source = source.with_visibility_timeout(Duration::from_millis(ms));
                }
                let task_name = format!("{}/{}", cfg.name, poller);
                let dispatcher = BatchDispatcher::new(
                    task_name.clone(),
                    unit.clone(),
                    policy,
                    config.backoff.clone(),
                )
                .with_stats(stats.clone());
                tasks.push(TaskSlot {
                    name: task_name,
                    handle: spawn_dispatcher(Arc::new(dispatcher), source, token.child_token()),
                });
            }
            tracing::info!(
                dispatcher = %cfg.name,
                queue = %name,
                concurrency = cfg.concurrency,
                handler = %cfg.handler,
                "spawned queue dispatcher"
            );
            queue.dead_letters().clone()
        }
    };

    Ok(DispatcherSlot { stats, dead_letters })
}

/// Periodically drop stream records every consumer group has committed.
fn spawn_retention(
    streams: Vec<Arc<StreamBuffer>>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    for stream in &streams {
                        let trimmed = stream.trim_consumed();
                        if trimmed > 0 {
                            tracing::debug!(stream = %stream.name(), trimmed, "retention trim");
                        }
                    }
                }
            }
        }
    })
}
