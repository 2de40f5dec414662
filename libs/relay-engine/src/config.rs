use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use relay_admission::AdmissionConfig;
use relay_api::{Backoff, QueueRef, StreamRef, UnitId};
use relay_dispatch::{
    BatchPolicy, DEFAULT_MAX_ITEMS, DEFAULT_QUEUE_MAX_WAIT, DEFAULT_STREAM_MAX_WAIT, WindowPolicy,
};
use relay_queue::QueueConfig;
use relay_router::{Action, Rule, RuleConfig};
use relay_stream::{StartingPosition, StreamConfig};

use crate::error::EngineError;

/// Root configuration: parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Address of the line-protocol ingress.
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub streams: Vec<StreamConfig>,

    #[serde(default)]
    pub queues: Vec<QueueConfig>,

    /// Evaluated in file order.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    #[serde(default)]
    pub dispatchers: Vec<DispatcherConfig>,

    /// Where `log_error` actions write: `"log"` or `"queue:<name>"`.
    #[serde(default)]
    pub error_destination: ErrorDestination,

    /// Period of the stream retention trim.
    #[serde(default = "default_retention_interval_ms")]
    pub retention_interval_ms: u64,

    /// Retry policy for transient errors at stream and queue boundaries.
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_app_name() -> String {
    "relay".into()
}
fn default_listen() -> String {
    "127.0.0.1:7878".into()
}
fn default_retention_interval_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ErrorDestination {
    #[default]
    Log,
    Queue(QueueRef),
}

impl TryFrom<String> for ErrorDestination {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "log" => Ok(Self::Log),
            other => match other.strip_prefix("queue:") {
                Some(name) if !name.is_empty() => Ok(Self::Queue(QueueRef::new(name))),
                _ => Err(format!(
                    "error_destination '{other}': expected \"log\" or \"queue:<name>\""
                )),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Dispatcher Config
// ═══════════════════════════════════════════════════════════════

/// `[[dispatchers]]` entry: one source, one handler.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    pub name: String,
    /// Stream source. Exactly one of `stream` and `queue` is set.
    #[serde(default)]
    pub stream: Option<StreamRef>,
    #[serde(default)]
    pub queue: Option<QueueRef>,
    /// Processing unit invoked with every batch.
    pub handler: UnitId,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Defaults to 60s for streams and 5s for queues.
    #[serde(default)]
    pub max_batching_window_ms: Option<u64>,
    #[serde(default)]
    pub window: WindowPolicy,
    /// Stream sources only.
    #[serde(default)]
    pub starting_position: StartingPosition,
    /// Stream sources only: deliveries of a failing batch before its
    /// records are dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Queue sources only: number of concurrent pollers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Queue sources only: overrides the queue's visibility timeout.
    #[serde(default)]
    pub visibility_timeout_ms: Option<u64>,
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

fn default_batch_size() -> usize {
    DEFAULT_MAX_ITEMS
}
fn default_max_attempts() -> u32 {
    3
}
fn default_concurrency() -> usize {
    1
}
fn default_dead_letter_capacity() -> usize {
    1_000
}

/// Resolved source of a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchSource {
    Stream(StreamRef),
    Queue(QueueRef),
}

impl DispatcherConfig {
    pub fn source(&self) -> Result<DispatchSource, EngineError> {
        match (&self.stream, &self.queue) {
            (Some(stream), None) => Ok(DispatchSource::Stream(stream.clone())),
            (None, Some(queue)) => Ok(DispatchSource::Queue(queue.clone())),
            _ => Err(EngineError::Config(format!(
                "dispatcher '{}': set exactly one of stream or queue",
                self.name
            ))),
        }
    }

    pub fn policy(&self) -> Result<BatchPolicy, EngineError> {
        let default_wait = match self.source()? {
            DispatchSource::Stream(_) => DEFAULT_STREAM_MAX_WAIT,
            DispatchSource::Queue(_) => DEFAULT_QUEUE_MAX_WAIT,
        };
        let max_wait = self
            .max_batching_window_ms
            .map(Duration::from_millis)
            .unwrap_or(default_wait);
        Ok(BatchPolicy::new(self.batch_size, max_wait, self.window))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Load / validate
// ═══════════════════════════════════════════════════════════════

impl RelayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Compile every rule and resolve every reference between sections.
    /// Handler names are resolved at bootstrap against the handler registry.
    pub fn validate(&self) -> Result<Vec<Rule>, EngineError> {
        let streams = unique("stream", self.streams.iter().map(|s| s.name.as_str()))?;
        let queues = unique("queue", self.queues.iter().map(|q| q.name.as_str()))?;
        unique("dispatcher", self.dispatchers.iter().map(|d| d.name.as_str()))?;
        unique("rule", self.rules.iter().map(|r| r.id.as_str()))?;

        for stream in &self.streams {
            if stream.partitions == 0 {
                return Err(EngineError::Config(format!(
                    "stream '{}': partitions must be at least 1",
                    stream.name
                )));
            }
        }

        let check_action = |rule: &RuleConfig, action: &Action| -> Result<(), EngineError> {
            match action {
                Action::PutToStream { stream, .. } if !streams.contains(stream.as_str()) => Err(
                    EngineError::Config(format!("rule '{}': unknown stream '{stream}'", rule.id)),
                ),
                Action::PutToQueue { queue, .. } if !queues.contains(queue.as_str()) => Err(
                    EngineError::Config(format!("rule '{}': unknown queue '{queue}'", rule.id)),
                ),
                _ => Ok(()),
            }
        };

        let mut rules = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            for action in rule.actions.iter().chain(rule.error_action.iter()) {
                check_action(rule, action)?;
            }
            let compiled = Rule::from_config(rule)
                .map_err(|e| EngineError::from(e).with_context(format!("rule '{}'", rule.id)))?;
            rules.push(compiled);
        }

        for dispatcher in &self.dispatchers {
            let known = match dispatcher.source()? {
                DispatchSource::Stream(s) => streams.contains(s.as_str()),
                DispatchSource::Queue(q) => queues.contains(q.as_str()),
            };
            if !known {
                return Err(EngineError::Config(format!(
                    "dispatcher '{}': unknown source",
                    dispatcher.name
                )));
            }
            if dispatcher.concurrency == 0 {
                return Err(EngineError::Config(format!(
                    "dispatcher '{}': concurrency must be at least 1",
                    dispatcher.name
                )));
            }
        }

        if let ErrorDestination::Queue(queue) = &self.error_destination {
            if !queues.contains(queue.as_str()) {
                return Err(EngineError::Config(format!(
                    "error_destination: unknown queue '{queue}'"
                )));
            }
        }

        Ok(rules)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_millis(self.retention_interval_ms.max(1))
    }
}

fn unique<'a>(
    kind: &str,
    names: impl Iterator<Item = &'a str>,
) -> Result<HashSet<&'a str>, EngineError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(EngineError::Config(format!("duplicate {kind} '{name}'")));
        }
    }
    Ok(seen)
}
