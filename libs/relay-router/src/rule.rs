use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use relay_api::{
    PartitionId, QueueItemId, QueueRef, RelayError, RuleId, SequenceNumber, StreamRef, Topic,
    TopicFilter,
};

use crate::partition::PartitionKeyExpr;
use crate::sql::{DEFAULT_QUEUE_RULE_SQL, DEFAULT_STREAM_RULE_SQL, parse_rule_sql};

/// Side effect attached to a rule.
///
/// ```toml
/// [[rules.actions]]
/// type = "put_to_stream"
/// stream = "telemetry"
/// partition_key = "${clientid()}"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    PutToStream {
        stream: StreamRef,
        #[serde(default)]
        partition_key: PartitionKeyExpr,
    },
    PutToQueue {
        queue: QueueRef,
        /// Overrides the queue's delivery delay.
        #[serde(default)]
        delay_ms: Option<u64>,
    },
    /// Writes a structured error record to the error sink.
    LogError,
}

impl Action {
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Action::PutToQueue { delay_ms, .. } => delay_ms.map(Duration::from_millis),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::PutToStream { stream, .. } => write!(f, "put_to_stream({stream})"),
            Action::PutToQueue { queue, .. } => write!(f, "put_to_queue({queue})"),
            Action::LogError => f.write_str("log_error"),
        }
    }
}

/// What a successful action did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionReceipt {
    Appended {
        stream: StreamRef,
        partition: PartitionId,
        sequence: SequenceNumber,
    },
    Enqueued {
        queue: QueueRef,
        item: QueueItemId,
    },
    Recorded,
}

/// Outcome of one action of one matching rule.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub rule: RuleId,
    pub action: String,
    pub outcome: Result<ActionReceipt, RelayError>,
    /// Set when the action failed and the rule has an error action.
    pub error_action: Option<Result<ActionReceipt, RelayError>>,
}

impl ActionResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Rule
// ═══════════════════════════════════════════════════════════════

/// `[[rules]]` entry. The predicate is either `topic` (a filter) or `sql`.
/// With neither, the default rule SQL is used: `iot/queue` when the first
/// action puts to a queue, `iot/stream` otherwise.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuleConfig {
    pub id: RuleId,
    #[serde(default)]
    pub topic: Option<TopicFilter>,
    #[serde(default)]
    pub sql: Option<String>,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub error_action: Option<Action>,
}

/// Topic predicate plus the actions it triggers.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: RuleId,
    pub filter: TopicFilter,
    pub actions: Vec<Action>,
    pub error_action: Option<Action>,
}

impl Rule {
    pub fn new(id: impl Into<RuleId>, filter: TopicFilter, actions: Vec<Action>) -> Self {
        Self {
            id: id.into(),
            filter,
            actions,
            error_action: None,
        }
    }

    pub fn with_error_action(mut self, action: Action) -> Self {
        self.error_action = Some(action);
        self
    }

    pub fn from_config(config: &RuleConfig) -> Result<Self, RelayError> {
        let filter = match (&config.topic, &config.sql) {
            (Some(_), Some(_)) => {
                return Err(RelayError::config(format!(
                    "rule '{}': set either topic or sql, not both",
                    config.id
                )));
            }
            (Some(filter), None) => filter.clone(),
            (None, Some(sql)) => parse_rule_sql(sql)?,
            (None, None) => {
                let sql = match config.actions.first() {
                    Some(Action::PutToQueue { .. }) => DEFAULT_QUEUE_RULE_SQL,
                    _ => DEFAULT_STREAM_RULE_SQL,
                };
                parse_rule_sql(sql)?
            }
        };
        if config.actions.is_empty() {
            return Err(RelayError::config(format!("rule '{}' has no actions", config.id)));
        }
        Ok(Self {
            id: config.id.clone(),
            filter,
            actions: config.actions.clone(),
            error_action: config.error_action.clone(),
        })
    }

    /// Side-effect free predicate.
    pub fn matches(&self, topic: &Topic) -> bool {
        self.filter.matches(topic)
    }
}
