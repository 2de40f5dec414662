use std::time::Duration;

use serde::Deserialize;

use relay_api::QueueRef;

/// `[[queues]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueConfig {
    pub name: QueueRef,
    /// Delay applied by `enqueue_default`.
    #[serde(default = "default_delivery_delay_ms")]
    pub delivery_delay_ms: u64,
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
    /// Deliveries allowed per item before it is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

fn default_delivery_delay_ms() -> u64 {
    5_000
}
fn default_visibility_timeout_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_max_depth() -> usize {
    10_000
}
fn default_dead_letter_capacity() -> usize {
    1_000
}

impl QueueConfig {
    pub fn new(name: impl Into<QueueRef>) -> Self {
        Self {
            name: name.into(),
            delivery_delay_ms: default_delivery_delay_ms(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
            max_attempts: default_max_attempts(),
            max_depth: default_max_depth(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }

    pub fn delivery_delay(&self) -> Duration {
        Duration::from_millis(self.delivery_delay_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}
