use std::time::Duration;

use serde::Deserialize;

/// Default batch size for both source kinds.
pub const DEFAULT_MAX_ITEMS: usize = 100;
/// Default batching window for stream sources.
pub const DEFAULT_STREAM_MAX_WAIT: Duration = Duration::from_secs(60);
/// Default batching window for queue sources.
pub const DEFAULT_QUEUE_MAX_WAIT: Duration = Duration::from_secs(5);

/// When the `max_wait` clock starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    /// At the first item of the current batch. An idle source never produces
    /// an empty batch; the first item after a quiet period waits at most
    /// `max_wait` for company.
    #[default]
    FirstItem,
    /// At the previous invocation (or the previous empty window). Window
    /// boundaries are independent of item arrival.
    Tumbling,
}

/// Size and time thresholds of one dispatcher. Whichever is hit first
/// closes the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_items: usize,
    pub max_wait: Duration,
    pub window: WindowPolicy,
}

impl BatchPolicy {
    pub fn new(max_items: usize, max_wait: Duration, window: WindowPolicy) -> Self {
        Self {
            max_items: max_items.max(1),
            max_wait,
            window,
        }
    }

    pub fn stream_default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS, DEFAULT_STREAM_MAX_WAIT, WindowPolicy::FirstItem)
    }

    pub fn queue_default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS, DEFAULT_QUEUE_MAX_WAIT, WindowPolicy::FirstItem)
    }
}
