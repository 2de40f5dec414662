pub mod dispatcher;
pub mod policy;
pub mod source;

pub use dispatcher::{BatchDispatcher, DispatchStats, spawn_dispatcher};
pub use policy::{
    BatchPolicy, DEFAULT_MAX_ITEMS, DEFAULT_QUEUE_MAX_WAIT, DEFAULT_STREAM_MAX_WAIT, WindowPolicy,
};
pub use source::{BatchSource, QueueBatchSource, StreamBatchSource};
