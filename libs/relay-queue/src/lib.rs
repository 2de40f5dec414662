pub mod config;
pub mod dead_letter;
pub mod queue;

pub use config::QueueConfig;
pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use queue::{DelayQueue, Delivery};
