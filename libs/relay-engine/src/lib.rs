pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod presence;

pub use config::{DispatchSource, DispatcherConfig, ErrorDestination, RelayConfig};
pub use connection::Connection;
pub use engine::Engine;
pub use error::EngineError;
pub use handlers::{
    DISCONNECT_CONFIRM_HANDLER, DisconnectConfirmer, HandlerRegistry, LOG_HANDLER, LogHandler,
};
pub use presence::{DISCONNECTED_TOPIC_PREFIX, PresenceEvent, PresenceEventType, PresenceRegistry};
