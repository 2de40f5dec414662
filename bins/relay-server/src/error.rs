use relay_api::RelayError;
use relay_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("{0}")]
    Relay(#[from] RelayError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
