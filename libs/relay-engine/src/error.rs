use relay_api::RelayError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("handler not registered: {0}")]
    HandlerNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Add context to the error.
    ///
    /// For the `Relay` variant, context is added to the inner `RelayError`.
    /// For other variants, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Relay(e) => EngineError::Relay(e.with_context(ctx)),
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            EngineError::HandlerNotFound(msg) => {
                EngineError::HandlerNotFound(format!("{ctx}: {msg}"))
            }
            other => other,
        }
    }
}
