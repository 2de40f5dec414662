use std::fmt;

/// Error kind. Lets callers decide between retry, skip and fail fast
/// without matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration: permanent, fail at startup.
    Config,
    /// Storage or broker unavailable: transient, retried with backoff.
    Io,
    /// Malformed message or payload: skip, never retried.
    Format,
    /// Admission denied or capability missing: never retried.
    Auth,
    /// Buffer or queue depth limit reached: surfaced to the caller.
    Overflow,
    /// Processing unit reported failure for a batch.
    Processing,
    /// Logical error (not found, invalid state, stale receipt).
    Logic,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config => f.write_str("config"),
            ErrorKind::Io => f.write_str("io"),
            ErrorKind::Format => f.write_str("format"),
            ErrorKind::Auth => f.write_str("auth"),
            ErrorKind::Overflow => f.write_str("overflow"),
            ErrorKind::Processing => f.write_str("processing"),
            ErrorKind::Logic => f.write_str("logic"),
        }
    }
}

/// Error returned across component boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RelayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, message: msg.into() }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Format, message: msg.into() }
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Auth, message: msg.into() }
    }

    pub fn overflow(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Overflow, message: msg.into() }
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Processing, message: msg.into() }
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Logic, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Transient infrastructure errors are the only ones worth retrying.
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Io
    }

    /// Add context to the error, preserving the original ErrorKind.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RelayError {}

// ---------------------------------------------------------------------------
// From impls: standard error types → RelayError with correct ErrorKind
// ---------------------------------------------------------------------------

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::format(e.to_string())
    }
}

impl From<std::str::Utf8Error> for RelayError {
    fn from(e: std::str::Utf8Error) -> Self {
        Self::format(e.to_string())
    }
}
