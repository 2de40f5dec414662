use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use relay_api::{Topic, TopicFilter};

use crate::protocol::Protocol;

/// Capability set granted by an `Allow` decision.
#[derive(Debug, Clone)]
pub struct Policy {
    pub principal: String,
    /// Topics the connection may publish on.
    pub publish: Vec<TopicFilter>,
    /// Connection is closed after this long, regardless of activity.
    pub disconnect_after: Duration,
    /// Clients are expected to re-authorize after this long.
    pub refresh_after: Duration,
    pub issued_at: Instant,
}

impl Policy {
    pub fn permits(&self, topic: &Topic) -> bool {
        self.publish.iter().any(|f| f.matches(topic))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.issued_at) >= self.disconnect_after
    }

    pub fn needs_refresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.issued_at) >= self.refresh_after
    }
}

/// Why a connection was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    UnknownIdentity,
    BadSecret,
    ProtocolNotAllowed(Option<Protocol>),
    /// Authorizer failed; admission fails closed.
    Internal(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::UnknownIdentity | DenyReason::BadSecret => {
                f.write_str("invalid credentials")
            }
            DenyReason::ProtocolNotAllowed(Some(p)) => write!(f, "protocol {p:?} not allowed"),
            DenyReason::ProtocolNotAllowed(None) => f.write_str("unknown protocol"),
            DenyReason::Internal(_) => f.write_str("authorization unavailable"),
        }
    }
}

/// Outcome of `AdmissionGate::authorize`.
#[derive(Debug, Clone)]
pub enum Decision {
    Allow(Policy),
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}
