use std::fmt;
use std::sync::Arc;

use crate::error::RelayError;
use crate::ids::{ClientId, ConnectionId};
use crate::topic::Topic;

/// Opaque payload bytes. Cheap to clone: rule fan-out shares one buffer
/// between every action that receives the message.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(Arc<[u8]>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, RelayError> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parse the bytes as JSON regardless of what the publisher intended.
    pub fn as_json(&self) -> Result<serde_json::Value, RelayError> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::from(s.as_bytes())
    }
}

/// Who published a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publisher {
    /// Admitted client connection.
    Client { connection: ConnectionId, client_id: ClientId },
    /// Engine-generated lifecycle event.
    System,
}

/// Admitted message. Immutable: the router and every action only read it.
#[derive(Debug, Clone)]
pub struct Message {
    topic: Topic,
    payload: Payload,
    arrived_at_ms: i64,
    publisher: Publisher,
}

impl Message {
    pub fn new(topic: Topic, payload: Payload, publisher: Publisher) -> Self {
        Self::with_arrival(topic, payload, publisher, crate::now_ms())
    }

    pub fn with_arrival(
        topic: Topic,
        payload: Payload,
        publisher: Publisher,
        arrived_at_ms: i64,
    ) -> Self {
        Self {
            topic,
            payload,
            arrived_at_ms,
            publisher,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn arrived_at_ms(&self) -> i64 {
        self.arrived_at_ms
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        match &self.publisher {
            Publisher::Client { client_id, .. } => Some(client_id),
            Publisher::System => None,
        }
    }
}
