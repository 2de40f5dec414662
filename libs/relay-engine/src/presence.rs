//! Client presence and the disconnection lifecycle event.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use relay_api::{ClientId, RelayError, Topic};

/// Topic prefix of disconnection lifecycle events; the client id is the
/// last level.
pub const DISCONNECTED_TOPIC_PREFIX: &str = "$relay/events/presence/disconnected";

pub fn disconnected_topic(client_id: &ClientId) -> Result<Topic, RelayError> {
    Topic::parse(format!("{DISCONNECTED_TOPIC_PREFIX}/{client_id}"))
}

/// Body of a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub client_id: ClientId,
    pub event_type: PresenceEventType,
    /// Wall-clock milliseconds of the transition.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEventType {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default)]
struct ClientPresence {
    /// Open connections of this client id.
    connections: u32,
    last_connected_ms: i64,
    last_disconnected_ms: i64,
}

/// Live view of which client ids currently hold a connection.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    clients: Mutex<HashMap<ClientId, ClientPresence>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self, client_id: &ClientId, at_ms: i64) {
        let mut clients = self.lock();
        let entry = clients.entry(client_id.clone()).or_default();
        entry.connections += 1;
        entry.last_connected_ms = entry.last_connected_ms.max(at_ms);
    }

    /// Record a closed connection. Returns true when it was the client's
    /// last open connection.
    pub fn disconnected(&self, client_id: &ClientId, at_ms: i64) -> bool {
        let mut clients = self.lock();
        let Some(entry) = clients.get_mut(client_id) else {
            return false;
        };
        entry.connections = entry.connections.saturating_sub(1);
        entry.last_disconnected_ms = entry.last_disconnected_ms.max(at_ms);
        entry.connections == 0
    }

    pub fn is_connected(&self, client_id: &ClientId) -> bool {
        self.lock()
            .get(client_id)
            .is_some_and(|c| c.connections > 0)
    }

    pub fn last_connected_ms(&self, client_id: &ClientId) -> Option<i64> {
        self.lock().get(client_id).map(|c| c.last_connected_ms)
    }

    /// Whether a disconnection observed at `event_ms` still holds: the
    /// client has no open connection and did not connect after the event.
    pub fn disconnection_holds(&self, client_id: &ClientId, event_ms: i64) -> bool {
        match self.lock().get(client_id) {
            Some(c) => c.connections == 0 && c.last_connected_ms <= event_ms,
            None => true,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, ClientPresence>> {
        match self.clients.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("presence lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
