use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use relay_api::{ClientId, ConnectionId};

/// Transport a connection arrived over, derived from its protocol stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Https,
    Mqtts,
    #[serde(alias = "mqtt_over_websocket")]
    MqttOverWs,
}

impl Protocol {
    /// Classify a protocol stack such as `["tls", "http", "mqtt"]`.
    ///
    /// - `[.., "http"]` → HTTPS
    /// - `[.., "mqtt"]` → MQTT over TLS
    /// - `[.., "http", "mqtt"]` → MQTT over WebSocket
    pub fn classify(protocols: &[String]) -> Option<Protocol> {
        match protocols {
            [_first, middle @ .., last] => match (middle, last.as_str()) {
                ([], "http") => Some(Protocol::Https),
                ([], "mqtt") => Some(Protocol::Mqtts),
                ([m], "mqtt") if m == "http" => Some(Protocol::MqttOverWs),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Everything known about a connection before it is admitted.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub connection: ConnectionId,
    pub client_id: ClientId,
    pub protocols: Vec<String>,
    pub attributes: BTreeMap<String, String>,
}

impl ConnectionMetadata {
    pub fn new(connection: ConnectionId, client_id: ClientId) -> Self {
        Self {
            connection,
            client_id,
            protocols: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::classify(&self.protocols)
    }
}
