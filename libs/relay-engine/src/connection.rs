use std::sync::Arc;

use tokio::time::Instant;

use relay_admission::{ConnectionMetadata, Policy};
use relay_api::{ClientId, ConnectionId, Message, Payload, Publisher, RelayError, Topic};
use relay_router::{ActionResult, Router};

use crate::presence::{PresenceEvent, PresenceEventType, PresenceRegistry, disconnected_topic};

/// State shared by the engine and its connections.
pub(crate) struct Shared {
    pub(crate) router: Router,
    pub(crate) presence: Arc<PresenceRegistry>,
}

impl Shared {
    pub(crate) async fn publish_system(&self, topic: Topic, payload: Payload) -> Vec<ActionResult> {
        let message = Message::new(topic, payload, Publisher::System);
        self.router.route(&message).await
    }

    /// Mark the client's connection closed. Returns the lifecycle event to
    /// publish when it was the client's last connection.
    fn close(&self, client_id: &ClientId) -> Option<(Topic, Payload)> {
        let now = relay_api::now_ms();
        if !self.presence.disconnected(client_id, now) {
            return None;
        }
        let event = PresenceEvent {
            client_id: client_id.clone(),
            event_type: PresenceEventType::Disconnected,
            timestamp: now,
        };
        let topic = match disconnected_topic(client_id) {
            Ok(topic) => topic,
            Err(e) => {
                tracing::warn!(
                    client_id = %client_id,
                    error = %e,
                    "client id cannot form a lifecycle topic"
                );
                return None;
            }
        };
        match serde_json::to_vec(&event) {
            Ok(body) => Some((topic, Payload::from(body))),
            Err(e) => {
                tracing::error!(
                    client_id = %client_id,
                    error = %e,
                    "lifecycle event serialization failed"
                );
                None
            }
        }
    }
}

/// An admitted connection. Every publish is checked against the policy
/// granted at admission before it reaches the router.
///
/// Closing (explicitly or by drop) publishes the disconnection lifecycle
/// event when the client has no other open connection.
pub struct Connection {
    shared: Arc<Shared>,
    meta: ConnectionMetadata,
    policy: Policy,
    open: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("meta", &self.meta)
            .field("principal", &self.policy.principal)
            .field("open", &self.open)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(shared: Arc<Shared>, meta: ConnectionMetadata, policy: Policy) -> Self {
        Self {
            shared,
            meta,
            policy,
            open: true,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.meta.connection
    }

    pub fn client_id(&self) -> &ClientId {
        &self.meta.client_id
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Route one message. Fails with an `Auth` error, without evaluating any
    /// rule, when the session expired or the policy does not cover the topic.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Payload,
    ) -> Result<Vec<ActionResult>, RelayError> {
        let topic = Topic::parse(topic)?;

        let now = Instant::now();
        if self.policy.is_expired(now) {
            tracing::info!(
                connection = %self.meta.connection,
                client_id = %self.meta.client_id,
                "session expired, dropping message"
            );
            return Err(RelayError::auth("session expired"));
        }
        if topic.is_system() || !self.policy.permits(&topic) {
            tracing::info!(
                connection = %self.meta.connection,
                client_id = %self.meta.client_id,
                topic = %topic,
                "publish not permitted, dropping message"
            );
            return Err(RelayError::auth(format!("not permitted to publish on '{topic}'")));
        }
        if self.policy.needs_refresh(now) {
            tracing::debug!(connection = %self.meta.connection, "policy due for refresh");
        }

        let message = Message::new(
            topic,
            payload,
            Publisher::Client {
                connection: self.meta.connection,
                client_id: self.meta.client_id.clone(),
            },
        );
        Ok(self.shared.router.route(&message).await)
    }

    /// Close the connection and publish the lifecycle event, if any.
    pub async fn disconnect(mut self) -> Vec<ActionResult> {
        self.open = false;
        tracing::info!(
            connection = %self.meta.connection,
            client_id = %self.meta.client_id,
            "connection closed"
        );
        match self.shared.close(&self.meta.client_id) {
            Some((topic, payload)) => self.shared.publish_system(topic, payload).await,
            None => Vec::new(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        tracing::info!(
            connection = %self.meta.connection,
            client_id = %self.meta.client_id,
            "connection dropped"
        );
        let Some((topic, payload)) = self.shared.close(&self.meta.client_id) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = self.shared.clone();
                handle.spawn(async move {
                    shared.publish_system(topic, payload).await;
                });
            }
            Err(_) => tracing::warn!(
                client_id = %self.meta.client_id,
                "no runtime, lifecycle event not published"
            ),
        }
    }
}
