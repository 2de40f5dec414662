use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use relay_api::{Batch, ProcessingUnit, RelayError, UnitId};

use crate::presence::{PresenceEvent, PresenceEventType, PresenceRegistry};

/// Name of the built-in batch logger.
pub const LOG_HANDLER: &str = "log";
/// Name of the built-in disconnection confirmer.
pub const DISCONNECT_CONFIRM_HANDLER: &str = "disconnect-confirm";

/// Processing units by handler name, referenced from `[[dispatchers]]`.
#[derive(Default)]
pub struct HandlerRegistry {
    units: RwLock<HashMap<UnitId, Arc<dyn ProcessingUnit>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit under its own id, replacing any previous one.
    pub fn register(&self, unit: Arc<dyn ProcessingUnit>) {
        let mut guard = match self.units.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("handler registry write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.insert(unit.id().clone(), unit);
    }

    /// Register only when no unit holds the id yet.
    pub(crate) fn register_default(&self, unit: Arc<dyn ProcessingUnit>) {
        if self.get(unit.id()).is_none() {
            self.register(unit);
        }
    }

    pub fn get(&self, id: &UnitId) -> Option<Arc<dyn ProcessingUnit>> {
        let guard = match self.units.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("handler registry read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.get(id).cloned()
    }

    pub fn names(&self) -> Vec<UnitId> {
        let guard = match self.units.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("handler registry read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.keys().cloned().collect()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Built-in: log
// ═══════════════════════════════════════════════════════════════

/// Logs a summary of every batch and accepts it.
pub struct LogHandler {
    id: UnitId,
}

impl Default for LogHandler {
    fn default() -> Self {
        Self {
            id: UnitId::new(LOG_HANDLER),
        }
    }
}

impl ProcessingUnit for LogHandler {
    fn id(&self) -> &UnitId {
        &self.id
    }

    fn invoke<'a>(
        &'a self,
        batch: &'a Batch,
    ) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + 'a>> {
        Box::pin(async move {
            let bytes: usize = batch.payloads().map(|p| p.len()).sum();
            tracing::info!(
                origin = %batch.origin,
                items = batch.len(),
                bytes,
                max_attempt = batch.max_attempt(),
                "batch received"
            );
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Built-in: disconnect-confirm
// ═══════════════════════════════════════════════════════════════

/// Debounced disconnection handling. Each item is a lifecycle event that
/// waited out the queue delay; it is confirmed only if the client is still
/// away, since a reconnect during the delay supersedes it.
pub struct DisconnectConfirmer {
    id: UnitId,
    presence: Arc<PresenceRegistry>,
    confirmed: AtomicU64,
    superseded: AtomicU64,
    malformed: AtomicU64,
}

impl DisconnectConfirmer {
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self {
            id: UnitId::new(DISCONNECT_CONFIRM_HANDLER),
            presence,
            confirmed: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed.load(Ordering::Relaxed)
    }

    pub fn superseded(&self) -> u64 {
        self.superseded.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

impl ProcessingUnit for DisconnectConfirmer {
    fn id(&self) -> &UnitId {
        &self.id
    }

    fn invoke<'a>(
        &'a self,
        batch: &'a Batch,
    ) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + 'a>> {
        Box::pin(async move {
            for item in &batch.items {
                // Malformed events would fail on every redelivery; skip them.
                let event: PresenceEvent = match serde_json::from_slice(item.payload.as_bytes()) {
                    Ok(event) => event,
                    Err(e) => {
                        self.malformed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            origin = %batch.origin,
                            error = %e,
                            "malformed presence event, skipping"
                        );
                        continue;
                    }
                };
                if event.event_type != PresenceEventType::Disconnected {
                    continue;
                }

                if self.presence.disconnection_holds(&event.client_id, event.timestamp) {
                    self.confirmed.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        client_id = %event.client_id,
                        disconnected_at_ms = event.timestamp,
                        attempt = item.attempt,
                        "disconnection confirmed"
                    );
                } else {
                    self.superseded.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        client_id = %event.client_id,
                        disconnected_at_ms = event.timestamp,
                        "client reconnected, disconnection superseded"
                    );
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_api::{
        BatchItem, BatchOrigin, ClientId, ItemPosition, Payload, QueueItemId, ReceiptHandle,
    };

    fn item(body: &str) -> BatchItem {
        BatchItem {
            payload: Payload::from(body),
            arrived_at_ms: 0,
            attempt: 1,
            position: ItemPosition::Queue {
                item: QueueItemId(0),
                receipt: ReceiptHandle(0),
            },
        }
    }

    fn event(client: &str, ts: i64) -> String {
        serde_json::to_string(&PresenceEvent {
            client_id: ClientId::new(client),
            event_type: PresenceEventType::Disconnected,
            timestamp: ts,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn confirms_only_still_disconnected_clients() {
        let presence = Arc::new(PresenceRegistry::new());
        let gone = ClientId::new("gone");
        let back = ClientId::new("back");
        presence.connected(&gone, 1);
        presence.disconnected(&gone, 2);
        presence.connected(&back, 1);
        presence.disconnected(&back, 2);
        presence.connected(&back, 3);

        let unit = DisconnectConfirmer::new(presence);
        let batch = Batch {
            origin: BatchOrigin::Queue {
                queue: "presence".into(),
            },
            items: vec![item(&event("gone", 2)), item(&event("back", 2)), item("not json")],
        };
        unit.invoke(&batch).await.unwrap();

        assert_eq!(unit.confirmed(), 1);
        assert_eq!(unit.superseded(), 1);
        assert_eq!(unit.malformed(), 1);
    }

    #[tokio::test]
    async fn registry_keeps_user_units_over_defaults() {
        struct Custom(UnitId);
        impl ProcessingUnit for Custom {
            fn id(&self) -> &UnitId {
                &self.0
            }
            fn invoke<'a>(
                &'a self,
                _batch: &'a Batch,
            ) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + 'a>> {
                Box::pin(async { Err(RelayError::processing("custom")) })
            }
        }

        let registry = HandlerRegistry::new();
        registry.register(Arc::new(Custom(UnitId::new(LOG_HANDLER))));
        registry.register_default(Arc::new(LogHandler::default()));
        assert_eq!(registry.names(), vec![UnitId::new(LOG_HANDLER)]);

        let unit = registry.get(&UnitId::new(LOG_HANDLER)).unwrap();
        let batch = Batch {
            origin: BatchOrigin::Queue {
                queue: "q".into(),
            },
            items: vec![],
        };
        assert!(unit.invoke(&batch).await.is_err());
        assert!(registry.get(&UnitId::new("missing")).is_none());
    }
}
