use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use relay_api::{Payload, QueueItemId, QueueRef, ReceiptHandle, RelayError};

use crate::config::QueueConfig;
use crate::dead_letter::{DeadLetter, DeadLetterQueue};

/// Item owned by the queue until acknowledged or dead-lettered.
#[derive(Debug, Clone)]
struct QueueItem {
    payload: Payload,
    enqueued_at_ms: i64,
    visible_at: Instant,
    attempts: u32,
    receipt: Option<ReceiptHandle>,
}

/// One delivery handed out by [`DelayQueue::poll`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub item: QueueItemId,
    pub receipt: ReceiptHandle,
    pub payload: Payload,
    pub enqueued_at_ms: i64,
    /// 1 on first delivery.
    pub attempt: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    items: BTreeMap<QueueItemId, QueueItem>,
    next_id: u64,
    next_receipt: u64,
}

impl QueueState {
    /// Earliest visible item, ties broken by enqueue order.
    fn first_visible(&self, now: Instant) -> Option<QueueItemId> {
        self.items
            .iter()
            .filter(|(_, item)| item.visible_at <= now)
            .min_by_key(|(id, item)| (item.visible_at, **id))
            .map(|(id, _)| *id)
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.items.values().map(|item| item.visible_at).min()
    }
}

/// Queue that withholds each item until its delay elapsed.
///
/// Delivery is at-least-once: a polled item stays hidden for the visibility
/// timeout and becomes visible again unless acknowledged with its receipt.
/// Every poll of an item counts as one attempt; an item already delivered
/// `max_attempts` times goes to the dead-letter queue instead.
#[derive(Debug)]
pub struct DelayQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    dead_letters: Arc<DeadLetterQueue>,
}

impl DelayQueue {
    pub fn new(config: QueueConfig) -> Self {
        let dead_letters = Arc::new(DeadLetterQueue::new(config.dead_letter_capacity));
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            dead_letters,
        }
    }

    pub fn name(&self) -> &QueueRef {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    /// Enqueue with an explicit delay. Fails fast with an overflow error at
    /// the depth limit.
    pub fn enqueue(&self, payload: Payload, delay: Duration) -> Result<QueueItemId, RelayError> {
        let id = {
            let mut state = self.lock();
            if state.items.len() >= self.config.max_depth {
                return Err(RelayError::overflow(format!(
                    "queue '{}': depth limit {} reached",
                    self.config.name, self.config.max_depth
                )));
            }
            let id = QueueItemId(state.next_id);
            state.next_id += 1;
            state.items.insert(
                id,
                QueueItem {
                    payload,
                    enqueued_at_ms: relay_api::now_ms(),
                    visible_at: Instant::now() + delay,
                    attempts: 0,
                    receipt: None,
                },
            );
            id
        };
        tracing::trace!(
            queue = %self.config.name,
            item = %id,
            delay_ms = delay.as_millis() as u64,
            "enqueued"
        );
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Enqueue with the configured delivery delay.
    pub fn enqueue_default(&self, payload: Payload) -> Result<QueueItemId, RelayError> {
        self.enqueue(payload, self.config.delivery_delay())
    }

    /// Take at most one visible item, hiding it for `visibility_timeout`.
    pub fn poll(&self, visibility_timeout: Duration) -> Option<Delivery> {
        let now = Instant::now();
        let mut expired = Vec::new();

        let delivery = {
            let mut state = self.lock();
            loop {
                let Some(id) = state.first_visible(now) else {
                    break None;
                };

                if state.items.get(&id).is_some_and(|i| i.attempts >= self.config.max_attempts) {
                    if let Some(item) = state.items.remove(&id) {
                        expired.push(DeadLetter {
                            payload: item.payload,
                            origin: format!("queue {}", self.config.name),
                            reason: format!(
                                "exceeded {} delivery attempts",
                                self.config.max_attempts
                            ),
                            attempts: item.attempts,
                            failed_at_ms: relay_api::now_ms(),
                        });
                    }
                    continue;
                }

                let receipt = ReceiptHandle(state.next_receipt);
                state.next_receipt += 1;
                let Some(item) = state.items.get_mut(&id) else {
                    break None;
                };
                item.attempts += 1;
                item.visible_at = now + visibility_timeout;
                item.receipt = Some(receipt);
                break Some(Delivery {
                    item: id,
                    receipt,
                    payload: item.payload.clone(),
                    enqueued_at_ms: item.enqueued_at_ms,
                    attempt: item.attempts,
                });
            }
        };

        if !expired.is_empty() {
            self.dead_letters.push(expired);
        }
        delivery
    }

    /// Poll, waiting up to `wait` for an item to become visible.
    pub async fn poll_wait(
        &self,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> Option<Delivery> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.poll(visibility_timeout) {
                return Some(delivery);
            }
            if Instant::now() >= deadline {
                return None;
            }

            let wake = self
                .lock()
                .next_visible_at()
                .map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Acknowledge a delivery, removing the item for good. A receipt that is
    /// no longer current (the item was redelivered or already acknowledged)
    /// is rejected.
    pub fn ack(&self, receipt: ReceiptHandle) -> Result<QueueItemId, RelayError> {
        let mut state = self.lock();
        let id = state
            .items
            .iter()
            .find(|(_, item)| item.receipt == Some(receipt))
            .map(|(id, _)| *id)
            .ok_or_else(|| {
                RelayError::logic(format!(
                    "queue '{}': receipt {receipt} is not current",
                    self.config.name
                ))
            })?;
        state.items.remove(&id);
        Ok(id)
    }

    /// Return a delivery that was never processed. The item becomes visible
    /// at once and the delivery does not count as an attempt.
    pub fn release(&self, receipt: ReceiptHandle) -> Result<QueueItemId, RelayError> {
        let now = Instant::now();
        let id = {
            let mut state = self.lock();
            let (id, item) = state
                .items
                .iter_mut()
                .find(|(_, item)| item.receipt == Some(receipt))
                .ok_or_else(|| {
                    RelayError::logic(format!(
                        "queue '{}': receipt {receipt} is not current",
                        self.config.name
                    ))
                })?;
            item.receipt = None;
            item.visible_at = now;
            item.attempts = item.attempts.saturating_sub(1);
            *id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Items held by the queue, visible or not.
    pub fn depth(&self) -> usize {
        self.lock().items.len()
    }

    /// Items delivered and still hidden by their visibility timeout.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .items
            .values()
            .filter(|i| i.receipt.is_some() && i.visible_at > now)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(queue = %self.config.name, "queue lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(30);

    fn queue(max_attempts: u32, max_depth: usize) -> DelayQueue {
        DelayQueue::new(QueueConfig {
            max_attempts,
            max_depth,
            ..QueueConfig::new("presence")
        })
    }

    #[tokio::test(start_paused = true)]
    async fn item_hidden_until_delay_elapses() {
        let q = queue(3, 100);
        q.enqueue(Payload::from("x"), Duration::from_secs(5)).unwrap();

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(q.poll(VISIBILITY).is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        let delivery = q.poll(VISIBILITY).unwrap();
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.payload.as_bytes(), b"x");
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_default_uses_configured_delay() {
        let q = queue(3, 100);
        q.enqueue_default(Payload::from("x")).unwrap();
        tokio::time::advance(Duration::from_millis(4_900)).await;
        assert!(q.poll(VISIBILITY).is_none());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(q.poll(VISIBILITY).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_item_reappears_after_exactly_visibility_timeout() {
        let q = queue(5, 100);
        q.enqueue(Payload::from("x"), Duration::ZERO).unwrap();
        let first = q.poll(VISIBILITY).unwrap();
        assert_eq!(q.in_flight(), 1);

        tokio::time::advance(VISIBILITY - Duration::from_millis(1)).await;
        assert!(q.poll(VISIBILITY).is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        let second = q.poll(VISIBILITY).unwrap();
        assert_eq!(second.item, first.item);
        assert_eq!(second.attempt, 2);
        assert_ne!(second.receipt, first.receipt);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_removes_item_and_rejects_stale_receipt() {
        let q = queue(5, 100);
        q.enqueue(Payload::from("x"), Duration::ZERO).unwrap();
        let first = q.poll(Duration::from_secs(1)).unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        let second = q.poll(Duration::from_secs(1)).unwrap();

        assert!(q.ack(first.receipt).is_err());
        assert_eq!(q.ack(second.receipt).unwrap(), second.item);
        assert_eq!(q.depth(), 0);
        assert!(q.ack(second.receipt).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_max_attempts_dead_letters() {
        let q = queue(2, 100);
        q.enqueue(Payload::from("poison"), Duration::ZERO).unwrap();
        let vt = Duration::from_secs(1);

        assert_eq!(q.poll(vt).unwrap().attempt, 1);
        tokio::time::advance(vt).await;
        assert_eq!(q.poll(vt).unwrap().attempt, 2);
        tokio::time::advance(vt).await;

        assert!(q.poll(vt).is_none());
        assert_eq!(q.depth(), 0);
        let letters = q.dead_letters().peek(1);
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 2);
        assert_eq!(letters[0].payload.as_bytes(), b"poison");
    }

    #[tokio::test(start_paused = true)]
    async fn released_item_is_visible_again_without_spending_an_attempt() {
        let q = queue(1, 10);
        q.enqueue(Payload::from("x"), Duration::ZERO).unwrap();
        let first = q.poll(VISIBILITY).unwrap();
        assert!(q.poll(VISIBILITY).is_none());

        assert_eq!(q.release(first.receipt).unwrap(), first.item);
        assert!(q.release(first.receipt).is_err());

        let again = q.poll(VISIBILITY).unwrap();
        assert_eq!(again.item, first.item);
        assert_eq!(again.attempt, 1);
        assert!(q.dead_letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_is_explicit() {
        let q = queue(3, 1);
        q.enqueue(Payload::from("a"), Duration::ZERO).unwrap();
        let err = q.enqueue(Payload::from("b"), Duration::ZERO).unwrap_err();
        assert_eq!(err.kind(), relay_api::ErrorKind::Overflow);
        assert_eq!(q.depth(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_visible_item_first() {
        let q = queue(3, 10);
        q.enqueue(Payload::from("late"), Duration::from_secs(2)).unwrap();
        q.enqueue(Payload::from("early"), Duration::from_secs(1)).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(q.poll(VISIBILITY).unwrap().payload.as_bytes(), b"early");
        assert_eq!(q.poll(VISIBILITY).unwrap().payload.as_bytes(), b"late");
    }

    #[tokio::test(start_paused = true)]
    async fn poll_wait_wakes_at_visibility_time() {
        let q = queue(3, 10);
        q.enqueue(Payload::from("x"), Duration::from_secs(5)).unwrap();

        let start = Instant::now();
        let delivery = q.poll_wait(VISIBILITY, Duration::from_secs(10)).await.unwrap();
        assert_eq!(delivery.payload.as_bytes(), b"x");
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn poll_wait_gives_up_at_deadline() {
        let q = queue(3, 10);
        let start = Instant::now();
        assert!(q.poll_wait(VISIBILITY, Duration::from_secs(2)).await.is_none());
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
