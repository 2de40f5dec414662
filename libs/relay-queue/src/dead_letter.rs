//! Bounded in-memory dead-letter sink.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use relay_api::Payload;

/// An item that exhausted its delivery attempts.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub payload: Payload,
    /// Queue or stream partition the item came from.
    pub origin: String,
    pub reason: String,
    pub attempts: u32,
    pub failed_at_ms: i64,
}

/// Terminal sink for items exceeding their maximum redelivery count.
///
/// When full, the oldest entry is evicted and counted in
/// [`total_dropped`](Self::total_dropped).
#[derive(Debug)]
pub struct DeadLetterQueue {
    letters: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
    total_captured: AtomicU64,
    total_dropped: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            letters: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            total_captured: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, letters: Vec<DeadLetter>) {
        let count = letters.len() as u64;
        let mut dropped = 0u64;
        {
            let mut queue = self.lock();
            for letter in letters {
                tracing::warn!(
                    origin = %letter.origin,
                    attempts = letter.attempts,
                    reason = %letter.reason,
                    "dead-lettered"
                );
                if self.capacity == 0 {
                    tracing::warn!(
                        origin = %letter.origin,
                        "dead-letter capacity is zero, letter dropped"
                    );
                    dropped += 1;
                    continue;
                }
                if queue.len() >= self.capacity {
                    if let Some(evicted) = queue.pop_front() {
                        tracing::warn!(
                            origin = %evicted.origin,
                            attempts = evicted.attempts,
                            capacity = self.capacity,
                            "dead-letter queue full, evicted oldest letter"
                        );
                    }
                    dropped += 1;
                }
                queue.push_back(letter);
            }
        }
        self.total_captured.fetch_add(count, Ordering::Relaxed);
        if dropped > 0 {
            self.total_dropped.fetch_add(dropped, Ordering::Relaxed);
        }
    }

    /// Remove and return up to `n` of the oldest entries.
    pub fn drain(&self, n: usize) -> Vec<DeadLetter> {
        let mut queue = self.lock();
        let count = n.min(queue.len());
        queue.drain(..count).collect()
    }

    pub fn peek(&self, n: usize) -> Vec<DeadLetter> {
        self.lock().iter().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn total_captured(&self) -> u64 {
        self.total_captured.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DeadLetter>> {
        match self.letters.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("dead-letter lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
