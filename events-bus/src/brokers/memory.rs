// In-process broker backend
//
// Implements the same contract as the Redis backend over process-local
// state. Used by the test suite and by embedded deployments that run a
// single service instance without a broker.
use super::{EventBroker, RawMessage};
use crate::error::{EventBusError, Result};
use crate::subscriber::pattern_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

struct ScheduledEntry {
    due_at_ms: i64,
    payload: String,
}

pub struct MemoryBroker {
    patterns: Mutex<HashSet<String>>,
    sender: Mutex<Option<mpsc::UnboundedSender<RawMessage>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<RawMessage>>>,
    scheduled: Mutex<Vec<ScheduledEntry>>,
    dead_letters: Mutex<VecDeque<String>>,
    event_store: Mutex<Vec<String>>,
    dead_letter_max_len: u64,
    event_store_max_len: usize,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new(dead_letter_max_len: u64, event_store_max_len: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            patterns: Mutex::new(HashSet::new()),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            scheduled: Mutex::new(Vec::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            event_store: Mutex::new(Vec::new()),
            dead_letter_max_len,
            event_store_max_len: event_store_max_len as usize,
            closed: AtomicBool::new(false),
        }
    }

    fn deliver(&self, channel: &str, payload: &str) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else { return };
        // One copy per matching pattern subscription, like PSUBSCRIBE.
        for pattern in self.patterns.lock().iter() {
            if pattern_matches(pattern, channel) {
                let _ = tx.send(RawMessage {
                    pattern: pattern.clone(),
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
            }
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(10_000, 100_000)
    }
}

#[async_trait]
impl EventBroker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EventBusError::ConnectionError(
                "memory broker is closed".to_string(),
            ));
        }
        self.deliver(channel, payload);
        Ok(())
    }

    async fn publish_many(&self, messages: &[(String, String)]) -> Result<()> {
        for (channel, payload) in messages {
            self.publish(channel, payload).await?;
        }
        Ok(())
    }

    async fn subscribe_pattern(&self, pattern: &str) -> Result<()> {
        self.patterns.lock().insert(pattern.to_string());
        Ok(())
    }

    async fn unsubscribe_pattern(&self, pattern: &str) -> Result<()> {
        self.patterns.lock().remove(pattern);
        Ok(())
    }

    async fn take_messages(&self) -> Result<mpsc::UnboundedReceiver<RawMessage>> {
        self.receiver.lock().take().ok_or_else(|| {
            EventBusError::SubscriptionError {
                pattern: "*".to_string(),
                reason: "message intake already taken".to_string(),
            }
        })
    }

    async fn schedule(&self, payload: &str, due_at_ms: i64) -> Result<()> {
        self.scheduled.lock().push(ScheduledEntry {
            due_at_ms,
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn due_scheduled(&self, now_ms: i64, limit: usize) -> Result<Vec<String>> {
        let mut scheduled = self.scheduled.lock();
        scheduled.sort_by_key(|e| e.due_at_ms);
        Ok(scheduled
            .iter()
            .filter(|e| e.due_at_ms <= now_ms)
            .take(limit)
            .map(|e| e.payload.clone())
            .collect())
    }

    async fn remove_scheduled(&self, payload: &str) -> Result<()> {
        self.scheduled.lock().retain(|e| e.payload != payload);
        Ok(())
    }

    async fn scheduled_count(&self) -> Result<u64> {
        Ok(self.scheduled.lock().len() as u64)
    }

    async fn push_dead_letter(&self, payload: &str) -> Result<()> {
        let mut dead = self.dead_letters.lock();
        if dead.len() as u64 >= self.dead_letter_max_len {
            return Err(EventBusError::DeadLetterQueueFullError {
                len: dead.len() as u64,
                limit: self.dead_letter_max_len,
            });
        }
        dead.push_front(payload.to_string());
        Ok(())
    }

    async fn dead_letters(&self, offset: usize, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .dead_letters
            .lock()
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn remove_dead_letter(&self, payload: &str) -> Result<()> {
        let mut dead = self.dead_letters.lock();
        if let Some(pos) = dead.iter().position(|p| p == payload) {
            dead.remove(pos);
        }
        Ok(())
    }

    async fn dead_letter_count(&self) -> Result<u64> {
        Ok(self.dead_letters.lock().len() as u64)
    }

    async fn append_event_store(&self, payload: &str) -> Result<()> {
        let mut store = self.event_store.lock();
        store.push(payload.to_string());
        let len = store.len();
        if len > self.event_store_max_len {
            store.drain(..len - self.event_store_max_len);
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        self.sender.lock().take();
        Ok(())
    }
}
