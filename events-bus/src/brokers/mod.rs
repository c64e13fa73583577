// Broker backends
//
// The bus core consumes the backing store through this trait; any broker
// offering pub/sub channels, score-ordered scheduling, list queues, and
// simple keyed storage with TTL qualifies.
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::{RedisBroker, RedisBrokerConfig};

/// Message delivered by a broker-level pattern subscription
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// The subscription pattern this copy was delivered for
    pub pattern: String,
    /// Channel the message was published to
    pub channel: String,
    /// Serialized event envelope as received
    pub payload: String,
}

/// Low-level primitives the event bus core is built on.
///
/// Implementations own their connection lifecycle and reconnect policy;
/// they do not retry individual publish calls, which is the core's
/// handler-retry responsibility.
#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Publish a serialized envelope to a channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Publish a batch of envelopes as one pipelined write.
    async fn publish_many(&self, messages: &[(String, String)]) -> Result<()>;

    /// Register a broker-level pattern subscription.
    async fn subscribe_pattern(&self, pattern: &str) -> Result<()>;

    /// Remove a broker-level pattern subscription.
    async fn unsubscribe_pattern(&self, pattern: &str) -> Result<()>;

    /// Take the intake channel of raw messages. Yields messages for every
    /// subscribed pattern; can be taken once.
    async fn take_messages(&self) -> Result<mpsc::UnboundedReceiver<RawMessage>>;

    /// Store a serialized entry in the delayed schedule, due at `due_at_ms`
    /// (unix epoch milliseconds).
    async fn schedule(&self, payload: &str, due_at_ms: i64) -> Result<()>;

    /// Entries whose due time has elapsed, oldest first, bounded by `limit`.
    /// Entries stay stored until explicitly removed.
    async fn due_scheduled(&self, now_ms: i64, limit: usize) -> Result<Vec<String>>;

    /// Remove one delayed entry by its stored payload.
    async fn remove_scheduled(&self, payload: &str) -> Result<()>;

    async fn scheduled_count(&self) -> Result<u64>;

    /// Append a dead-letter record; fails when the store is at capacity.
    async fn push_dead_letter(&self, payload: &str) -> Result<()>;

    /// Page through stored dead-letter records, newest first.
    async fn dead_letters(&self, offset: usize, limit: usize) -> Result<Vec<String>>;

    /// Remove one dead-letter record by its stored payload.
    async fn remove_dead_letter(&self, payload: &str) -> Result<()>;

    async fn dead_letter_count(&self) -> Result<u64>;

    /// Append a published envelope to the capped audit store.
    async fn append_event_store(&self, payload: &str) -> Result<()>;

    /// Whether publish and subscribe connections are ready.
    async fn health_check(&self) -> bool;

    /// Close all connections and stop background work.
    async fn close(&self) -> Result<()>;
}
