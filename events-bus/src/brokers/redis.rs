// Redis broker backend
//
// Owns three logical connections: publish and auxiliary-store command
// connections (ConnectionManager) and a dedicated pub/sub connection
// driven by a background task. Each connects lazily with a bounded,
// linearly growing retry; once the attempts are exhausted the connection
// is reported terminally down through the health check instead of
// crashing the process.
use super::{EventBroker, RawMessage};
use crate::config::EventBusConfig;
use crate::error::{EventBusError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Key of the sorted set holding delayed-event entries
const DELAYED_KEY: &str = "events:delayed";
/// Key of the dead-letter list
const DEAD_LETTER_KEY: &str = "events:dead_letter";
/// Key of the capped published-event audit list
const EVENT_STORE_KEY: &str = "events:store";

/// Retry delays grow linearly with the attempt number, capped here
const MAX_CONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    pub url: String,
    pub connect_base_delay: Duration,
    pub connect_max_attempts: u32,
    pub dead_letter_ttl: Duration,
    pub dead_letter_max_len: u64,
    pub event_store_max_len: u64,
}

impl From<&EventBusConfig> for RedisBrokerConfig {
    fn from(config: &EventBusConfig) -> Self {
        Self {
            url: config.connection_url(),
            connect_base_delay: config.connect_base_delay,
            connect_max_attempts: config.connect_max_attempts,
            dead_letter_ttl: config.dead_letter_ttl,
            dead_letter_max_len: config.dead_letter_max_len,
            event_store_max_len: config.event_store_max_len,
        }
    }
}

enum SubCommand {
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

pub struct RedisBroker {
    publish_conn: ConnectionManager,
    store_conn: ConnectionManager,
    control_tx: Mutex<Option<mpsc::UnboundedSender<SubCommand>>>,
    messages: Mutex<Option<mpsc::UnboundedReceiver<RawMessage>>>,
    subscriber_ready: Arc<AtomicBool>,
    subscriber_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    config: RedisBrokerConfig,
}

impl RedisBroker {
    /// Connect publish, store, and subscriber connections.
    pub async fn connect(config: RedisBrokerConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))?;

        let publish_conn = manager_with_retry(&client, &config, "publish").await?;
        let store_conn = manager_with_retry(&client, &config, "store").await?;

        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let subscriber_ready = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(subscriber_loop(
            client,
            config.clone(),
            control_rx,
            message_tx,
            subscriber_ready.clone(),
        ));

        Ok(Self {
            publish_conn,
            store_conn,
            control_tx: Mutex::new(Some(control_tx)),
            messages: Mutex::new(Some(message_rx)),
            subscriber_ready,
            subscriber_task: Mutex::new(Some(task)),
            config,
        })
    }

    /// Connect using bus-level configuration.
    pub async fn from_config(config: &EventBusConfig) -> Result<Self> {
        Self::connect(RedisBrokerConfig::from(config)).await
    }

    fn send_control(&self, command: SubCommand) -> Result<()> {
        let control = self.control_tx.lock();
        let Some(tx) = control.as_ref() else {
            return Err(EventBusError::ConnectionError(
                "subscriber connection is closed".to_string(),
            ));
        };
        tx.send(command).map_err(|_| {
            EventBusError::MaxRetriesExceededError {
                attempts: self.config.connect_max_attempts,
            }
        })
    }
}

async fn manager_with_retry(
    client: &redis::Client,
    config: &RedisBrokerConfig,
    role: &str,
) -> Result<ConnectionManager> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match ConnectionManager::new(client.clone()).await {
            Ok(conn) => {
                info!(role = role, attempt = attempt, "Connected to Redis");
                return Ok(conn);
            }
            Err(e) if attempt >= config.connect_max_attempts => {
                error!(
                    role = role,
                    attempts = attempt,
                    error = %e,
                    "Redis connection attempts exhausted"
                );
                return Err(EventBusError::MaxRetriesExceededError { attempts: attempt });
            }
            Err(e) => {
                let delay = connect_delay(attempt, config.connect_base_delay);
                warn!(
                    role = role,
                    attempt = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Redis connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn connect_delay(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(attempt).min(MAX_CONNECT_DELAY)
}

/// Owns the pub/sub connection: serves subscribe/unsubscribe commands,
/// forwards incoming messages, and reconnects with the same bounded
/// policy as the command connections, re-subscribing tracked patterns.
async fn subscriber_loop(
    client: redis::Client,
    config: RedisBrokerConfig,
    mut control_rx: mpsc::UnboundedReceiver<SubCommand>,
    message_tx: mpsc::UnboundedSender<RawMessage>,
    ready: Arc<AtomicBool>,
) {
    let mut patterns: HashSet<String> = HashSet::new();
    let mut attempt = 0u32;

    'reconnect: loop {
        let conn = match client.get_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                attempt += 1;
                if attempt >= config.connect_max_attempts {
                    ready.store(false, Ordering::Relaxed);
                    error!(
                        attempts = attempt,
                        error = %e,
                        "Subscriber connection attempts exhausted, giving up"
                    );
                    return;
                }
                let delay = connect_delay(attempt, config.connect_base_delay);
                warn!(
                    attempt = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Subscriber connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue 'reconnect;
            }
        };
        attempt = 0;

        let mut pubsub = conn.into_pubsub();
        for pattern in &patterns {
            if let Err(e) = pubsub.psubscribe(pattern).await {
                warn!(pattern = %pattern, error = %e, "Pattern re-subscribe failed");
            }
        }
        ready.store(true, Ordering::Relaxed);
        info!(patterns = patterns.len(), "Subscriber connection ready");

        loop {
            let mut stream = pubsub.on_message();
            tokio::select! {
                maybe_msg = stream.next() => {
                    drop(stream);
                    match maybe_msg {
                        Some(msg) => {
                            let channel = msg.get_channel_name().to_string();
                            let pattern: String = msg
                                .get_pattern()
                                .unwrap_or_else(|_| channel.clone());
                            let payload: String = match msg.get_payload() {
                                Ok(payload) => payload,
                                Err(e) => {
                                    warn!(channel = %channel, error = %e, "Undecodable message payload");
                                    continue;
                                }
                            };
                            if message_tx
                                .send(RawMessage { pattern, channel, payload })
                                .is_err()
                            {
                                // Bus side dropped the intake; nothing left to do.
                                return;
                            }
                        }
                        None => {
                            ready.store(false, Ordering::Relaxed);
                            warn!("Subscriber connection lost, reconnecting");
                            continue 'reconnect;
                        }
                    }
                }
                maybe_cmd = control_rx.recv() => {
                    drop(stream);
                    match maybe_cmd {
                        Some(SubCommand::Subscribe(pattern)) => {
                            patterns.insert(pattern.clone());
                            if let Err(e) = pubsub.psubscribe(&pattern).await {
                                warn!(pattern = %pattern, error = %e, "Pattern subscribe failed");
                            } else {
                                debug!(pattern = %pattern, "Pattern subscribed");
                            }
                        }
                        Some(SubCommand::Unsubscribe(pattern)) => {
                            patterns.remove(&pattern);
                            if let Err(e) = pubsub.punsubscribe(&pattern).await {
                                warn!(pattern = %pattern, error = %e, "Pattern unsubscribe failed");
                            }
                        }
                        Some(SubCommand::Shutdown) | None => {
                            ready.store(false, Ordering::Relaxed);
                            info!("Subscriber connection closing");
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl EventBroker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.publish_conn.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))
    }

    async fn publish_many(&self, messages: &[(String, String)]) -> Result<()> {
        let mut conn = self.publish_conn.clone();
        let mut pipe = redis::pipe();
        for (channel, payload) in messages {
            pipe.publish(channel, payload).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))
    }

    async fn subscribe_pattern(&self, pattern: &str) -> Result<()> {
        self.send_control(SubCommand::Subscribe(pattern.to_string()))
    }

    async fn unsubscribe_pattern(&self, pattern: &str) -> Result<()> {
        self.send_control(SubCommand::Unsubscribe(pattern.to_string()))
    }

    async fn take_messages(&self) -> Result<mpsc::UnboundedReceiver<RawMessage>> {
        self.messages.lock().take().ok_or_else(|| {
            EventBusError::SubscriptionError {
                pattern: "*".to_string(),
                reason: "message intake already taken".to_string(),
            }
        })
    }

    async fn schedule(&self, payload: &str, due_at_ms: i64) -> Result<()> {
        let mut conn = self.store_conn.clone();
        conn.zadd::<_, _, _, ()>(DELAYED_KEY, payload, due_at_ms)
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))
    }

    async fn due_scheduled(&self, now_ms: i64, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.store_conn.clone();
        conn.zrangebyscore_limit::<_, _, _, Vec<String>>(
            DELAYED_KEY,
            "-inf",
            now_ms,
            0,
            limit as isize,
        )
        .await
        .map_err(|e| EventBusError::ConnectionError(e.to_string()))
    }

    async fn remove_scheduled(&self, payload: &str) -> Result<()> {
        let mut conn = self.store_conn.clone();
        conn.zrem::<_, _, ()>(DELAYED_KEY, payload)
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))
    }

    async fn scheduled_count(&self) -> Result<u64> {
        let mut conn = self.store_conn.clone();
        conn.zcard::<_, u64>(DELAYED_KEY)
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))
    }

    async fn push_dead_letter(&self, payload: &str) -> Result<()> {
        let mut conn = self.store_conn.clone();
        let len: u64 = conn
            .llen(DEAD_LETTER_KEY)
            .await
            .map_err(|e| EventBusError::DeadLetterQueueError(e.to_string()))?;
        if len >= self.config.dead_letter_max_len {
            return Err(EventBusError::DeadLetterQueueFullError {
                len,
                limit: self.config.dead_letter_max_len,
            });
        }
        conn.lpush::<_, _, ()>(DEAD_LETTER_KEY, payload)
            .await
            .map_err(|e| EventBusError::DeadLetterQueueError(e.to_string()))?;
        // Retention rides on the whole list; refreshed on every push.
        conn.expire::<_, ()>(DEAD_LETTER_KEY, self.config.dead_letter_ttl.as_secs() as i64)
            .await
            .map_err(|e| EventBusError::DeadLetterQueueError(e.to_string()))
    }

    async fn dead_letters(&self, offset: usize, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.store_conn.clone();
        let start = offset as isize;
        let stop = (offset + limit - 1) as isize;
        conn.lrange::<_, Vec<String>>(DEAD_LETTER_KEY, start, stop)
            .await
            .map_err(|e| EventBusError::DeadLetterQueueError(e.to_string()))
    }

    async fn remove_dead_letter(&self, payload: &str) -> Result<()> {
        let mut conn = self.store_conn.clone();
        conn.lrem::<_, _, ()>(DEAD_LETTER_KEY, 1, payload)
            .await
            .map_err(|e| EventBusError::DeadLetterQueueError(e.to_string()))
    }

    async fn dead_letter_count(&self) -> Result<u64> {
        let mut conn = self.store_conn.clone();
        conn.llen::<_, u64>(DEAD_LETTER_KEY)
            .await
            .map_err(|e| EventBusError::DeadLetterQueueError(e.to_string()))
    }

    async fn append_event_store(&self, payload: &str) -> Result<()> {
        let mut conn = self.store_conn.clone();
        let mut pipe = redis::pipe();
        pipe.rpush(EVENT_STORE_KEY, payload).ignore();
        pipe.ltrim(
            EVENT_STORE_KEY,
            -(self.config.event_store_max_len as isize),
            -1,
        )
        .ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))
    }

    async fn health_check(&self) -> bool {
        if !self.subscriber_ready.load(Ordering::Relaxed) {
            return false;
        }
        let mut conn = self.publish_conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }

    async fn close(&self) -> Result<()> {
        if let Some(tx) = self.control_tx.lock().take() {
            let _ = tx.send(SubCommand::Shutdown);
        }
        self.subscriber_ready.store(false, Ordering::Relaxed);
        let task = self.subscriber_task.lock().take();
        if let Some(task) = task {
            // Give the loop a moment to honor the shutdown command.
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                abort.abort();
            }
        }
        info!("Redis broker connections closed");
        Ok(())
    }
}
