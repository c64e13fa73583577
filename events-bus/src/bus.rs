// Event bus core: publish path, dispatch loop, retry and dead-letter
// routing, delayed-event scanning, shutdown.
use crate::brokers::{EventBroker, RawMessage, RedisBroker};
use crate::config::EventBusConfig;
use crate::dlq::{DeadLetterRecord, RetryAttempt};
use crate::error::{EventBusError, Result};
use crate::event::{Event, MetadataOverrides, PublishOptions};
use crate::handlers::{BoxedHandler, HandlerError, HandlerResult};
use crate::schema::{EventSchema, SchemaRegistry};
use crate::stats::{BusStats, StatsSnapshot};
use crate::subscriber::{
    pattern_matches, validate_pattern, SubscribeOptions, Subscription, SubscriptionId,
    SubscriptionTable,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handler retry delays double per attempt, capped here
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Page size used when scanning the dead-letter store for one record
const DEAD_LETTER_PAGE: usize = 100;

/// Serialized form of a delayed-event entry in the broker's schedule
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelayedEnvelope {
    entry_id: Uuid,
    channel: String,
    #[serde(default)]
    priority: u8,
    event: Event,
}

struct BusInner {
    broker: Arc<dyn EventBroker>,
    config: EventBusConfig,
    registry: SchemaRegistry,
    subscriptions: SubscriptionTable,
    stats: BusStats,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the process-wide event bus.
///
/// Constructed once at startup and passed by reference to producers and
/// consumers; cloning is cheap and all clones share one bus.
///
/// Handler timeouts are cooperative: when a handler exceeds its timeout
/// its future is dropped, which cancels it at the next await point.
/// Synchronous work inside a handler cannot be interrupted, so
/// long-running handlers should check a deadline themselves.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Start the bus over an already-connected broker.
    ///
    /// Spawns the dispatch loop and the delayed-event scanner.
    pub async fn start(config: EventBusConfig, broker: Arc<dyn EventBroker>) -> Result<Self> {
        let messages = broker.take_messages().await?;
        let registry = SchemaRegistry::with_default_schemas(config.max_event_bytes);
        let inner = Arc::new(BusInner {
            broker,
            config,
            registry,
            subscriptions: SubscriptionTable::default(),
            stats: BusStats::new(),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let dispatch = tokio::spawn(dispatch_loop(inner.clone(), messages));
        let scanner = tokio::spawn(delayed_scanner(inner.clone()));
        {
            let mut tasks = inner.tasks.lock();
            tasks.push(dispatch);
            tasks.push(scanner);
        }

        info!(
            service = %inner.config.service_name,
            "Event bus started"
        );
        Ok(Self { inner })
    }

    /// Connect a Redis broker from configuration and start the bus on it.
    pub async fn connect(config: EventBusConfig) -> Result<Self> {
        let broker = RedisBroker::from_config(&config).await?;
        Self::start(config, Arc::new(broker)).await
    }

    /// Publish an event with default metadata and options.
    pub async fn publish(&self, channel: &str, data: serde_json::Value) -> Result<Uuid> {
        self.publish_with(
            channel,
            data,
            MetadataOverrides::default(),
            PublishOptions::default(),
        )
        .await
    }

    /// Publish an event.
    ///
    /// Builds the full envelope, validates it, and either publishes it
    /// immediately or stores it in the delayed schedule when a delay is
    /// requested. Returns the generated event id. A validation failure is
    /// a non-retryable publish error and produces no wire message.
    pub async fn publish_with(
        &self,
        channel: &str,
        data: serde_json::Value,
        metadata: MetadataOverrides,
        options: PublishOptions,
    ) -> Result<Uuid> {
        if self.inner.shutting_down.load(Ordering::Relaxed) {
            return Err(EventBusError::PublishError {
                channel: channel.to_string(),
                source: Box::new(EventBusError::ValidationError(
                    "event bus is shutting down".to_string(),
                )),
            });
        }
        if channel.trim().is_empty() {
            return Err(EventBusError::ChannelNotFoundError(
                "channel name is empty".to_string(),
            ));
        }

        let event = self.build_event(channel, data, metadata);
        self.inner
            .registry
            .validate(&event)
            .map_err(|e| EventBusError::PublishError {
                channel: channel.to_string(),
                source: Box::new(e),
            })?;

        let payload = serde_json::to_string(&event)
            .map_err(|e| EventBusError::SerializationError(e.to_string()))?;

        match options.delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                let due_at_ms = Utc::now().timestamp_millis()
                    + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                let envelope = DelayedEnvelope {
                    entry_id: Uuid::new_v4(),
                    channel: channel.to_string(),
                    priority: options.priority.unwrap_or(0),
                    event: event.clone(),
                };
                let entry = serde_json::to_string(&envelope)
                    .map_err(|e| EventBusError::SerializationError(e.to_string()))?;
                self.inner
                    .broker
                    .schedule(&entry, due_at_ms)
                    .await
                    .map_err(|e| EventBusError::PublishError {
                        channel: channel.to_string(),
                        source: Box::new(e),
                    })?;
                debug!(
                    event_id = %event.id,
                    channel = %channel,
                    delay_ms = delay.as_millis() as u64,
                    "Event scheduled for delayed delivery"
                );
            }
            None => {
                self.inner
                    .broker
                    .publish(channel, &payload)
                    .await
                    .map_err(|e| EventBusError::PublishError {
                        channel: channel.to_string(),
                        source: Box::new(e),
                    })?;
                self.inner.stats.inc_published();
                debug!(event_id = %event.id, channel = %channel, "Event published");
            }
        }

        if self.inner.config.event_store_enabled {
            // Fire and forget; audit trail lag never blocks the publisher.
            let broker = self.inner.broker.clone();
            tokio::spawn(async move {
                if let Err(e) = broker.append_event_store(&payload).await {
                    warn!(error = %e, "Failed to append event to audit store");
                }
            });
        }

        Ok(event.id)
    }

    /// Register a handler for a channel pattern.
    ///
    /// Each registration keeps its own options and its own concurrency
    /// gate; several handlers may share a pattern and each receives every
    /// matching event once.
    pub async fn subscribe<F, Fut>(
        &self,
        pattern: &str,
        handler: F,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_boxed(pattern, crate::handlers::boxed(handler), options)
            .await
    }

    /// Register an already-boxed handler.
    pub async fn subscribe_boxed(
        &self,
        pattern: &str,
        handler: BoxedHandler,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId> {
        validate_pattern(pattern)?;
        let subscription = Arc::new(Subscription::new(pattern, handler, options));
        let id = subscription.id;
        let first_for_pattern = self.inner.subscriptions.insert(subscription);
        if first_for_pattern {
            if let Err(e) = self.inner.broker.subscribe_pattern(pattern).await {
                self.inner.subscriptions.remove_handler(pattern, id);
                return Err(EventBusError::SubscriptionError {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        info!(pattern = %pattern, subscription_id = %id, "Subscribed");
        Ok(id)
    }

    /// Remove every handler registered under a pattern.
    pub async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        if self.inner.subscriptions.remove_pattern(pattern) {
            self.inner.broker.unsubscribe_pattern(pattern).await?;
            info!(pattern = %pattern, "Unsubscribed pattern");
        }
        Ok(())
    }

    /// Remove one handler registration.
    pub async fn unsubscribe_handler(
        &self,
        pattern: &str,
        id: SubscriptionId,
    ) -> Result<()> {
        let (removed, pattern_empty) = self.inner.subscriptions.remove_handler(pattern, id);
        if removed && pattern_empty {
            self.inner.broker.unsubscribe_pattern(pattern).await?;
        }
        if removed {
            info!(pattern = %pattern, subscription_id = %id, "Unsubscribed handler");
        }
        Ok(())
    }

    /// Register a payload schema for an event type. Call at startup,
    /// before traffic begins.
    pub fn register_schema(&self, schema: EventSchema) {
        self.inner.registry.register(schema);
    }

    /// Remove a registered payload schema.
    pub fn remove_schema(&self, event_type: &str) -> bool {
        self.inner.registry.remove(event_type)
    }

    /// Validate a batch of already-built events, collecting all failures.
    pub fn validate_batch(&self, events: &[Event]) -> Result<()> {
        self.inner.registry.validate_batch(events)
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Healthy only when the broker connections are ready and the bus is
    /// not mid-shutdown.
    pub async fn health_check(&self) -> bool {
        !self.inner.shutting_down.load(Ordering::Relaxed)
            && self.inner.broker.health_check().await
    }

    /// Number of scheduled, not-yet-delivered delayed events.
    pub async fn delayed_events_count(&self) -> Result<u64> {
        self.inner.broker.scheduled_count().await
    }

    /// Number of stored dead-letter records.
    pub async fn dead_letter_queue_count(&self) -> Result<u64> {
        self.inner.broker.dead_letter_count().await
    }

    /// Page through stored dead-letter records, newest first. Entries that
    /// no longer parse are skipped with a warning.
    pub async fn dead_letter_records(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>> {
        let raw = self.inner.broker.dead_letters(offset, limit).await?;
        let mut records = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<DeadLetterRecord>(&entry) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping unreadable dead-letter record"),
            }
        }
        Ok(records)
    }

    /// Manually re-publish a dead-lettered event through the normal
    /// publish path.
    ///
    /// The replayed event gets a fresh id, keeps the original correlation
    /// id, and records the original event id as its causation; the
    /// original id stays inside the removed record for audit. Returns the
    /// new event id.
    pub async fn replay_dead_letter(&self, record_id: Uuid) -> Result<Uuid> {
        let mut offset = 0usize;
        loop {
            let page = self
                .inner
                .broker
                .dead_letters(offset, DEAD_LETTER_PAGE)
                .await?;
            if page.is_empty() {
                return Err(EventBusError::DeadLetterQueueError(format!(
                    "no dead-letter record with id {}",
                    record_id
                )));
            }
            for raw in &page {
                let Ok(record) = serde_json::from_str::<DeadLetterRecord>(raw) else {
                    continue;
                };
                if record.id != record_id {
                    continue;
                }
                let Some(original) = record.parsed_event() else {
                    return Err(EventBusError::EventValidationError(format!(
                        "dead-letter record {} does not hold a replayable event",
                        record_id
                    )));
                };
                let overrides = MetadataOverrides {
                    correlation_id: Some(original.metadata.correlation_id),
                    causation_id: Some(original.id),
                    user_id: original.metadata.user_id.clone(),
                    session_id: original.metadata.session_id.clone(),
                    version: Some(original.metadata.version.clone()),
                    trace_id: Some(original.metadata.trace_id),
                };
                let new_id = self
                    .publish_with(
                        &original.event_type,
                        original.data.clone(),
                        overrides,
                        PublishOptions::default(),
                    )
                    .await?;
                self.inner.broker.remove_dead_letter(raw).await?;
                info!(
                    record_id = %record_id,
                    original_event_id = %original.id,
                    new_event_id = %new_id,
                    "Replayed dead-lettered event"
                );
                return Ok(new_id);
            }
            offset += DEAD_LETTER_PAGE;
        }
    }

    /// Mark the bus as shutting down, stop background loops, and close
    /// the broker, bounded by the configured shutdown window.
    ///
    /// New publishes are rejected immediately once shutdown begins.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shutting_down.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        info!(
            subscriptions = self.inner.subscriptions.len(),
            "Event bus shutting down"
        );

        let tasks: Vec<JoinHandle<()>> = {
            let mut held = self.inner.tasks.lock();
            held.drain(..).collect()
        };
        let broker = self.inner.broker.clone();
        let patterns = self.inner.subscriptions.patterns();
        let close = async move {
            for task in tasks {
                task.abort();
            }
            for pattern in patterns {
                if let Err(e) = broker.unsubscribe_pattern(&pattern).await {
                    warn!(pattern = %pattern, error = %e, "Unsubscribe during shutdown failed");
                }
            }
            broker.close().await
        };
        match tokio::time::timeout(self.inner.config.shutdown_timeout, close).await {
            Ok(result) => result,
            Err(_) => Err(EventBusError::ConnectionTimeoutError(format!(
                "shutdown did not complete within {:?}",
                self.inner.config.shutdown_timeout
            ))),
        }
    }

    /// Default subscribe options derived from process configuration.
    pub fn default_subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            max_retries: self.inner.config.default_max_retries,
            timeout: self.inner.config.default_handler_timeout,
            concurrency: self.inner.config.default_concurrency,
            dead_letter_enabled: self.inner.config.dead_letter_enabled,
        }
    }

    pub(crate) fn build_event(
        &self,
        channel: &str,
        data: serde_json::Value,
        metadata: MetadataOverrides,
    ) -> Event {
        Event::build(channel, &self.inner.config.service_name, data, metadata)
    }

    pub(crate) fn validate_event(&self, event: &Event) -> Result<()> {
        self.inner.registry.validate(event)
    }

    pub(crate) fn broker(&self) -> Arc<dyn EventBroker> {
        self.inner.broker.clone()
    }

    pub(crate) fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    pub(crate) fn add_published(&self, n: u64) {
        self.inner.stats.add_published(n);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Relaxed)
    }
}

/// Receives raw broker messages, validates them, and fans each one out to
/// the registrations of the delivering pattern. Failures only ever affect
/// the one message they belong to.
async fn dispatch_loop(
    inner: Arc<BusInner>,
    mut messages: tokio::sync::mpsc::UnboundedReceiver<RawMessage>,
) {
    while let Some(raw) = messages.recv().await {
        if inner.shutting_down.load(Ordering::Relaxed) {
            break;
        }
        inner.stats.inc_received();

        let event: Event = match serde_json::from_str(&raw.payload) {
            Ok(event) => event,
            Err(e) => {
                reject_message(
                    &inner,
                    &raw,
                    "DeserializationError",
                    &format!("message is not a valid event envelope: {}", e),
                )
                .await;
                continue;
            }
        };
        if let Err(e) = inner.registry.validate(&event) {
            reject_message(&inner, &raw, "EventValidationError", &e.to_string()).await;
            continue;
        }

        // PSUBSCRIBE delivers one copy per matching pattern, so routing by
        // the delivering pattern invokes each registration exactly once.
        let subscriptions: Vec<Arc<Subscription>> = inner
            .subscriptions
            .for_pattern(&raw.pattern)
            .into_iter()
            .filter(|s| pattern_matches(&s.pattern, &raw.channel))
            .collect();
        if subscriptions.is_empty() {
            debug!(channel = %raw.channel, pattern = %raw.pattern, "No local handlers for message");
            continue;
        }

        for subscription in subscriptions {
            let inner = inner.clone();
            let event = event.clone();
            let channel = raw.channel.clone();
            tokio::spawn(async move {
                deliver(inner, subscription, event, channel).await;
            });
        }
    }
    debug!("Dispatch loop stopped");
}

/// A message that never reaches a handler: count it, log it, dead-letter
/// the raw payload unless disabled.
async fn reject_message(inner: &Arc<BusInner>, raw: &RawMessage, name: &str, reason: &str) {
    warn!(channel = %raw.channel, error = %reason, "Rejecting undeliverable message");
    inner.stats.inc_failed();
    inner.stats.record_error(reason);
    if !inner.config.dead_letter_enabled {
        return;
    }
    let record = DeadLetterRecord::for_rejected_message(&raw.channel, &raw.payload, name, reason);
    push_dead_letter(inner, &record).await;
}

async fn push_dead_letter(inner: &Arc<BusInner>, record: &DeadLetterRecord) {
    let payload = match serde_json::to_string(record) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "Failed to serialize dead-letter record");
            return;
        }
    };
    match inner.broker.push_dead_letter(&payload).await {
        Ok(()) => inner.stats.inc_dead_lettered(),
        Err(e) => error!(error = %e, "Failed to persist dead-letter record"),
    }
}

/// Drive one delivery to one registration: bounded concurrency, timeout,
/// sequential retries with exponential backoff, then dead-letter routing.
async fn deliver(inner: Arc<BusInner>, subscription: Arc<Subscription>, event: Event, channel: String) {
    let Ok(_permit) = subscription.gate.clone().acquire_owned().await else {
        return;
    };

    let options = &subscription.options;
    let max_attempts = options.max_retries.max(1);
    let mut history: Vec<RetryAttempt> = Vec::new();
    let mut attempt = 0u32;

    let (error_name, error_message) = loop {
        attempt += 1;
        let outcome =
            tokio::time::timeout(options.timeout, (subscription.handler)(event.clone())).await;

        let (name, message, terminal) = match outcome {
            Ok(Ok(())) => {
                if attempt > 1 {
                    debug!(
                        event_id = %event.id,
                        channel = %channel,
                        attempt = attempt,
                        "Handler succeeded after retry"
                    );
                }
                return;
            }
            Ok(Err(HandlerError::Terminal(reason))) => {
                ("HandlerExecutionError", reason, true)
            }
            Ok(Err(HandlerError::Retryable(reason))) => {
                ("HandlerExecutionError", reason, false)
            }
            Err(_) => (
                "HandlerTimeoutError",
                format!(
                    "handler did not settle within {} ms",
                    options.timeout.as_millis()
                ),
                false,
            ),
        };

        history.push(RetryAttempt {
            attempt,
            failed_at: Utc::now(),
            error: message.clone(),
        });
        warn!(
            event_id = %event.id,
            channel = %channel,
            attempt = attempt,
            max_attempts = max_attempts,
            error = %message,
            "Event handler failed"
        );

        if terminal || attempt >= max_attempts {
            break (name, message);
        }
        inner.stats.inc_retried();
        tokio::time::sleep(retry_delay(attempt, inner.config.retry_backoff_base)).await;
    };

    inner.stats.inc_failed();
    inner.stats.record_error(&error_message);
    error!(
        event_id = %event.id,
        channel = %channel,
        attempts = attempt,
        error = %error_message,
        "Handler permanently failed"
    );

    if options.dead_letter_enabled {
        let record = DeadLetterRecord::for_handler_failure(
            &event,
            &subscription.pattern,
            error_name,
            &error_message,
            history,
        );
        push_dead_letter(&inner, &record).await;
    }
}

/// Backoff before retry `attempt + 1`: base doubled per completed attempt.
fn retry_delay(attempt: u32, base: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_RETRY_DELAY)
}

/// Polls the delayed schedule and converts due entries into immediate
/// publishes. One entry failing to publish is logged and left in place for
/// the next scan; it never blocks the rest of the batch.
async fn delayed_scanner(inner: Arc<BusInner>) {
    let mut ticker = tokio::time::interval(inner.config.delayed_scan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if inner.shutting_down.load(Ordering::Relaxed) {
            break;
        }
        let now_ms = Utc::now().timestamp_millis();
        let due = match inner
            .broker
            .due_scheduled(now_ms, inner.config.delayed_scan_batch)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Delayed-event scan failed");
                continue;
            }
        };
        if due.is_empty() {
            continue;
        }

        let mut entries: Vec<(String, DelayedEnvelope)> = Vec::with_capacity(due.len());
        for raw in due {
            match serde_json::from_str::<DelayedEnvelope>(&raw) {
                Ok(envelope) => entries.push((raw, envelope)),
                Err(e) => {
                    warn!(error = %e, "Dropping unreadable delayed entry");
                    if let Err(e) = inner.broker.remove_scheduled(&raw).await {
                        warn!(error = %e, "Failed to drop unreadable delayed entry");
                    }
                }
            }
        }
        // Advisory priority: highest first within the batch.
        entries.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));

        for (raw, envelope) in entries {
            let payload = match serde_json::to_string(&envelope.event) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize delayed event");
                    continue;
                }
            };
            match inner.broker.publish(&envelope.channel, &payload).await {
                Ok(()) => {
                    inner.stats.inc_published();
                    debug!(
                        event_id = %envelope.event.id,
                        channel = %envelope.channel,
                        "Published delayed event"
                    );
                    if let Err(e) = inner.broker.remove_scheduled(&raw).await {
                        warn!(error = %e, "Failed to remove published delayed entry");
                    }
                }
                Err(e) => {
                    warn!(
                        event_id = %envelope.event.id,
                        channel = %envelope.channel,
                        error = %e,
                        "Failed to publish delayed event, leaving entry for next scan"
                    );
                }
            }
        }
    }
    debug!("Delayed-event scanner stopped");
}
