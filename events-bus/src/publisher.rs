// Buffering batch publisher for bulk-import style producers
use crate::bus::EventBus;
use crate::error::{EventBusError, Result};
use crate::event::{Event, MetadataOverrides};
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Accumulates events and publishes them as one pipelined broker write.
///
/// A buffer flush happens when the batch-size threshold is reached or on
/// the periodic flush interval, whichever comes first. Events are
/// validated at `add` time, so a flush only carries well-formed
/// envelopes. Call [`BatchPublisher::destroy`] before dropping to flush
/// the tail and stop the timer.
pub struct BatchPublisher {
    bus: EventBus,
    buffer: Arc<Mutex<Vec<(String, Event)>>>,
    max_batch: usize,
    timer: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BatchPublisher {
    /// Batch publisher with thresholds from the bus configuration.
    pub fn new(bus: EventBus) -> Self {
        let max_batch = bus.config().batch_size.max(1);
        let interval = bus.config().batch_flush_interval;
        Self::with_thresholds(bus, max_batch, interval)
    }

    pub fn with_thresholds(bus: EventBus, max_batch: usize, interval: Duration) -> Self {
        let buffer: Arc<Mutex<Vec<(String, Event)>>> = Arc::new(Mutex::new(Vec::new()));
        let timer_bus = bus.clone();
        let timer_buffer = buffer.clone();
        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if timer_bus.is_shutting_down() {
                    break;
                }
                if let Err(e) = flush_buffer(&timer_bus, &timer_buffer).await {
                    warn!(error = %e, "Periodic batch flush failed");
                }
            }
        });

        Self {
            bus,
            buffer,
            max_batch: max_batch.max(1),
            timer: SyncMutex::new(Some(timer)),
        }
    }

    /// Buffer one event for the next flush. Returns the generated event
    /// id; validation failures reject the event without buffering it.
    pub async fn add(
        &self,
        channel: &str,
        data: serde_json::Value,
        metadata: MetadataOverrides,
    ) -> Result<Uuid> {
        if self.bus.is_shutting_down() {
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
        let event = self.bus.build_event(channel, data, metadata);
        self.bus
            .validate_event(&event)
            .map_err(|e| EventBusError::PublishError {
                channel: channel.to_string(),
                source: Box::new(e),
            })?;
        let id = event.id;

        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push((channel.to_string(), event));
            buffer.len() >= self.max_batch
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(id)
    }

    /// Publish everything currently buffered. Returns the flushed count.
    pub async fn flush(&self) -> Result<usize> {
        flush_buffer(&self.bus, &self.buffer).await
    }

    /// Flush the tail and stop the periodic timer.
    pub async fn destroy(&self) -> Result<usize> {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.abort();
        }
        self.flush().await
    }
}

async fn flush_buffer(
    bus: &EventBus,
    buffer: &Arc<Mutex<Vec<(String, Event)>>>,
) -> Result<usize> {
    let drained: Vec<(String, Event)> = {
        let mut held = buffer.lock().await;
        std::mem::take(&mut *held)
    };
    if drained.is_empty() {
        return Ok(0);
    }
    let total = drained.len();

    let mut messages = Vec::with_capacity(total);
    for (channel, event) in &drained {
        match serde_json::to_string(event) {
            Ok(payload) => messages.push((channel.clone(), payload)),
            Err(e) => warn!(event_id = %event.id, error = %e, "Skipping unserializable event"),
        }
    }

    if let Err(e) = bus.broker().publish_many(&messages).await {
        warn!(failed = messages.len(), error = %e, "Batch publish failed");
        return Err(EventBusError::BatchProcessingError {
            failed: messages.len(),
            total,
            failures: Vec::new(),
        });
    }

    bus.add_published(messages.len() as u64);
    debug!(count = messages.len(), "Flushed event batch");
    Ok(messages.len())
}
