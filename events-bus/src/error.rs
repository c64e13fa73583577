// Error taxonomy for the event bus
//
// Every failure category carries a retryable flag so callers and the
// dispatch loop can decide between retry, back-off, and terminal routing
// without inspecting error messages.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventBusError {
    /// Broker connection could not be established or was lost
    #[error("Broker connection failed: {0}")]
    ConnectionError(String),

    /// Broker connection attempt did not complete in time
    #[error("Broker connection timed out: {0}")]
    ConnectionTimeoutError(String),

    /// Reconnect attempts are exhausted; the connection is terminally down
    #[error("Broker reconnect gave up after {attempts} attempts")]
    MaxRetriesExceededError { attempts: u32 },

    /// Publish failed; retryable unless it wraps a validation failure
    #[error("Publish to channel '{channel}' failed: {source}")]
    PublishError {
        channel: String,
        #[source]
        source: Box<EventBusError>,
    },

    /// Event envelope or payload violates its contract
    #[error("Event validation failed: {0}")]
    EventValidationError(String),

    /// Serialized event exceeds the size limit
    #[error("Event size {size} bytes exceeds limit of {limit} bytes")]
    EventSizeExceededError { size: usize, limit: usize },

    /// Channel name is empty or unusable
    #[error("Channel not found: {0}")]
    ChannelNotFoundError(String),

    /// Subscription could not be registered with the broker
    #[error("Subscription for pattern '{pattern}' failed: {reason}")]
    SubscriptionError { pattern: String, reason: String },

    /// Handler did not settle within its timeout
    #[error("Handler on channel '{channel}' timed out after {timeout_ms} ms")]
    HandlerTimeoutError { channel: String, timeout_ms: u64 },

    /// Handler reported a failure
    #[error("Handler on channel '{channel}' failed: {reason}")]
    HandlerExecutionError { channel: String, reason: String },

    /// Subscription pattern is syntactically invalid
    #[error("Invalid subscription pattern: {0}")]
    PatternValidationError(String),

    /// Dead-letter store operation failed
    #[error("Dead letter queue error: {0}")]
    DeadLetterQueueError(String),

    /// Dead-letter store is at capacity
    #[error("Dead letter queue is full ({len} records, limit {limit})")]
    DeadLetterQueueFullError { len: u64, limit: u64 },

    /// Generic input validation failure
    #[error("Validation failed: {0}")]
    ValidationError(String),

    /// Invalid configuration, surfaced at startup
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Caller should back off before retrying
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceededError(String),

    /// Downstream circuit is open; not retryable until reset
    #[error("Circuit breaker open: {0}")]
    CircuitBreakerOpenError(String),

    #[error("Event serialization failed: {0}")]
    SerializationError(String),

    #[error("Event deserialization failed: {0}")]
    DeserializationError(String),

    #[error("Health check failed: {0}")]
    HealthCheckError(String),

    /// Partial batch failure; reports counts, the batch is not retried whole
    #[error("Batch processing failed: {failed} of {total} events rejected")]
    BatchProcessingError {
        failed: usize,
        total: usize,
        failures: Vec<BatchFailure>,
    },

    /// Wrapped internal errors
    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

/// One rejected entry inside a batch operation
#[derive(Debug, Clone)]
pub struct BatchFailure {
    /// Position of the event within the submitted batch
    pub index: usize,
    /// Event id when the envelope was intact enough to carry one
    pub event_id: Option<uuid::Uuid>,
    pub reason: String,
}

impl std::fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.event_id {
            Some(id) => write!(f, "event {} at index {}: {}", id, self.index, self.reason),
            None => write!(f, "event at index {}: {}", self.index, self.reason),
        }
    }
}

impl EventBusError {
    /// Whether the operation that produced this error may be retried.
    ///
    /// Publish failures inherit non-retryability from a wrapped validation
    /// failure; everything else follows the fixed taxonomy.
    pub fn retryable(&self) -> bool {
        match self {
            Self::ConnectionError(_)
            | Self::ConnectionTimeoutError(_)
            | Self::SubscriptionError { .. }
            | Self::HandlerTimeoutError { .. }
            | Self::HandlerExecutionError { .. }
            | Self::RateLimitExceededError(_) => true,
            Self::PublishError { source, .. } => !source.is_validation(),
            _ => false,
        }
    }

    /// Whether this error belongs to the validation family.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EventValidationError(_)
                | Self::EventSizeExceededError { .. }
                | Self::PatternValidationError(_)
                | Self::ValidationError(_)
        )
    }
}

/// Result type alias for event bus operations
pub type Result<T> = std::result::Result<T, EventBusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(EventBusError::ConnectionError("refused".into()).retryable());
        assert!(EventBusError::ConnectionTimeoutError("5s".into()).retryable());
        assert!(EventBusError::RateLimitExceededError("100 rps".into()).retryable());
        assert!(EventBusError::HandlerTimeoutError {
            channel: "patient.created".into(),
            timeout_ms: 30_000,
        }
        .retryable());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!EventBusError::MaxRetriesExceededError { attempts: 10 }.retryable());
        assert!(!EventBusError::EventValidationError("missing id".into()).retryable());
        assert!(!EventBusError::CircuitBreakerOpenError("until reset".into()).retryable());
        assert!(!EventBusError::ConfigurationError("bad port".into()).retryable());
        assert!(
            !EventBusError::DeadLetterQueueFullError { len: 10_000, limit: 10_000 }.retryable()
        );
    }

    #[test]
    fn publish_retryability_follows_wrapped_cause() {
        let transport = EventBusError::PublishError {
            channel: "billing.invoice_generated".into(),
            source: Box::new(EventBusError::ConnectionError("reset".into())),
        };
        assert!(transport.retryable());

        let validation = EventBusError::PublishError {
            channel: "billing.invoice_generated".into(),
            source: Box::new(EventBusError::EventValidationError("amount".into())),
        };
        assert!(!validation.retryable());
    }

    #[test]
    fn batch_failure_display_includes_position() {
        let failure = BatchFailure {
            index: 3,
            event_id: None,
            reason: "payload must be an object".into(),
        };
        assert_eq!(
            failure.to_string(),
            "event at index 3: payload must be an object"
        );
    }
}
