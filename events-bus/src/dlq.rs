// Dead-letter records for terminally failed deliveries
use crate::event::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One failed handler attempt inside a record's retry history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub attempt: u32,
    pub failed_at: DateTime<Utc>,
    pub error: String,
}

/// Last error of a dead-lettered delivery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterError {
    /// Taxonomy name, e.g. `HandlerExecutionError`
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// A terminally failed delivery, persisted after retries are exhausted.
///
/// `event` holds the envelope exactly as received (malformed messages keep
/// their raw payload here), so manual replay resubmits identical data. The
/// record is consumed by administrative replay, never by the bus
/// automatically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    /// Record identity, distinct from the event id
    pub id: Uuid,
    /// Original envelope, or a raw-payload wrapper for malformed messages
    pub event: Value,
    /// Pattern of the registration whose handler failed, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub error: DeadLetterError,
    pub retry_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_history: Vec<RetryAttempt>,
}

impl DeadLetterRecord {
    /// Record for a handler that exhausted its retries.
    pub(crate) fn for_handler_failure(
        event: &Event,
        pattern: &str,
        error_name: &str,
        error_message: &str,
        retry_history: Vec<RetryAttempt>,
    ) -> Self {
        let now = Utc::now();
        let first_failed_at = retry_history.first().map(|a| a.failed_at).unwrap_or(now);
        let last_failed_at = retry_history.last().map(|a| a.failed_at).unwrap_or(now);
        Self {
            id: Uuid::new_v4(),
            event: serde_json::to_value(event).unwrap_or(Value::Null),
            pattern: Some(pattern.to_string()),
            error: DeadLetterError {
                name: error_name.to_string(),
                message: error_message.to_string(),
                stack: None,
            },
            retry_count: retry_history.len() as u32,
            first_failed_at,
            last_failed_at,
            retry_history,
        }
    }

    /// Record for a message that never reached a handler.
    pub(crate) fn for_rejected_message(
        channel: &str,
        raw_payload: &str,
        error_name: &str,
        error_message: &str,
    ) -> Self {
        let now = Utc::now();
        let event = serde_json::from_str::<Value>(raw_payload).unwrap_or_else(|_| {
            serde_json::json!({ "channel": channel, "rawPayload": raw_payload })
        });
        Self {
            id: Uuid::new_v4(),
            event,
            pattern: None,
            error: DeadLetterError {
                name: error_name.to_string(),
                message: error_message.to_string(),
                stack: None,
            },
            retry_count: 0,
            first_failed_at: now,
            last_failed_at: now,
            retry_history: Vec::new(),
        }
    }

    /// Parse the stored envelope back into an event, when it was one.
    pub fn parsed_event(&self) -> Option<Event> {
        serde_json::from_value(self.event.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MetadataOverrides;
    use serde_json::json;

    fn sample_event() -> Event {
        Event::build(
            "payment.received",
            "billing-service",
            json!({"paymentId": "p1", "amount": 500}),
            MetadataOverrides::default(),
        )
    }

    #[test]
    fn handler_failure_record_keeps_history_and_event() {
        let event = sample_event();
        let history = vec![
            RetryAttempt {
                attempt: 1,
                failed_at: Utc::now(),
                error: "db unavailable".into(),
            },
            RetryAttempt {
                attempt: 2,
                failed_at: Utc::now(),
                error: "db unavailable".into(),
            },
        ];
        let record = DeadLetterRecord::for_handler_failure(
            &event,
            "payment.*",
            "HandlerExecutionError",
            "db unavailable",
            history,
        );
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.retry_history.len(), 2);
        assert_eq!(record.pattern.as_deref(), Some("payment.*"));
        let restored = record.parsed_event().expect("stored envelope parses");
        assert_eq!(restored.id, event.id);
        assert_eq!(restored.data, event.data);
    }

    #[test]
    fn rejected_message_record_keeps_raw_payload() {
        let record = DeadLetterRecord::for_rejected_message(
            "patient.created",
            "{not json",
            "DeserializationError",
            "expected value",
        );
        assert!(record.parsed_event().is_none());
        assert_eq!(record.event["rawPayload"], "{not json");
        assert_eq!(record.error.name, "DeserializationError");
    }

    #[test]
    fn record_round_trips_through_json() {
        let event = sample_event();
        let record = DeadLetterRecord::for_handler_failure(
            &event,
            "payment.received",
            "HandlerTimeoutError",
            "timed out after 30000 ms",
            vec![RetryAttempt {
                attempt: 1,
                failed_at: Utc::now(),
                error: "timed out".into(),
            }],
        );
        let json = serde_json::to_string(&record).expect("serializes");
        let back: DeadLetterRecord = serde_json::from_str(&json).expect("parses");
        assert_eq!(back.id, record.id);
        assert_eq!(back.retry_history, record.retry_history);
    }
}
