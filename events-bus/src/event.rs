// Event types and structures
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Immutable record of something that happened in the system.
///
/// The serialized form of this struct is the wire envelope:
/// `{id, type, source, timestamp, data, metadata}` with an ISO-8601
/// timestamp. Once published an event is never rebuilt; retries and
/// redelivery reuse the identical serialized payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Time-sortable unique identifier, assigned at publish time
    pub id: Uuid,
    /// Dot-namespaced `<aggregate>.<action>` type, also the routing channel
    #[serde(rename = "type")]
    pub event_type: String,
    /// Name of the producing service
    pub source: String,
    /// Creation instant; must not be in the future
    pub timestamp: DateTime<Utc>,
    /// Type-specific payload, opaque to the bus beyond schema validation
    pub data: Value,
    #[serde(default)]
    pub metadata: EventMetadata,
}

/// Correlation and actor context attached to every event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Shared by all events of one logical business operation
    #[serde(default = "Uuid::new_v4")]
    pub correlation_id: Uuid,
    /// Id of the event that caused this one to be published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Schema version of the payload
    #[serde(default = "default_version")]
    pub version: String,
    /// Distributed-tracing correlation id
    #[serde(default = "Uuid::new_v4")]
    pub trace_id: Uuid,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            causation_id: None,
            user_id: None,
            session_id: None,
            version: default_version(),
            trace_id: Uuid::new_v4(),
        }
    }
}

/// Caller-supplied metadata for a publish call.
///
/// Present values win over the generated defaults; absent correlation and
/// trace ids are freshly generated at publish time.
#[derive(Debug, Clone, Default)]
pub struct MetadataOverrides {
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub version: Option<String>,
    pub trace_id: Option<Uuid>,
}

impl MetadataOverrides {
    fn into_metadata(self) -> EventMetadata {
        EventMetadata {
            correlation_id: self.correlation_id.unwrap_or_else(Uuid::new_v4),
            causation_id: self.causation_id,
            user_id: self.user_id,
            session_id: self.session_id,
            version: self.version.unwrap_or_else(default_version),
            trace_id: self.trace_id.unwrap_or_else(Uuid::new_v4),
        }
    }
}

/// Per-publish options
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Deliver after this delay instead of immediately
    pub delay: Option<std::time::Duration>,
    /// Advisory priority; due delayed entries drain highest-first
    pub priority: Option<u8>,
}

impl Event {
    /// Build a new event for publishing.
    ///
    /// Assigns a time-sortable v7 id and stamps the current instant.
    pub fn build(
        event_type: &str,
        source: &str,
        data: Value,
        overrides: MetadataOverrides,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
            data,
            metadata: overrides.into_metadata(),
        }
    }

    /// The `<aggregate>` part of the dot-namespaced type.
    pub fn aggregate(&self) -> &str {
        self.event_type
            .split_once('.')
            .map(|(aggregate, _)| aggregate)
            .unwrap_or(&self.event_type)
    }

    /// Classify this event into a known domain or `Unknown`.
    pub fn class(&self) -> EventClass {
        EventClass::of(&self.event_type)
    }
}

/// Known event domains plus an explicit `Unknown` variant.
///
/// Known domains get strict, schema-driven validation; unknown domains fall
/// through to a permissive structural check so forward-compatible producers
/// are not blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventClass {
    Patient,
    Appointment,
    Clinical,
    Billing,
    Payment,
    User,
    System,
    /// Aggregate tag the bus has no contract for
    Unknown(String),
}

impl EventClass {
    /// Classify a dot-namespaced event type by its aggregate tag.
    pub fn of(event_type: &str) -> Self {
        let aggregate = event_type
            .split_once('.')
            .map(|(aggregate, _)| aggregate)
            .unwrap_or(event_type);
        match aggregate {
            "patient" => Self::Patient,
            "appointment" => Self::Appointment,
            "clinical" => Self::Clinical,
            "billing" | "invoice" => Self::Billing,
            "payment" => Self::Payment,
            "user" => Self::User,
            "system" => Self::System,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}
