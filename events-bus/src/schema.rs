// Event schema registry and validation
//
// Strict, field-by-field validation for the known, versioned event types;
// a permissive structural check for everything else so producers can ship
// new event types without a coordinated schema deployment.
use crate::error::{BatchFailure, EventBusError, Result};
use crate::event::{Event, EventClass};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Structural kind a payload field must satisfy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Uuid,
    /// RFC 3339 timestamp string
    Timestamp,
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Uuid => "uuid string",
            Self::Timestamp => "RFC 3339 timestamp",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Uuid => value
                .as_str()
                .map(|s| uuid::Uuid::parse_str(s).is_ok())
                .unwrap_or(false),
            Self::Timestamp => value
                .as_str()
                .map(|s| DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false),
        }
    }
}

/// One field contract within an event schema
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// Structural contract for one event type's payload
#[derive(Debug, Clone)]
pub struct EventSchema {
    event_type: String,
    fields: Vec<FieldSpec>,
}

impl EventSchema {
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn required(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: false,
        });
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Check a payload against this schema, collecting every violation.
    fn check(&self, data: &Value) -> Vec<String> {
        let mut problems = Vec::new();
        let Some(object) = data.as_object() else {
            problems.push("payload must be a JSON object".to_string());
            return problems;
        };
        for field in &self.fields {
            match object.get(&field.name) {
                Some(Value::Null) | None if field.required => {
                    problems.push(format!("missing required field '{}'", field.name));
                }
                Some(Value::Null) | None => {}
                Some(value) => {
                    if !field.kind.accepts(value) {
                        problems.push(format!(
                            "field '{}' must be a {}",
                            field.name,
                            field.kind.name()
                        ));
                    }
                }
            }
        }
        problems
    }
}

/// Process-wide mapping from event-type string to its payload contract.
///
/// Registration is meant to happen at service startup, before traffic
/// begins; the registry is not designed for concurrent runtime mutation
/// under load.
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, EventSchema>>,
    max_event_bytes: usize,
}

/// Serialized events above this size are rejected
pub const DEFAULT_MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Events older than this log a staleness warning but are not rejected
const STALE_EVENT_HOURS: i64 = 24;

impl SchemaRegistry {
    /// Empty registry; every event type gets the generic structural check.
    pub fn new(max_event_bytes: usize) -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            max_event_bytes,
        }
    }

    /// Registry preloaded with the contracts for the known healthcare
    /// event types.
    pub fn with_default_schemas(max_event_bytes: usize) -> Self {
        let registry = Self::new(max_event_bytes);
        for schema in default_schemas() {
            registry.register(schema);
        }
        registry
    }

    pub fn register(&self, schema: EventSchema) {
        self.schemas
            .write()
            .insert(schema.event_type.clone(), schema);
    }

    pub fn remove(&self, event_type: &str) -> bool {
        self.schemas.write().remove(event_type).is_some()
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.schemas.read().contains_key(event_type)
    }

    /// Validate one event's envelope, payload, and metadata.
    ///
    /// Envelope problems and schema violations fail with a non-retryable
    /// validation error; an unregistered event type only has to carry an
    /// object payload and logs a warning.
    pub fn validate(&self, event: &Event) -> Result<()> {
        if event.event_type.trim().is_empty() {
            return Err(EventBusError::EventValidationError(
                "event type is empty".to_string(),
            ));
        }
        if event.source.trim().is_empty() {
            return Err(EventBusError::EventValidationError(
                "event source is empty".to_string(),
            ));
        }
        if event.id.is_nil() {
            return Err(EventBusError::EventValidationError(
                "event id is nil".to_string(),
            ));
        }

        let now = Utc::now();
        if event.timestamp > now {
            return Err(EventBusError::EventValidationError(format!(
                "timestamp {} is in the future",
                event.timestamp.to_rfc3339()
            )));
        }
        let age = now.signed_duration_since(event.timestamp);
        if age.num_hours() >= STALE_EVENT_HOURS {
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                age_hours = age.num_hours(),
                "Event is older than 24 hours"
            );
        }

        if !is_semver_like(&event.metadata.version) {
            return Err(EventBusError::EventValidationError(format!(
                "metadata version '{}' is not a dotted numeric version",
                event.metadata.version
            )));
        }

        let serialized = serde_json::to_vec(event)
            .map_err(|e| EventBusError::SerializationError(e.to_string()))?;
        if serialized.len() > self.max_event_bytes {
            return Err(EventBusError::EventSizeExceededError {
                size: serialized.len(),
                limit: self.max_event_bytes,
            });
        }

        let schemas = self.schemas.read();
        match schemas.get(&event.event_type) {
            Some(schema) => {
                let problems = schema.check(&event.data);
                if !problems.is_empty() {
                    return Err(EventBusError::EventValidationError(format!(
                        "'{}' payload invalid: {}",
                        event.event_type,
                        problems.join("; ")
                    )));
                }
            }
            None => {
                if !event.data.is_object() {
                    return Err(EventBusError::EventValidationError(format!(
                        "'{}' has no registered schema and its payload is not a JSON object",
                        event.event_type
                    )));
                }
                match event.class() {
                    EventClass::Unknown(aggregate) => warn!(
                        event_type = %event.event_type,
                        aggregate = %aggregate,
                        "No schema registered for event type, applying generic checks"
                    ),
                    _ => warn!(
                        event_type = %event.event_type,
                        "Known domain but no schema registered for event type"
                    ),
                }
            }
        }

        Ok(())
    }

    /// Validate a list of events independently, collecting every failure.
    ///
    /// Does not short-circuit; an aggregate error enumerates each invalid
    /// event and its reason.
    pub fn validate_batch(&self, events: &[Event]) -> Result<()> {
        let mut failures = Vec::new();
        for (index, event) in events.iter().enumerate() {
            if let Err(e) = self.validate(event) {
                failures.push(BatchFailure {
                    index,
                    event_id: Some(event.id),
                    reason: e.to_string(),
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(EventBusError::BatchProcessingError {
                failed: failures.len(),
                total: events.len(),
                failures,
            })
        }
    }
}

fn is_semver_like(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Contracts for the known healthcare event types.
fn default_schemas() -> Vec<EventSchema> {
    vec![
        EventSchema::new("patient.created")
            .required("patientId", FieldKind::String)
            .optional("mrn", FieldKind::String)
            .optional("firstName", FieldKind::String)
            .optional("lastName", FieldKind::String)
            .optional("dateOfBirth", FieldKind::String)
            .optional("createdBy", FieldKind::String),
        EventSchema::new("patient.updated")
            .required("patientId", FieldKind::String)
            .required("updatedFields", FieldKind::Array)
            .optional("updatedBy", FieldKind::String),
        EventSchema::new("appointment.scheduled")
            .required("appointmentId", FieldKind::String)
            .required("patientId", FieldKind::String)
            .required("providerId", FieldKind::String)
            .required("scheduledFor", FieldKind::Timestamp)
            .optional("reason", FieldKind::String),
        EventSchema::new("appointment.cancelled")
            .required("appointmentId", FieldKind::String)
            .required("cancelledBy", FieldKind::String)
            .optional("cancellationReason", FieldKind::String),
        EventSchema::new("clinical.note_created")
            .required("noteId", FieldKind::String)
            .required("patientId", FieldKind::String)
            .required("authorId", FieldKind::String)
            .optional("noteType", FieldKind::String),
        EventSchema::new("billing.invoice_generated")
            .required("invoiceId", FieldKind::String)
            .required("patientId", FieldKind::String)
            .required("amount", FieldKind::Number)
            .optional("currency", FieldKind::String)
            .optional("dueDate", FieldKind::Timestamp),
        EventSchema::new("payment.received")
            .required("paymentId", FieldKind::String)
            .required("invoiceId", FieldKind::String)
            .required("amount", FieldKind::Number)
            .required("paymentMethod", FieldKind::String)
            .required("paymentDate", FieldKind::Timestamp)
            .required("receivedBy", FieldKind::String)
            .optional("instrumentType", FieldKind::String)
            .optional("paymentDetails", FieldKind::Object),
        EventSchema::new("user.registered")
            .required("userId", FieldKind::String)
            .required("email", FieldKind::String)
            .optional("role", FieldKind::String),
        EventSchema::new("system.service_health")
            .required("service", FieldKind::String)
            .required("status", FieldKind::String)
            .optional("detail", FieldKind::String),
    ]
}
