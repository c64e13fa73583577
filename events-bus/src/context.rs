// Correlation and tracing context threading
use crate::event::{Event, MetadataOverrides};
use uuid::Uuid;

/// Correlation context for one logical business operation.
///
/// A root context starts a fresh correlation chain; a context derived from
/// an event keeps the chain's correlation and trace ids and records the
/// triggering event as the causation, so follow-up events published while
/// handling it are causally linked.
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub trace_id: Uuid,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl CorrelationContext {
    /// Start a fresh correlation chain.
    pub fn new_root() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            causation_id: None,
            trace_id: Uuid::new_v4(),
            user_id: None,
            session_id: None,
        }
    }

    /// Derive the context for work triggered by `event`.
    pub fn for_event(event: &Event) -> Self {
        Self {
            correlation_id: event.metadata.correlation_id,
            causation_id: Some(event.id),
            trace_id: event.metadata.trace_id,
            user_id: event.metadata.user_id.clone(),
            session_id: event.metadata.session_id.clone(),
        }
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Metadata overrides carrying this context into a publish call.
    pub fn overrides(&self) -> MetadataOverrides {
        MetadataOverrides {
            correlation_id: Some(self.correlation_id),
            causation_id: self.causation_id,
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            version: None,
            trace_id: Some(self.trace_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_context_generates_fresh_ids() {
        let a = CorrelationContext::new_root();
        let b = CorrelationContext::new_root();
        assert_ne!(a.correlation_id, b.correlation_id);
        assert!(a.causation_id.is_none());
    }

    #[test]
    fn derived_context_links_cause_and_keeps_chain() {
        let event = Event::build(
            "patient.created",
            "patient-service",
            json!({"patientId": "pt-1"}),
            CorrelationContext::new_root().with_user("u-9").overrides(),
        );
        let derived = CorrelationContext::for_event(&event);
        assert_eq!(derived.correlation_id, event.metadata.correlation_id);
        assert_eq!(derived.trace_id, event.metadata.trace_id);
        assert_eq!(derived.causation_id, Some(event.id));
        assert_eq!(derived.user_id.as_deref(), Some("u-9"));

        let follow_up = Event::build(
            "clinical.note_created",
            "clinical-service",
            json!({"noteId": "n-1", "patientId": "pt-1", "authorId": "u-9"}),
            derived.overrides(),
        );
        assert_eq!(
            follow_up.metadata.correlation_id,
            event.metadata.correlation_id
        );
        assert_eq!(follow_up.metadata.causation_id, Some(event.id));
    }
}
