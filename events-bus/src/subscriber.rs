// Subscription registry and pattern matching
use crate::error::{EventBusError, Result};
use crate::handlers::BoxedHandler;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Per-registration delivery options
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Total handler attempts per delivery before dead-lettering
    pub max_retries: u32,
    /// Wall-clock bound on one handler invocation
    pub timeout: Duration,
    /// In-flight invocation bound for this registration
    pub concurrency: usize,
    /// Persist terminally failed deliveries to the dead-letter store
    pub dead_letter_enabled: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(30),
            concurrency: 10,
            dead_letter_enabled: true,
        }
    }
}

/// Identifier returned by subscribe, used for targeted unsubscribe
pub type SubscriptionId = Uuid;

/// One `(pattern, handler)` registration.
///
/// Two registrations under the same literal pattern keep independent
/// options and independent concurrency gates; options are never merged.
pub(crate) struct Subscription {
    pub id: SubscriptionId,
    pub pattern: String,
    pub handler: BoxedHandler,
    pub options: SubscribeOptions,
    /// Counting semaphore bounding in-flight invocations
    pub gate: Arc<Semaphore>,
}

impl Subscription {
    pub(crate) fn new(pattern: &str, handler: BoxedHandler, options: SubscribeOptions) -> Self {
        let permits = options.concurrency.max(1);
        Self {
            id: Uuid::new_v4(),
            pattern: pattern.to_string(),
            handler,
            options,
            gate: Arc::new(Semaphore::new(permits)),
        }
    }
}

/// Registrations keyed by pattern; owned exclusively by the bus core.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: DashMap<String, Vec<Arc<Subscription>>>,
}

impl SubscriptionTable {
    /// Insert a registration. Returns true when this is the first
    /// registration for its pattern (a broker-level subscribe is needed).
    pub fn insert(&self, subscription: Arc<Subscription>) -> bool {
        let mut entry = self.entries.entry(subscription.pattern.clone()).or_default();
        entry.push(subscription);
        entry.len() == 1
    }

    /// Remove every registration under a pattern. Returns true when the
    /// pattern existed.
    pub fn remove_pattern(&self, pattern: &str) -> bool {
        self.entries.remove(pattern).is_some()
    }

    /// Remove one registration. Returns `(removed, pattern_now_empty)`.
    pub fn remove_handler(&self, pattern: &str, id: SubscriptionId) -> (bool, bool) {
        let Some(mut entry) = self.entries.get_mut(pattern) else {
            return (false, false);
        };
        let before = entry.len();
        entry.retain(|s| s.id != id);
        let removed = entry.len() < before;
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.entries.remove(pattern);
        }
        (removed, empty)
    }

    /// Registrations under one literal pattern.
    pub fn for_pattern(&self, pattern: &str) -> Vec<Arc<Subscription>> {
        self.entries
            .get(pattern)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn patterns(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }
}

/// Reject patterns the broker cannot subscribe.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.trim().is_empty() {
        return Err(EventBusError::PatternValidationError(
            "pattern is empty".to_string(),
        ));
    }
    if pattern.chars().any(char::is_whitespace) {
        return Err(EventBusError::PatternValidationError(format!(
            "pattern '{}' contains whitespace",
            pattern
        )));
    }
    Ok(())
}

/// Glob match of a subscription pattern against a channel name.
///
/// `*` matches everything; each `*` inside a pattern matches any run of
/// characters, so `patient.*` matches `patient.created` but not
/// `appointment.scheduled`.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == channel;
    }

    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    if !channel.starts_with(first) {
        return false;
    }
    let mut rest = &channel[first.len()..];

    let remaining: Vec<&str> = parts.collect();
    for (i, part) in remaining.iter().enumerate() {
        if part.is_empty() {
            // Trailing or doubled '*' matches any remainder.
            if i == remaining.len() - 1 {
                return true;
            }
            continue;
        }
        if i == remaining.len() - 1 {
            return rest.ends_with(part);
        }
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    true
}
