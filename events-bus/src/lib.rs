//! Event-driven messaging bus for RustCare Engine
//!
//! This crate provides the inter-service publish/subscribe layer used to
//! propagate domain events (patient created, invoice generated, payment
//! received, ...) across independently deployed services:
//! - Publish/Subscribe with exact and wildcard channel patterns
//! - Schema-validated payloads: strict for known event types, permissive
//!   for unregistered ones
//! - Handler retries with exponential backoff and dead-letter routing
//! - Bounded per-subscription handler concurrency
//! - Delayed (scheduled) event delivery
//! - Batch publishing for bulk-import producers
//! - Correlation, causation, and trace id threading
//! - Redis-backed broker with reconnecting connections, plus an
//!   in-process broker for tests and embedded deployments
//!
//! # Example
//!
//! ```rust,no_run
//! use events_bus::{EventBus, EventBusConfig, SubscribeOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = EventBus::connect(EventBusConfig::from_env()?).await?;
//!
//!     bus.subscribe(
//!         "patient.*",
//!         |event| async move {
//!             println!("received {} ({})", event.event_type, event.id);
//!             Ok(())
//!         },
//!         SubscribeOptions::default(),
//!     )
//!     .await?;
//!
//!     let event_id = bus
//!         .publish("patient.created", json!({ "patientId": "pt-1" }))
//!         .await?;
//!     println!("published {event_id}");
//!
//!     bus.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod brokers;
pub mod bus;
pub mod config;
pub mod context;
pub mod dlq;
pub mod error;
pub mod event;
pub mod handlers;
pub mod publisher;
pub mod schema;
pub mod stats;
pub mod subscriber;

pub use brokers::{EventBroker, MemoryBroker, RawMessage, RedisBroker, RedisBrokerConfig};
pub use bus::EventBus;
pub use config::EventBusConfig;
pub use context::CorrelationContext;
pub use dlq::{DeadLetterError, DeadLetterRecord, RetryAttempt};
pub use error::{BatchFailure, EventBusError, Result};
pub use event::{Event, EventClass, EventMetadata, MetadataOverrides, PublishOptions};
pub use handlers::{boxed, BoxedHandler, HandlerError, HandlerResult};
pub use publisher::BatchPublisher;
pub use schema::{EventSchema, FieldKind, FieldSpec, SchemaRegistry};
pub use stats::{BusStats, StatsSnapshot};
pub use subscriber::{pattern_matches, SubscribeOptions, SubscriptionId};
