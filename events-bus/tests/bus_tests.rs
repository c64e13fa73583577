// End-to-end bus behavior over the in-process broker
use events_bus::{
    BatchPublisher, EventBus, EventBusConfig, HandlerError, MemoryBroker, MetadataOverrides,
    PublishOptions, SubscribeOptions,
};
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn test_config() -> EventBusConfig {
    let mut config = EventBusConfig::default();
    config.delayed_scan_interval = Duration::from_millis(200);
    config.retry_backoff_base = Duration::from_millis(10);
    config
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("events_bus=warn")),
        )
        .with_test_writer()
        .try_init();
}

async fn test_bus() -> (EventBus, Arc<MemoryBroker>) {
    init_tracing();
    let broker = Arc::new(MemoryBroker::default());
    let bus = EventBus::start(test_config(), broker.clone())
        .await
        .expect("bus starts");
    (bus, broker)
}

fn fast_options() -> SubscribeOptions {
    SubscribeOptions {
        max_retries: 3,
        timeout: Duration::from_secs(1),
        concurrency: 10,
        dead_letter_enabled: true,
    }
}

/// Subscribe a capturing handler that forwards received events.
async fn capture(bus: &EventBus, pattern: &str) -> mpsc::UnboundedReceiver<events_bus::Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.subscribe(
        pattern,
        move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        },
        fast_options(),
    )
    .await
    .expect("subscribe");
    rx
}

fn payment_data() -> serde_json::Value {
    json!({
        "paymentId": "p1",
        "invoiceId": "i1",
        "amount": 500,
        "paymentMethod": "cash",
        "paymentDate": chrono::Utc::now().to_rfc3339(),
        "receivedBy": "u1",
        "instrumentType": "full",
        "paymentDetails": {}
    })
}

async fn wait_until<F, Fut>(condition: F, wait_for: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + wait_for;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition().await
}

async fn dead_letter_count_is(bus: &EventBus, expected: u64, wait_for: Duration) -> bool {
    wait_until(
        || async { bus.dead_letter_queue_count().await.unwrap_or(u64::MAX) == expected },
        wait_for,
    )
    .await
}

#[tokio::test]
async fn published_envelope_is_complete() {
    let (bus, _broker) = test_bus().await;
    let mut rx = capture(&bus, "payment.received").await;

    let event_id = bus
        .publish("payment.received", payment_data())
        .await
        .expect("publish");

    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivered in time")
        .expect("event");
    assert_eq!(event.id, event_id);
    assert!(!event.id.is_nil());
    assert_eq!(event.event_type, "payment.received");
    assert_eq!(event.source, "rustcare-engine");
    assert_eq!(event.metadata.version, "1.0.0");
    assert_eq!(event.data["amount"], 500);
    assert!(event.timestamp <= chrono::Utc::now());

    let stats = bus.stats();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.received, 1);
}

#[tokio::test]
async fn schema_violation_rejects_publish_with_zero_wire_messages() {
    let (bus, _broker) = test_bus().await;
    let mut rx = capture(&bus, "payment.received").await;

    let mut bad = payment_data();
    bad["amount"] = json!("five hundred");
    let err = bus
        .publish("payment.received", bad)
        .await
        .expect_err("schema violation");
    assert!(!err.retryable());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(bus.stats().published, 0);
}

#[tokio::test]
async fn unknown_event_type_is_tolerated_and_delivered() {
    let (bus, _broker) = test_bus().await;
    let mut rx = capture(&bus, "inventory.*").await;

    bus.publish("inventory.restocked", json!({"sku": "a-1", "quantity": 3}))
        .await
        .expect("unknown types pass generic checks");

    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivered")
        .expect("event");
    assert_eq!(event.event_type, "inventory.restocked");
}

#[tokio::test]
async fn wildcard_patterns_route_by_prefix() {
    let (bus, _broker) = test_bus().await;
    let mut patient_rx = capture(&bus, "patient.*").await;
    let mut all_rx = capture(&bus, "*").await;

    bus.publish("patient.created", json!({"patientId": "pt-1"}))
        .await
        .expect("publish");
    bus.publish(
        "patient.updated",
        json!({"patientId": "pt-1", "updatedFields": ["firstName"]}),
    )
    .await
    .expect("publish");
    bus.publish(
        "appointment.scheduled",
        json!({
            "appointmentId": "ap-1",
            "patientId": "pt-1",
            "providerId": "dr-1",
            "scheduledFor": chrono::Utc::now().to_rfc3339(),
        }),
    )
    .await
    .expect("publish");

    let mut patient_types = Vec::new();
    for _ in 0..2 {
        let event = timeout(Duration::from_secs(2), patient_rx.recv())
            .await
            .expect("delivered")
            .expect("event");
        patient_types.push(event.event_type);
    }
    patient_types.sort();
    assert_eq!(patient_types, vec!["patient.created", "patient.updated"]);

    let mut all_types = Vec::new();
    for _ in 0..3 {
        let event = timeout(Duration::from_secs(2), all_rx.recv())
            .await
            .expect("delivered")
            .expect("event");
        all_types.push(event.event_type);
    }
    assert_eq!(all_types.len(), 3);
    assert!(all_types.contains(&"appointment.scheduled".to_string()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(patient_rx.try_recv().is_err());
}

#[tokio::test]
async fn failing_handler_retries_then_dead_letters() {
    let (bus, _broker) = test_bus().await;
    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = invocations.clone();

    bus.subscribe(
        "jobs.nightly_sync",
        move |_event| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Retryable("downstream unavailable".into()))
            }
        },
        fast_options(),
    )
    .await
    .expect("subscribe");

    let event_id = bus
        .publish("jobs.nightly_sync", json!({"runId": "r-1"}))
        .await
        .expect("publish");

    assert!(
        dead_letter_count_is(&bus, 1, Duration::from_secs(5)).await,
        "dead-letter record appears"
    );

    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    let stats = bus.stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.dead_lettered, 1);

    let records = bus.dead_letter_records(0, 10).await.expect("records");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.retry_count, 3);
    assert_eq!(record.retry_history.len(), 3);
    assert!(
        record
            .retry_history
            .windows(2)
            .all(|w| w[0].attempt + 1 == w[1].attempt),
        "attempts are sequential"
    );
    let original = record.parsed_event().expect("original event stored");
    assert_eq!(original.id, event_id);
    assert_eq!(original.data["runId"], "r-1");
}

#[tokio::test]
async fn terminal_handler_failure_skips_retries() {
    let (bus, _broker) = test_bus().await;
    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = invocations.clone();

    bus.subscribe(
        "jobs.poison",
        move |_event| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Terminal("unprocessable".into()))
            }
        },
        fast_options(),
    )
    .await
    .expect("subscribe");

    bus.publish("jobs.poison", json!({"runId": "r-2"}))
        .await
        .expect("publish");

    assert!(dead_letter_count_is(&bus, 1, Duration::from_secs(5)).await);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(bus.stats().retried, 0);
}

#[tokio::test]
async fn dead_letter_replay_issues_fresh_id_with_original_cause() {
    let (bus, _broker) = test_bus().await;

    let failing = bus
        .subscribe(
            "jobs.export",
            |_event| async { Err(HandlerError::Terminal("schema drift".into())) },
            fast_options(),
        )
        .await
        .expect("subscribe");

    let original_id = bus
        .publish("jobs.export", json!({"file": "report.csv"}))
        .await
        .expect("publish");

    assert!(dead_letter_count_is(&bus, 1, Duration::from_secs(5)).await);

    // Swap the failing handler for a capturing one before replaying.
    bus.unsubscribe_handler("jobs.export", failing)
        .await
        .expect("unsubscribe");
    let mut rx = capture(&bus, "jobs.export").await;

    let records = bus.dead_letter_records(0, 10).await.expect("records");
    let replayed_id = bus.replay_dead_letter(records[0].id).await.expect("replay");
    assert_ne!(replayed_id, original_id);

    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("replay delivered")
        .expect("event");
    assert_eq!(event.id, replayed_id);
    assert_eq!(event.event_type, "jobs.export");
    assert_eq!(event.data["file"], "report.csv");
    assert_eq!(event.metadata.causation_id, Some(original_id));

    assert_eq!(
        bus.dead_letter_queue_count().await.expect("count"),
        0,
        "record removed after replay"
    );
}

#[tokio::test]
async fn handler_concurrency_is_bounded_per_subscription() {
    let (bus, _broker) = test_bus().await;
    let in_flight = Arc::new(AtomicI64::new(0));
    let max_in_flight = Arc::new(AtomicI64::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let current = in_flight.clone();
    let peak = max_in_flight.clone();
    let finished = done.clone();
    bus.subscribe(
        "load.test",
        move |_event| {
            let current = current.clone();
            let peak = peak.clone();
            let finished = finished.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
        SubscribeOptions {
            concurrency: 2,
            ..fast_options()
        },
    )
    .await
    .expect("subscribe");

    for i in 0..10 {
        bus.publish("load.test", json!({"n": i})).await.expect("publish");
    }

    assert!(
        wait_until(
            || async { done.load(Ordering::SeqCst) == 10 },
            Duration::from_secs(5),
        )
        .await,
        "all handlers complete"
    );
    assert!(
        max_in_flight.load(Ordering::SeqCst) <= 2,
        "no more than 2 invocations in flight, saw {}",
        max_in_flight.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn delayed_publish_is_invisible_until_due() {
    let (bus, _broker) = test_bus().await;
    let mut rx = capture(&bus, "reminders.*").await;

    let event_id = bus
        .publish_with(
            "reminders.appointment",
            json!({"appointmentId": "ap-9"}),
            MetadataOverrides::default(),
            PublishOptions {
                delay: Some(Duration::from_millis(600)),
                priority: None,
            },
        )
        .await
        .expect("scheduled");

    assert_eq!(bus.delayed_events_count().await.expect("count"), 1);
    assert!(
        timeout(Duration::from_millis(400), rx.recv()).await.is_err(),
        "not visible before the delay elapses"
    );

    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivered within one scan interval after due")
        .expect("event");
    assert_eq!(event.id, event_id);

    assert!(
        wait_until(
            || async { bus.delayed_events_count().await.unwrap_or(1) == 0 },
            Duration::from_secs(2),
        )
        .await,
        "entry removed after delivery"
    );
}

#[tokio::test]
async fn same_pattern_subscribers_each_fire_once() {
    let (bus, _broker) = test_bus().await;
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    for counter in [first.clone(), second.clone()] {
        bus.subscribe(
            "billing.invoice_generated",
            move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            fast_options(),
        )
        .await
        .expect("subscribe");
    }

    bus.publish(
        "billing.invoice_generated",
        json!({"invoiceId": "inv-1", "patientId": "pt-1", "amount": 120.0}),
    )
    .await
    .expect("publish");

    assert!(
        wait_until(
            || async {
                first.load(Ordering::SeqCst) == 1 && second.load(Ordering::SeqCst) == 1
            },
            Duration::from_secs(2),
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn caller_metadata_wins_and_threads_through() {
    let (bus, _broker) = test_bus().await;
    let mut rx = capture(&bus, "user.registered").await;

    let correlation = uuid::Uuid::new_v4();
    bus.publish_with(
        "user.registered",
        json!({"userId": "u-1", "email": "u@clinic.test"}),
        MetadataOverrides {
            correlation_id: Some(correlation),
            user_id: Some("admin-1".into()),
            ..Default::default()
        },
        PublishOptions::default(),
    )
    .await
    .expect("publish");

    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivered")
        .expect("event");
    assert_eq!(event.metadata.correlation_id, correlation);
    assert_eq!(event.metadata.user_id.as_deref(), Some("admin-1"));

    let derived = events_bus::CorrelationContext::for_event(&event);
    assert_eq!(derived.correlation_id, correlation);
    assert_eq!(derived.causation_id, Some(event.id));
}

#[tokio::test]
async fn batch_publisher_flushes_on_threshold_and_destroy() {
    let (bus, _broker) = test_bus().await;
    let mut rx = capture(&bus, "bulk.*").await;

    let publisher = BatchPublisher::with_thresholds(bus.clone(), 3, Duration::from_secs(60));
    for i in 0..3 {
        publisher
            .add(
                "bulk.import",
                json!({"row": i}),
                MetadataOverrides::default(),
            )
            .await
            .expect("buffered");
    }

    for _ in 0..3 {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("threshold flush delivered")
            .expect("event");
    }
    assert_eq!(bus.stats().published, 3);

    publisher
        .add("bulk.import", json!({"row": 99}), MetadataOverrides::default())
        .await
        .expect("buffered");
    let flushed = publisher.destroy().await.expect("destroy flushes tail");
    assert_eq!(flushed, 1);
    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("tail delivered")
        .expect("event");
    assert_eq!(event.data["row"], 99);
}

#[tokio::test]
async fn malformed_message_never_reaches_handlers() {
    let (bus, broker) = test_bus().await;
    let received = Arc::new(AtomicUsize::new(0));
    let seen = received.clone();
    bus.subscribe(
        "patient.*",
        move |_event| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
        fast_options(),
    )
    .await
    .expect("subscribe");

    use events_bus::EventBroker;
    broker
        .publish("patient.created", "{this is not json")
        .await
        .expect("raw write");

    assert!(
        dead_letter_count_is(&bus, 1, Duration::from_secs(2)).await,
        "malformed message routed to dead-letter store"
    );
    assert_eq!(received.load(Ordering::SeqCst), 0);
    assert_eq!(bus.stats().failed, 1);
}

#[tokio::test]
async fn shutdown_rejects_new_publishes() {
    let (bus, broker) = test_bus().await;
    assert!(bus.health_check().await);

    bus.shutdown().await.expect("shutdown");
    assert!(!bus.health_check().await);

    let err = bus
        .publish("patient.created", json!({"patientId": "pt-1"}))
        .await
        .expect_err("rejected during shutdown");
    assert!(!err.retryable());

    use events_bus::EventBroker;
    assert!(!broker.health_check().await, "broker connections closed");
}
