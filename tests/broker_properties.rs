//! End-to-end checks of the broker's observable guarantees through the
//! public API only.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pubsub_broker::{
    Broker, BrokerConfig, BrokerError, DeadLetterReason, Delivery, Handler, HandlerError,
    SubscribeOptions, matches,
};
use tokio::time::{Instant, sleep};

fn config() -> BrokerConfig {
    BrokerConfig {
        retry_backoff_base: Duration::from_millis(5),
        ack_sweep_interval: Duration::from_millis(10),
        shutdown_grace_period: Duration::from_secs(2),
        ..BrokerConfig::default()
    }
}

fn counting(counter: Arc<AtomicUsize>) -> impl Handler {
    move |_delivery: Delivery| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), HandlerError>(())
        }
    }
}

/// Fails the first `failures` invocations, then succeeds.
fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> impl Handler {
    move |_delivery: Delivery| {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                Err::<(), HandlerError>(format!("failure {n}").into())
            } else {
                Ok(())
            }
        }
    }
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn publish(broker: &Broker, topic: &str, n: i64) -> String {
    broker
        .publish(topic, serde_json::json!({ "n": n }), HashMap::new())
        .expect("publish")
}

#[tokio::test]
async fn fan_out_reaches_every_matching_subscription_once() {
    let broker = Broker::new(config());
    let counters: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let patterns = ["orders.created", "orders.*", "*"];
    for (pattern, counter) in patterns.iter().zip(&counters) {
        broker
            .subscribe(pattern, counting(counter.clone()), SubscribeOptions::new())
            .unwrap();
    }

    publish(&broker, "orders.created", 1);

    assert!(wait_until(Duration::from_secs(2), || broker.metrics().delivered == 3).await);
    sleep(Duration::from_millis(50)).await;
    for counter in &counters {
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
    assert_eq!(broker.metrics().published, 1);
    broker.close().await.unwrap();
}

#[test]
fn pattern_matching_rules() {
    assert!(matches("orders.*", "orders.created"));
    assert!(matches("orders.*", "orders.updated"));
    assert!(!matches("orders.*", "orders"));
    assert!(!matches("orders.*", "events.created"));
    assert!(matches("*", "anything.at.all"));
    assert!(matches("*", "single"));
}

#[tokio::test]
async fn retry_exhaustion_lands_in_dead_letters() {
    let broker = Broker::new(config());
    let calls = Arc::new(AtomicUsize::new(0));
    let sub = broker
        .subscribe(
            "jobs.run",
            flaky(usize::MAX, calls.clone()),
            SubscribeOptions::new().max_retries(2),
        )
        .unwrap();

    let id = publish(&broker, "jobs.run", 1);

    assert!(wait_until(Duration::from_secs(2), || broker.metrics().dlq_size == 1).await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let dead = broker.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, DeadLetterReason::MaxRetriesExceeded);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].subscription_id, sub);
    assert_eq!(dead[0].message.id, id);

    let metrics = broker.metrics();
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.delivered, 0);
}

#[tokio::test]
async fn retry_then_success_is_delivered_once() {
    let broker = Broker::new(config());
    let calls = Arc::new(AtomicUsize::new(0));
    broker
        .subscribe(
            "jobs.run",
            flaky(2, calls.clone()),
            SubscribeOptions::new().max_retries(2),
        )
        .unwrap();

    publish(&broker, "jobs.run", 1);

    assert!(wait_until(Duration::from_secs(2), || broker.metrics().delivered == 1).await);
    let metrics = broker.metrics();
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.delivered, 1);
    assert_eq!(metrics.dlq_size, 0);
    assert!(broker.dead_letters().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_subscriber_does_not_block_publisher() {
    let broker = Broker::new(config());
    let fast = Arc::new(AtomicUsize::new(0));
    broker
        .subscribe(
            "telemetry",
            counting(fast.clone()),
            SubscribeOptions::new().buffer_size(1000),
        )
        .unwrap();
    broker
        .subscribe(
            "telemetry",
            |_delivery: Delivery| async move {
                sleep(Duration::from_millis(50)).await;
                Ok::<(), HandlerError>(())
            },
            SubscribeOptions::new().buffer_size(5),
        )
        .unwrap();

    let started = Instant::now();
    for n in 0..1000 {
        publish(&broker, "telemetry", n);
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    let metrics = broker.metrics();
    assert_eq!(metrics.published, 1000);
    assert!(metrics.circuit_trips > 0);
    assert!(
        broker
            .dead_letters()
            .iter()
            .any(|e| e.reason == DeadLetterReason::QueueFull)
    );

    assert!(wait_until(Duration::from_secs(5), || fast.load(Ordering::SeqCst) == 1000).await);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn unsubscribe_stops_delivery_to_removed_handler_only() {
    let broker = Broker::new(config());
    let removed = Arc::new(AtomicUsize::new(0));
    let kept = Arc::new(AtomicUsize::new(0));
    let sub = broker
        .subscribe("news", counting(removed.clone()), SubscribeOptions::new())
        .unwrap();
    broker
        .subscribe("news", counting(kept.clone()), SubscribeOptions::new())
        .unwrap();

    publish(&broker, "news", 1);
    assert!(wait_until(Duration::from_secs(2), || broker.metrics().delivered == 2).await);

    broker.unsubscribe(&sub).await.unwrap();
    assert_eq!(
        broker.unsubscribe(&sub).await,
        Err(BrokerError::UnknownSubscription(sub.clone()))
    );

    publish(&broker, "news", 2);
    assert!(wait_until(Duration::from_secs(2), || kept.load(Ordering::SeqCst) == 2).await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(removed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn ack_succeeds_once_then_reports_unknown() {
    let broker = Broker::new(config());
    let calls = Arc::new(AtomicUsize::new(0));
    let sub = broker
        .subscribe(
            "payments",
            counting(calls),
            SubscribeOptions::new().ack_timeout(Duration::from_secs(10)),
        )
        .unwrap();

    let id = publish(&broker, "payments", 1);
    assert!(wait_until(Duration::from_secs(2), || broker.metrics().delivered == 1).await);

    assert!(broker.ack(&sub, &id).is_ok());
    assert!(matches!(
        broker.ack(&sub, &id),
        Err(BrokerError::UnknownAck { .. })
    ));
    assert_eq!(broker.metrics().acked, 1);
}

#[tokio::test]
async fn close_waits_for_in_flight_handlers() {
    let broker = Broker::new(config());
    let finished = Arc::new(AtomicUsize::new(0));
    let f = finished.clone();
    broker
        .subscribe(
            "batch",
            move |_delivery: Delivery| {
                let f = f.clone();
                async move {
                    sleep(Duration::from_millis(150)).await;
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            },
            SubscribeOptions::new(),
        )
        .unwrap();

    publish(&broker, "batch", 1);
    sleep(Duration::from_millis(20)).await;

    broker.close().await.unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(broker.metrics().delivered, 1);
    assert_eq!(
        broker.publish("batch", serde_json::json!(2), HashMap::new()),
        Err(BrokerError::BrokerClosed)
    );
}

#[tokio::test]
async fn every_message_is_accounted_for() {
    let broker = Broker::new(config());
    let calls = Arc::new(AtomicUsize::new(0));
    broker
        .subscribe(
            "mixed",
            flaky(3, calls),
            SubscribeOptions::new().max_retries(0).buffer_size(4),
        )
        .unwrap();

    for n in 0..10 {
        publish(&broker, "mixed", n);
    }
    assert!(
        wait_until(Duration::from_secs(2), || {
            let m = broker.metrics();
            m.delivered + m.dlq_size == 10
        })
        .await
    );
    broker.close().await.unwrap();

    let m = broker.metrics();
    assert_eq!(m.delivered + m.dlq_size, 10);
    assert_eq!(m.failed, m.dlq_size);
    assert_eq!(broker.dead_letters().len() as u64, m.dlq_size);
}
