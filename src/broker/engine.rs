//! Broker engine
//!
//! The `Broker` owns the subscription registry and composes the per
//! subscription machinery (queue, worker, breaker, rate limiter) with the
//! broker-wide collaborators (metrics, dead-letter sink, ack tracker and its
//! sweeper).
//!
//! Concurrency and usage notes:
//! - `Broker::new` spawns the ack sweeper and `subscribe` spawns a worker, so
//!   both must be called from inside a tokio runtime.
//! - The registry sits behind a single `RwLock`. `subscribe`, `unsubscribe`
//!   and `close` take it exclusively for as long as an insert or remove
//!   takes; `publish` takes it shared and only performs non-blocking queue
//!   offers while holding it. No await ever happens under the lock.
//! - Counters are atomics updated outside the registry lock.
//! - `publish` never waits on a subscriber. A full queue is a failure signal
//!   for that subscription's breaker and a `queue-full` dead letter, never an
//!   error for the publisher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::join_all;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::ack::{AckTracker, dead_letter_unacked, run_sweeper};
use crate::broker::circuit::CircuitBreaker;
use crate::broker::dead_letter::{DeadLetterEntry, DeadLetterReason, DeadLetterSink};
use crate::broker::message::{Message, MessageId};
use crate::broker::metrics::{Metrics, MetricsSnapshot};
use crate::broker::options::{BrokerConfig, SubscribeOptions};
use crate::broker::subscription::{Handler, SubscriptionEntry, SubscriptionId, new_subscription_id};
use crate::broker::topic::Pattern;
use crate::broker::worker::{DeliveryWorker, Shared, lock_breaker};
use crate::utils::BrokerError;

#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    subscriptions: RwLock<HashMap<SubscriptionId, SubscriptionEntry>>,
    shared: Shared,
    closed: AtomicBool,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Create a broker and start its ack sweeper.
    pub fn new(config: BrokerConfig) -> Self {
        let shared = Shared {
            metrics: Arc::new(Metrics::new()),
            dead_letters: Arc::new(DeadLetterSink::new()),
            acks: Arc::new(AckTracker::new()),
        };
        let shutdown = CancellationToken::new();
        let sweeper = tokio::spawn(run_sweeper(
            shared.clone(),
            config.ack_sweep_interval,
            shutdown.child_token(),
        ));

        Self {
            config,
            subscriptions: RwLock::new(HashMap::new()),
            shared,
            closed: AtomicBool::new(false),
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Broker-wide defaults this broker was created with.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> RwLockReadGuard<'_, HashMap<SubscriptionId, SubscriptionEntry>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, HashMap<SubscriptionId, SubscriptionEntry>> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for every topic matching `pattern` and start its
    /// delivery worker.
    pub fn subscribe<H>(
        &self,
        pattern: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, BrokerError>
    where
        H: Handler,
    {
        let pattern = Pattern::parse(pattern)?;
        let policy = options.resolve(&self.config);
        let id = new_subscription_id();

        let (queue_tx, queue_rx) = mpsc::channel(policy.buffer_size);
        let breaker = Arc::new(Mutex::new(CircuitBreaker::new(
            policy.failure_threshold,
            policy.cooldown,
        )));
        let shutdown = self.shutdown.child_token();

        let mut registry = self.registry_mut();
        // checked under the lock so close cannot miss this entry
        if self.is_closed() {
            return Err(BrokerError::BrokerClosed);
        }

        let worker = DeliveryWorker::new(
            id.clone(),
            Arc::new(handler),
            policy,
            queue_rx,
            breaker.clone(),
            self.shared.clone(),
            shutdown.clone(),
        );
        let worker = tokio::spawn(worker.run());

        info!(subscription_id = %id, %pattern, "subscribed");
        registry.insert(
            id.clone(),
            SubscriptionEntry {
                pattern,
                queue: queue_tx,
                breaker,
                shutdown,
                worker,
            },
        );
        Ok(id)
    }

    /// Stop delivering to `subscription_id`.
    ///
    /// No new messages reach the subscription once this is called. The
    /// worker first gets the grace period to drain its queue; after that it
    /// is cancelled and anything left is dead-lettered with reason
    /// `shutdown`. A handler still running past the grace period is left to
    /// finish on its own.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::BrokerClosed);
        }

        let entry = self
            .registry_mut()
            .remove(subscription_id)
            .ok_or_else(|| BrokerError::UnknownSubscription(subscription_id.to_string()))?;

        let SubscriptionEntry {
            queue,
            shutdown,
            mut worker,
            ..
        } = entry;
        // closing the queue lets the worker drain and exit; on exit it
        // dead-letters its own unacked deliveries
        drop(queue);

        let grace = self.config.shutdown_grace_period;
        if tokio::time::timeout(grace, &mut worker).await.is_err() {
            warn!(%subscription_id, ?grace, "worker did not drain in time, cancelling");
            shutdown.cancel();
            if tokio::time::timeout(grace, worker).await.is_err() {
                warn!(%subscription_id, "handler still running after cancellation, detaching");
            }
        }

        info!(%subscription_id, "unsubscribed");
        Ok(())
    }

    /// Publish a message to every matching subscription.
    ///
    /// Returns the new message id. Never blocks on subscribers.
    pub fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        metadata: HashMap<String, String>,
    ) -> Result<MessageId, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::BrokerClosed);
        }

        self.shared.metrics.record_published();
        let message = Arc::new(Message::new(topic, payload, metadata));
        let id = message.id.clone();

        let registry = self.registry();
        let mut matched = 0usize;
        for (subscription_id, entry) in registry.iter() {
            if !entry.pattern.matches(topic) {
                continue;
            }
            matched += 1;
            match entry.queue.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    self.reject_full(subscription_id, entry, message);
                }
                Err(TrySendError::Closed(message)) => {
                    self.shared.dead_letter(
                        subscription_id,
                        message,
                        DeadLetterReason::Shutdown,
                        0,
                        None,
                    );
                }
            }
        }
        drop(registry);

        debug!(message_id = %id, %topic, matched, "published");
        Ok(id)
    }

    fn reject_full(&self, subscription_id: &str, entry: &SubscriptionEntry, message: Arc<Message>) {
        let tripped = lock_breaker(&entry.breaker).record_failure(Instant::now());
        if tripped {
            self.shared.metrics.record_circuit_trip();
            warn!(%subscription_id, "circuit opened by full queue");
        }
        self.shared.dead_letter(
            subscription_id,
            message,
            DeadLetterReason::QueueFull,
            0,
            None,
        );
    }

    /// Confirm that `message_id` was fully processed by `subscription_id`.
    pub fn ack(&self, subscription_id: &str, message_id: &str) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::BrokerClosed);
        }
        if !self.shared.acks.ack(subscription_id, message_id) {
            return Err(BrokerError::UnknownAck {
                subscription_id: subscription_id.to_string(),
                message_id: message_id.to_string(),
            });
        }
        self.shared.metrics.record_acked();
        debug!(%subscription_id, %message_id, "acked");
        Ok(())
    }

    /// Current value of every broker counter.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Copy of every dead-letter entry, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.shared.dead_letters.all()
    }

    /// Shut the broker down.
    ///
    /// New publishes, subscribes and acks are rejected from the moment this
    /// is called. Workers are cancelled: handler calls already running are
    /// awaited for up to the grace period, and messages still queued,
    /// waiting to retry or waiting for an ack are dead-lettered with reason
    /// `shutdown`. Workers
    /// that outlive the grace period are logged and detached.
    pub async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::BrokerClosed);
        }
        info!("broker closing");

        let entries: Vec<(SubscriptionId, SubscriptionEntry)> =
            self.registry_mut().drain().collect();
        self.shutdown.cancel();

        let grace = self.config.shutdown_grace_period;
        let ids: Vec<SubscriptionId> = entries.iter().map(|(id, _)| id.clone()).collect();
        let workers = entries.into_iter().map(|(_, entry)| entry.worker);
        let waits = workers.map(|worker| tokio::time::timeout(grace, worker));
        let results = join_all(waits).await;

        for (subscription_id, result) in ids.iter().zip(results) {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%subscription_id, %err, "delivery worker panicked"),
                Err(_) => warn!(%subscription_id, ?grace, "handler still running at shutdown"),
            }
        }

        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        // left behind only by workers that panicked or are still running
        dead_letter_unacked(&self.shared, self.shared.acks.take_all());

        info!(metrics = ?self.metrics(), "broker closed");
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
