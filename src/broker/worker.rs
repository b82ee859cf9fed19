//! Delivery worker
//!
//! One task per subscription. The loop takes the next unit of work, giving
//! ack-timeout redeliveries priority over fresh messages, and drives it
//! through the breaker, the rate limiter, the handler and the retry/backoff
//! state machine until it is delivered or dead-lettered.
//!
//! Retries happen in place: a failing message keeps its head-of-line
//! position, so later messages for the same subscription wait behind it.
//!
//! Shutdown comes in two flavours:
//! - the queue sender is dropped (`unsubscribe`): the worker drains what is
//!   left in the queue and exits when it sees the end of the channel
//! - the shutdown token fires (`close`, or an unsubscribe past its grace
//!   period): the worker finishes the handler call in progress, then
//!   dead-letters whatever is still queued or waiting to retry
//!
//! Either way, deliveries of this subscription still waiting for an ack are
//! dead-lettered when the worker stops, since nothing can redeliver them.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::ack::{AckTracker, Redelivery, dead_letter_unacked};
use crate::broker::circuit::{CircuitBreaker, CircuitState};
use crate::broker::dead_letter::{DeadLetterEntry, DeadLetterReason, DeadLetterSink};
use crate::broker::message::Message;
use crate::broker::metrics::Metrics;
use crate::broker::options::SubscriptionPolicy;
use crate::broker::rate_limit::RateLimiter;
use crate::broker::subscription::{Delivery, Handler, SubscriptionId};

/// Why an attempt did not complete.
#[derive(Debug)]
enum AttemptFailure {
    Handler(String),
    AckTimeout,
}

impl AttemptFailure {
    fn exhausted_reason(&self) -> DeadLetterReason {
        match self {
            Self::Handler(_) => DeadLetterReason::MaxRetriesExceeded,
            Self::AckTimeout => DeadLetterReason::AckTimeout,
        }
    }

    fn error_text(&self) -> Option<String> {
        match self {
            Self::Handler(err) => Some(err.clone()),
            Self::AckTimeout => None,
        }
    }
}

enum Work {
    Fresh(Arc<Message>),
    Redeliver(Redelivery),
}

/// Collaborators shared by every worker of one broker.
#[derive(Debug, Clone)]
pub(crate) struct Shared {
    pub metrics: Arc<Metrics>,
    pub dead_letters: Arc<DeadLetterSink>,
    pub acks: Arc<AckTracker>,
}

impl Shared {
    /// Record a message that will not be delivered to `subscription_id`.
    pub fn dead_letter(
        &self,
        subscription_id: &str,
        message: Arc<Message>,
        reason: DeadLetterReason,
        attempts: u32,
        last_error: Option<String>,
    ) {
        warn!(
            %subscription_id,
            message_id = %message.id,
            %reason,
            attempts,
            "message dead-lettered"
        );
        self.dead_letters.insert(DeadLetterEntry {
            message,
            subscription_id: subscription_id.to_string(),
            reason,
            attempts,
            last_error,
            failed_at: Utc::now(),
        });
        self.metrics.record_dead_letter();
    }
}

/// Lock a breaker shared with the publish path.
pub(crate) fn lock_breaker(
    breaker: &Mutex<CircuitBreaker>,
) -> std::sync::MutexGuard<'_, CircuitBreaker> {
    breaker.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct DeliveryWorker {
    subscription_id: SubscriptionId,
    handler: Arc<dyn Handler>,
    policy: SubscriptionPolicy,
    queue: mpsc::Receiver<Arc<Message>>,
    redeliveries: mpsc::UnboundedReceiver<Redelivery>,
    redeliver_tx: mpsc::UnboundedSender<Redelivery>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    rate_limiter: RateLimiter,
    shared: Shared,
    shutdown: CancellationToken,
}

impl DeliveryWorker {
    pub fn new(
        subscription_id: SubscriptionId,
        handler: Arc<dyn Handler>,
        policy: SubscriptionPolicy,
        queue: mpsc::Receiver<Arc<Message>>,
        breaker: Arc<Mutex<CircuitBreaker>>,
        shared: Shared,
        shutdown: CancellationToken,
    ) -> Self {
        let (redeliver_tx, redeliveries) = mpsc::unbounded_channel();
        let rate_limiter = RateLimiter::new(policy.rate_limit_interval);
        Self {
            subscription_id,
            handler,
            policy,
            queue,
            redeliveries,
            redeliver_tx,
            breaker,
            rate_limiter,
            shared,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        debug!(subscription_id = %self.subscription_id, "delivery worker started");

        while let Some(work) = self.next_work().await {
            match work {
                Work::Fresh(message) => self.deliver(message).await,
                Work::Redeliver(Redelivery { message, attempt }) => {
                    self.handle_failure(message, attempt, AttemptFailure::AckTimeout)
                        .await;
                }
            }
        }

        self.drain_on_shutdown();
        debug!(subscription_id = %self.subscription_id, "delivery worker stopped");
    }

    /// Wait for the next unit of work. `None` means stop.
    async fn next_work(&mut self) -> Option<Work> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            Some(redelivery) = self.redeliveries.recv() => Some(Work::Redeliver(redelivery)),
            message = self.queue.recv() => message.map(Work::Fresh),
        }
    }

    async fn deliver(&mut self, message: Arc<Message>) {
        let admitted = {
            let mut breaker = lock_breaker(&self.breaker);
            let was_open = breaker.state() == CircuitState::Open;
            let admitted = breaker.try_acquire(Instant::now());
            if admitted && was_open {
                info!(subscription_id = %self.subscription_id, "circuit half-open, sending probe");
            }
            admitted
        };

        if !admitted {
            self.shared.dead_letter(
                &self.subscription_id,
                message,
                DeadLetterReason::CircuitOpen,
                0,
                None,
            );
            return;
        }

        self.attempt_from(message, 0).await;
    }

    /// Invoke the handler starting at `attempt`, retrying in place until
    /// success, exhaustion, or shutdown.
    async fn attempt_from(&mut self, message: Arc<Message>, mut attempt: u32) {
        loop {
            if self.shutdown.is_cancelled() {
                self.abandon(message, attempt);
                return;
            }

            let backoff = self.policy.backoff(attempt);
            if !backoff.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => {
                        self.abandon(message, attempt);
                        return;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            if self.rate_limiter.wait(&self.shutdown).await.is_err() {
                self.abandon(message, attempt);
                return;
            }

            let delivery = Delivery {
                message: message.clone(),
                subscription_id: self.subscription_id.clone(),
                attempt,
                shutdown: self.shutdown.clone(),
            };

            match self.handler.handle(delivery).await {
                Ok(()) => {
                    self.on_success(message, attempt);
                    return;
                }
                Err(err) => {
                    let failure = AttemptFailure::Handler(err.to_string());
                    match self.next_attempt(&message, attempt, failure) {
                        Some(next) => attempt = next,
                        None => return,
                    }
                }
            }
        }
    }

    fn on_success(&mut self, message: Arc<Message>, attempt: u32) {
        self.shared.metrics.record_delivered();

        {
            let mut breaker = lock_breaker(&self.breaker);
            if breaker.state() != CircuitState::Closed {
                info!(subscription_id = %self.subscription_id, "circuit closed");
            }
            breaker.record_success();
        }

        if let Some(timeout) = self.policy.ack_timeout {
            self.shared.acks.register(
                &self.subscription_id,
                message,
                attempt,
                timeout,
                self.redeliver_tx.clone(),
            );
        }
    }

    async fn handle_failure(&mut self, message: Arc<Message>, attempt: u32, failure: AttemptFailure) {
        if let Some(next) = self.next_attempt(&message, attempt, failure) {
            self.attempt_from(message, next).await;
        }
    }

    /// Account for a failed attempt. Returns the next attempt number, or
    /// `None` after dead-lettering an exhausted message.
    fn next_attempt(
        &mut self,
        message: &Arc<Message>,
        attempt: u32,
        failure: AttemptFailure,
    ) -> Option<u32> {
        if attempt < self.policy.max_retries {
            self.shared.metrics.record_retry();
            debug!(
                subscription_id = %self.subscription_id,
                message_id = %message.id,
                attempt,
                ?failure,
                "delivery failed, retrying"
            );
            return Some(attempt + 1);
        }

        self.shared.dead_letter(
            &self.subscription_id,
            message.clone(),
            failure.exhausted_reason(),
            attempt + 1,
            failure.error_text(),
        );

        let tripped = lock_breaker(&self.breaker).record_failure(Instant::now());
        if tripped {
            self.shared.metrics.record_circuit_trip();
            warn!(subscription_id = %self.subscription_id, "circuit opened");
        }
        None
    }

    /// Dead-letter a message interrupted by shutdown before `attempt` ran.
    fn abandon(&self, message: Arc<Message>, attempt: u32) {
        self.shared.dead_letter(
            &self.subscription_id,
            message,
            DeadLetterReason::Shutdown,
            attempt,
            None,
        );
    }

    /// Record everything still waiting once the loop has stopped.
    fn drain_on_shutdown(&mut self) {
        self.queue.close();
        while let Ok(message) = self.queue.try_recv() {
            self.abandon(message, 0);
        }

        // closed first so the sweeper cannot hand over anything after this
        self.redeliveries.close();
        let unacked = self.shared.acks.take_subscription(&self.subscription_id);
        dead_letter_unacked(&self.shared, unacked);
        while let Ok(Redelivery { message, attempt }) = self.redeliveries.try_recv() {
            self.abandon(message, attempt + 1);
        }
    }
}
