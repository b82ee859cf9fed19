//! In-flight acknowledgement tracking.
//!
//! When a subscription has an ack timeout, a successful handler return only
//! means "delivered, pending ack". The worker registers a deadline here and
//! the consumer later confirms with `Broker::ack`. A single sweeper task,
//! shared by all subscriptions, hands expired records back to the owning
//! worker's redelivery channel so they re-enter the retry path.
//!
//! A pending record never just disappears: it is acked, redelivered, or
//! handed back as `Unacked` so the caller can dead-letter it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::message::{Message, MessageId};
use crate::broker::dead_letter::DeadLetterReason;
use crate::broker::subscription::SubscriptionId;
use crate::broker::worker::Shared;

/// A delivery whose ack deadline passed; the worker treats it as a failed
/// attempt number `attempt`.
#[derive(Debug, Clone)]
pub(crate) struct Redelivery {
    pub message: Arc<Message>,
    pub attempt: u32,
}

/// A delivery pulled out of the tracker without ever being acked.
#[derive(Debug, Clone)]
pub struct Unacked {
    pub subscription_id: SubscriptionId,
    pub message: Arc<Message>,
    /// Attempt number of the handler call that delivered it.
    pub attempt: u32,
}

#[derive(Debug)]
struct AckRecord {
    deadline: Instant,
    message: Arc<Message>,
    attempt: u32,
    redeliver: mpsc::UnboundedSender<Redelivery>,
}

type AckKey = (SubscriptionId, MessageId);

#[derive(Debug, Default)]
pub struct AckTracker {
    records: Mutex<HashMap<AckKey, AckRecord>>,
}

impl AckTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<AckKey, AckRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(
        &self,
        subscription_id: &str,
        message: Arc<Message>,
        attempt: u32,
        timeout: Duration,
        redeliver: mpsc::UnboundedSender<Redelivery>,
    ) {
        let key = (subscription_id.to_string(), message.id.clone());
        let record = AckRecord {
            deadline: Instant::now() + timeout,
            message,
            attempt,
            redeliver,
        };
        self.records().insert(key, record);
    }

    /// Remove the record for this pair. Returns false if none was pending.
    pub fn ack(&self, subscription_id: &str, message_id: &str) -> bool {
        self.records()
            .remove(&(subscription_id.to_string(), message_id.to_string()))
            .is_some()
    }

    /// Number of deliveries waiting for an ack.
    pub fn pending(&self) -> usize {
        self.records().len()
    }

    /// Remove and return every pending record of `subscription_id`.
    pub fn take_subscription(&self, subscription_id: &str) -> Vec<Unacked> {
        let mut records = self.records();
        let keys: Vec<AckKey> = records
            .keys()
            .filter(|(sub, _)| sub == subscription_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| records.remove(&key).map(|record| unacked(key, record)))
            .collect()
    }

    /// Remove and return every pending record.
    pub fn take_all(&self) -> Vec<Unacked> {
        self.records()
            .drain()
            .map(|(key, record)| unacked(key, record))
            .collect()
    }

    /// Remove every record whose deadline is at or before `now` and hand it
    /// back to its worker. Records whose worker has already stopped are
    /// returned instead.
    pub fn sweep(&self, now: Instant) -> Vec<Unacked> {
        let expired: Vec<(AckKey, AckRecord)> = {
            let mut records = self.records();
            let keys: Vec<AckKey> = records
                .iter()
                .filter(|(_, record)| record.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| records.remove(&key).map(|record| (key, record)))
                .collect()
        };

        let mut orphaned = Vec::new();
        for ((subscription_id, message_id), record) in expired {
            warn!(%subscription_id, %message_id, attempt = record.attempt, "ack deadline expired");
            let redelivery = Redelivery {
                message: record.message,
                attempt: record.attempt,
            };
            if let Err(mpsc::error::SendError(redelivery)) = record.redeliver.send(redelivery) {
                debug!(%subscription_id, %message_id, "worker gone, expired ack not redelivered");
                orphaned.push(Unacked {
                    subscription_id,
                    message: redelivery.message,
                    attempt: redelivery.attempt,
                });
            }
        }
        orphaned
    }
}

fn unacked((subscription_id, _): AckKey, record: AckRecord) -> Unacked {
    Unacked {
        subscription_id,
        message: record.message,
        attempt: record.attempt,
    }
}

/// Dead-letter deliveries that were never acked, with reason `shutdown`.
pub(crate) fn dead_letter_unacked(shared: &Shared, unacked: Vec<Unacked>) {
    for Unacked {
        subscription_id,
        message,
        attempt,
    } in unacked
    {
        shared.dead_letter(
            &subscription_id,
            message,
            DeadLetterReason::Shutdown,
            attempt + 1,
            None,
        );
    }
}

/// Periodically sweep the broker's ack tracker until `shutdown` fires.
pub(crate) async fn run_sweeper(shared: Shared, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let orphaned = shared.acks.sweep(Instant::now());
                dead_letter_unacked(&shared, orphaned);
            }
        }
    }
    debug!("ack sweeper stopped");
}
