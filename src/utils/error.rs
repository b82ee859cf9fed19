//! Errors surfaced synchronously by broker operations.
//!
//! Only caller mistakes (bad pattern, unknown ids) and lifecycle violations
//! (operating on a closed broker) are reported here. Handler failures never
//! reach the publisher; they are recorded in the dead-letter sink and the
//! metrics instead.

use thiserror::Error;

use crate::broker::message::MessageId;
use crate::broker::subscription::SubscriptionId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The subscription pattern was empty or contained an empty segment.
    #[error("invalid subscription pattern: {0:?}")]
    InvalidPattern(String),

    /// `close` has already begun.
    #[error("broker is closed")]
    BrokerClosed,

    #[error("unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    /// No in-flight record exists: already acked, expired, or never delivered.
    #[error("no pending ack for message {message_id} on subscription {subscription_id}")]
    UnknownAck {
        subscription_id: SubscriptionId,
        message_id: MessageId,
    },

    /// A blocking wait was interrupted by shutdown.
    #[error("operation cancelled by shutdown")]
    Cancelled,
}
