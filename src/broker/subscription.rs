//! Subscriptions and the handler capability they deliver to.
//!
//! A subscription pairs a pattern with a `Handler`. The broker keeps one
//! `SubscriptionEntry` per subscription in its registry: the sending half
//! of the bounded delivery queue, the shared circuit breaker, and the
//! worker's task handle. The worker itself owns the receiving half and
//! never refers back to the broker.

use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::circuit::CircuitBreaker;
use crate::broker::message::Message;
use crate::broker::topic::Pattern;

pub type SubscriptionId = String;

/// Error type returned by handlers. Any error type converts into it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) fn new_subscription_id() -> SubscriptionId {
    format!("sub-{}", Uuid::new_v4())
}

/// One handler invocation.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Arc<Message>,
    pub subscription_id: SubscriptionId,
    /// 0 for the initial try, n for the n-th retry.
    pub attempt: u32,
    /// Fires when the subscription or broker is shutting down. Handlers are
    /// never interrupted; watching this is how they cooperate.
    pub shutdown: CancellationToken,
}

/// Consumer of delivered messages.
///
/// Delivery is at-least-once, so implementations must tolerate seeing the
/// same message more than once.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        (self)(delivery).await
    }
}

/// Registry record for a live subscription.
#[derive(Debug)]
pub(crate) struct SubscriptionEntry {
    pub pattern: Pattern,
    pub queue: mpsc::Sender<Arc<Message>>,
    pub breaker: Arc<Mutex<CircuitBreaker>>,
    pub shutdown: CancellationToken,
    pub worker: JoinHandle<()>,
}
