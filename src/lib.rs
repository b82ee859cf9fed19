//! # pubsub-broker
//!
//! An in-process publish/subscribe broker built on tokio. Publishers hand
//! messages to the broker without ever waiting on consumers; every
//! subscription gets its own bounded queue and delivery task, and failures
//! stay inside the subscription that produced them.
//!
//! ## Core Modules
//!
//! - `broker`: topic matching, subscriptions, delivery workers, retries,
//!   circuit breakers, rate limiting, ack tracking and the dead-letter sink.
//! - `config`: loads broker and logging settings from files and the
//!   environment.
//! - `utils`: the error taxonomy and logging initialisation.
//!
//! ## Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use pubsub_broker::{Broker, BrokerConfig, Delivery, HandlerError, SubscribeOptions};
//!
//! # async fn run() -> Result<(), pubsub_broker::BrokerError> {
//! let broker = Broker::new(BrokerConfig::default());
//! broker.subscribe(
//!     "orders.*",
//!     |delivery: Delivery| async move {
//!         println!("got {}", delivery.message.payload);
//!         Ok::<(), HandlerError>(())
//!     },
//!     SubscribeOptions::new(),
//! )?;
//! broker.publish("orders.created", serde_json::json!({"id": 7}), HashMap::new())?;
//! broker.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod utils;

pub use broker::Broker;
pub use broker::circuit::CircuitState;
pub use broker::dead_letter::{DeadLetterEntry, DeadLetterReason};
pub use broker::message::{Message, MessageId};
pub use broker::metrics::MetricsSnapshot;
pub use broker::options::{BrokerConfig, SubscribeOptions};
pub use broker::subscription::{Delivery, Handler, HandlerError, SubscriptionId};
pub use broker::topic::matches;
pub use utils::BrokerError;
