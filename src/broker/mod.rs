//! The broker: topic routing, per-subscription delivery and the failure
//! handling around it (retries, circuit breaking, rate limiting, ack
//! tracking, dead letters).

pub mod ack;
pub mod circuit;
pub mod dead_letter;
pub mod engine;
pub mod message;
pub mod metrics;
pub mod options;
pub mod rate_limit;
pub mod subscription;
pub mod topic;
mod worker;

pub use engine::Broker;
