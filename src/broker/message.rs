//! Message definitions for the broker
//!
//! A `Message` is immutable once published. The broker wraps each one in an
//! `Arc` and hands the same allocation to every matching subscription queue,
//! so fan-out never copies the payload.
//!
//! Notes on fields:
//! - `id`: UUIDv7 string, time-ordered so ids sort by publish order
//! - `topic`: dot-segmented routing key
//! - `payload`: opaque JSON value; the broker never inspects it
//! - `metadata`: free-form string headers
//! - `created_at`: set by the broker at publish time

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type MessageId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        payload: serde_json::Value,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            topic: topic.into(),
            payload,
            metadata,
            created_at: Utc::now(),
        }
    }
}
