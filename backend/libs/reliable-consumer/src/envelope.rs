//! Records written to the retry and dead-letter topics.
//!
//! Both wrap the original record so it can be replayed onto its source topic.
//! Timestamps are unix seconds.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Embed raw record bytes in an envelope.
///
/// JSON payloads are kept as-is so the retry topic stays readable; anything
/// else (a poison record) is stored as a lossy UTF-8 string.
pub fn embed_payload(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Inverse of [`embed_payload`].
pub fn payload_bytes(value: &serde_json::Value) -> Vec<u8> {
    match value {
        serde_json::Value::String(s) => s.clone().into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryMessage {
    pub original_topic: String,
    pub original_key: String,
    pub payload: serde_json::Value,
    /// Failed attempts so far
    pub retry_count: u32,
    pub next_retry_at: i64,
}

impl RetryMessage {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.next_retry_at
    }

    pub fn next_retry_time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.next_retry_at, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub original_topic: String,
    pub original_key: String,
    pub payload: serde_json::Value,
    pub error_msg: String,
    pub retry_count: u32,
    pub created_at: i64,
    pub last_retry_at: i64,
}
