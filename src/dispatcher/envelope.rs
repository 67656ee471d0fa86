//! Sidekiq-compatible job envelope.

use chrono::Utc;
use rand::RngExt;
use serde::{Deserialize, Serialize};

/// Serialized unit of work for the worker runtime.
///
/// Immediate jobs carry `enqueued_at`; scheduled jobs carry `at` instead and
/// receive `enqueued_at` from the scheduler that promotes them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEnvelope {
    /// Worker class name.
    pub class: String,
    /// Job id, 24 lowercase hex characters.
    pub jid: String,
    /// Destination queue name.
    pub queue: String,
    /// Worker arguments; always a single payload object.
    pub args: Vec<serde_json::Value>,
    /// Creation time in epoch seconds.
    pub created_at: f64,
    /// Enqueue time in epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<f64>,
    /// Scheduled run time in epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<f64>,
}

impl JobEnvelope {
    /// Builds an envelope for immediate execution.
    pub fn immediate(class: &str, queue: &str, payload: serde_json::Value) -> Self {
        let now = epoch_seconds();
        Self {
            class: class.to_string(),
            jid: new_jid(),
            queue: queue.to_string(),
            args: vec![payload],
            created_at: now,
            enqueued_at: Some(now),
            at: None,
        }
    }

    /// Builds an envelope to run at `at` (epoch seconds).
    pub fn scheduled(class: &str, queue: &str, payload: serde_json::Value, at: f64) -> Self {
        Self {
            class: class.to_string(),
            jid: new_jid(),
            queue: queue.to_string(),
            args: vec![payload],
            created_at: epoch_seconds(),
            enqueued_at: None,
            at: Some(at),
        }
    }

    /// The payload passed to the worker.
    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.args.first()
    }
}

/// Current time as fractional epoch seconds.
pub fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Generates a job id: 12 random bytes, hex encoded.
pub fn new_jid() -> String {
    let bytes: [u8; 12] = rand::rng().random();
    hex::encode(bytes)
}

/// Normalizes a queue name to snake_case.
///
/// `ValidatorUpdates` → `validator_updates`, `high-priority` →
/// `high_priority`. Blank names map to `default`.
pub fn snake_case_queue(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower_or_digit = false;

    for ch in name.trim().chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower_or_digit {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower_or_digit = false;
        } else if ch == '-' || ch == ' ' || ch == '_' || ch == ':' {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower_or_digit = false;
        } else {
            out.push(ch);
            prev_lower_or_digit = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}
