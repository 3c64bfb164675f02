//! COUNT request bookkeeping and aggregate result types.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::Serialize;
use serde_json::Value;

/// Raw reply to one COUNT request against one relay.
#[derive(Debug, Clone, Serialize)]
pub struct CountReply {
    /// Clamped non-negative count extracted from the reply payload.
    pub count: u64,
    /// The full wire frame, when the reply arrived as one. Native count
    /// calls produce no frame.
    pub frame: Option<Value>,
}

/// Options for a COUNT fanout.
#[derive(Debug, Clone, Default)]
pub struct CountOptions {
    /// Candidate relays; the pool's connection set when empty.
    pub relays: Vec<String>,
    /// Per-relay timeout override.
    pub timeout: Option<Duration>,
}

/// Why a relay was skipped without any I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    Backoff,
    Circuit,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backoff => "backoff",
            Self::Circuit => "circuit",
        }
    }
}

/// One relay's part in a COUNT fanout.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CountOutcome {
    /// The relay answered.
    Ok { count: u64, frame: Option<Value> },
    /// The relay lacks COUNT support (sticky for the process lifetime).
    Unsupported,
    /// Health state excluded the relay before any request was sent.
    Skipped { reason: SkipReason },
    /// The request timed out; no circuit-breaker penalty applies.
    TimedOut,
    /// A hard failure, recorded against the relay's health.
    Error { code: String },
}

impl CountOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Outcomes that degrade the aggregate to a partial result.
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::TimedOut | Self::Skipped { .. })
    }
}

/// One relay's outcome, in the caller's original relay order.
#[derive(Debug, Clone, Serialize)]
pub struct RelayCount {
    pub url: String,
    pub outcome: CountOutcome,
}

/// The single-relay answer the aggregate settled on.
#[derive(Debug, Clone, Serialize)]
pub struct BestCount {
    pub relay: String,
    pub count: u64,
    pub frame: Option<Value>,
}

/// Merged result of a COUNT fanout.
///
/// `total` always equals `best.count` when `best` is present, zero
/// otherwise; `partial` marks results missing input from at least one
/// relay that timed out or was skipped.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateCount {
    pub total: u64,
    pub best: Option<BestCount>,
    pub per_relay: Vec<RelayCount>,
    pub partial: bool,
}

/// Coerce a COUNT reply payload to a clamped non-negative integer.
///
/// Accepts a bare number, an object carrying a numeric (or numeric-string)
/// `count` field, or a numeric string; anything else yields zero.
pub fn extract_count_value(payload: &Value) -> u64 {
    fn clamp(value: f64) -> u64 {
        if value.is_finite() && value >= 0.0 {
            value.floor() as u64
        } else {
            0
        }
    }

    match payload {
        Value::Number(number) => number.as_f64().map_or(0, clamp),
        Value::String(text) => text.trim().parse::<f64>().map_or(0, clamp),
        Value::Object(object) => match object.get("count") {
            Some(Value::Number(number)) => number.as_f64().map_or(0, clamp),
            Some(Value::String(text)) => text.trim().parse::<f64>().map_or(0, clamp),
            _ => 0,
        },
        _ => 0,
    }
}

/// Collision-resistant request id: wrapping per-pool counter, millisecond
/// timestamp, and random entropy, all base36. The counter keeps ids unique
/// within one process; the timestamp and suffix keep them unique across
/// restarts sharing a relay connection.
pub(crate) fn generate_request_id(counter: &AtomicU64, prefix: &str) -> String {
    let prefix = prefix.trim();
    let prefix = if prefix.is_empty() { "count" } else { prefix };

    let sequence = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis();

    let mut rng = rand::rng();
    let suffix: String = (0..6).map(|_| base36_digit(rng.random_range(0..36))).collect();

    format!(
        "{prefix}:{}:{}{suffix}",
        to_base36(timestamp_ms),
        to_base36(u128::from(sequence))
    )
}

fn base36_digit(value: u32) -> char {
    char::from_digit(value, 36).unwrap_or('0')
}

fn to_base36(mut value: u128) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(base36_digit((value % 36) as u32));
        value /= 36;
    }
    digits.iter().rev().collect()
}
