//! Configuration for relay connections, health tracking, and reconnects.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Relay endpoints used when the operator has not chosen any.
pub const DEFAULT_RELAY_URLS: [&str; 5] = [
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.snort.social",
    "wss://relay.primal.net",
    "wss://relay.nostr.band",
];

/// Owned copy of [`DEFAULT_RELAY_URLS`].
pub fn default_relays() -> Vec<String> {
    DEFAULT_RELAY_URLS.iter().map(ToString::to_string).collect()
}

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Timeout for establishing the WebSocket connection, also used as the
    /// wait deadline for connect probes.
    pub connect_timeout: Duration,
    /// Default timeout for a COUNT request against one relay.
    pub count_timeout: Duration,
    /// Capacity of the connection's broadcast channel for inbound relay
    /// messages. The pool raises this when many subscriptions share one
    /// connection.
    pub event_channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            count_timeout: Duration::from_millis(3400),
            event_channel_capacity: 64,
        }
    }
}

/// Failure bookkeeping thresholds.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// First-failure backoff delay.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Consecutive failures that open the circuit breaker.
    pub circuit_breaker_threshold: u32,
    /// How long an open breaker excludes a relay from fanouts.
    pub circuit_breaker_cooldown: Duration,
    /// Width of the rolling failure window.
    pub failure_window: Duration,
    /// Windowed failures that open the circuit breaker.
    pub failure_window_threshold: usize,
    /// Minimum spacing between summary log lines sharing one key.
    pub summary_log_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(8),
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(600),
            failure_window: Duration::from_secs(300),
            failure_window_threshold: 3,
            summary_log_interval: Duration::from_secs(30),
        }
    }
}

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of relays in the pool.
    pub max_relays: usize,
    /// Relay configuration template.
    pub relay_config: RelayConfig,
    /// Health tracking thresholds shared by every relay.
    pub health: HealthConfig,
    /// First reconnect attempt delay.
    pub reconnect_base_delay: Duration,
    /// Reconnect delay ceiling.
    pub reconnect_max_delay: Duration,
    /// Reconnect attempts before the loop gives up.
    pub reconnect_max_attempts: u32,
    /// Upgrade `ws://` preferences to `wss://` and drop any that cannot be.
    pub enforce_tls: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_relays: 16,
            relay_config: RelayConfig::default(),
            health: HealthConfig::default(),
            reconnect_base_delay: Duration::from_secs(2),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_max_attempts: 5,
            enforce_tls: false,
        }
    }
}

/// Operator-chosen relay lists.
///
/// `all` is the connection set; `read`/`write` scope queries and publishes.
/// Empty lists fall back: `all` to the built-in defaults, `read`/`write` to
/// the effective `all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayPreferences {
    #[serde(default)]
    pub all: Vec<String>,
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
}

impl Default for RelayPreferences {
    fn default() -> Self {
        Self {
            all: default_relays(),
            read: Vec::new(),
            write: Vec::new(),
        }
    }
}

/// Clean and normalize a list of relay URLs.
///
/// Drops duplicates, trailing slashes, non-websocket schemes, and entries
/// with interior whitespace; optionally upgrades `ws://` to `wss://`.
pub fn sanitize_relay_list<S: AsRef<str>>(list: &[S], enforce_tls: bool) -> Vec<String> {
    let mut sanitized: Vec<String> = Vec::new();

    for value in list {
        let Some(normalized) = normalize_relay_url(value.as_ref(), enforce_tls) else {
            continue;
        };
        if !sanitized.iter().any(|seen| seen == &normalized) {
            sanitized.push(normalized);
        }
    }

    sanitized
}

/// Normalize a single relay URL, or `None` when it is unusable.
pub fn normalize_relay_url(candidate: &str, enforce_tls: bool) -> Option<String> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return None;
    }

    let lowered = trimmed.to_ascii_lowercase();
    if !lowered.starts_with("ws://") && !lowered.starts_with("wss://") {
        return None;
    }

    let stripped = trimmed.trim_end_matches('/');
    let normalized = match Url::parse(stripped) {
        Ok(parsed) => {
            let host = parsed.host_str()?;
            let scheme = resolve_relay_scheme(parsed.scheme(), enforce_tls)?;
            let mut rebuilt = format!("{scheme}://{host}");
            if let Some(port) = parsed.port() {
                rebuilt.push(':');
                rebuilt.push_str(&port.to_string());
            }
            rebuilt.push_str(parsed.path().trim_end_matches('/'));
            if let Some(query) = parsed.query() {
                rebuilt.push('?');
                rebuilt.push_str(query);
            }
            rebuilt
        }
        Err(_) => stripped.to_string(),
    };

    if enforce_tls && normalized.starts_with("ws://") {
        return None;
    }

    Some(normalized)
}

fn resolve_relay_scheme(scheme: &str, enforce_tls: bool) -> Option<&'static str> {
    match scheme {
        "wss" => Some("wss"),
        "ws" if enforce_tls => Some("wss"),
        "ws" => Some("ws"),
        _ => None,
    }
}
