//! Relay connection and health management for Nostr clients.
//!
//! This crate intentionally exposes a small surface:
//! - shared relay connections over WebSocket with lazy, memoized setup
//! - per-relay health tracking: backoff, failure windows, circuit breakers
//! - a bounded background reconnect loop
//! - correlated, time-bounded COUNT requests aggregated across relays

pub mod config;
pub mod count;
pub mod error;
pub mod health;
pub mod pool;
pub mod relay;
pub mod subscription;
pub mod transport;

pub use config::{
    DEFAULT_RELAY_URLS, HealthConfig, PoolConfig, RelayConfig, RelayPreferences, default_relays,
    normalize_relay_url, sanitize_relay_list,
};
pub use count::{
    AggregateCount, BestCount, CountOptions, CountOutcome, CountReply, RelayCount, SkipReason,
    extract_count_value,
};
pub use error::{ClientError, Result};
pub use health::{
    BackoffEntry, CircuitBreakerState, CircuitTrigger, RelayHealthRegistry, SummaryLog,
};
pub use pool::{ProbeResult, RelayPool};
pub use relay::{ConnectionState, RelayConnection, RelayMessage, parse_relay_message};
pub use subscription::{EventCallback, Subscription};
pub use transport::{
    BoxSink, BoxStream, CountTransport, DefaultWebSocketTransport, TransportHandle,
    WebSocketTransport,
};
