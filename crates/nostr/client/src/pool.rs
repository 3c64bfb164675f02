//! Relay pool: shared connections, health-aware fanout, and COUNT
//! aggregation across many relays.
//!
//! One pool owns one connection per relay URL, the health registry that
//! gates every fanout, the sticky set of COUNT-unsupported relays, and the
//! background reconnect loop. Fanout operations (`connect_to_relays`,
//! `count_events_across_relays`) never fail as a whole: each relay's
//! failure is captured and folded into the per-relay results. Direct
//! single-relay operations (`ensure_relay`, `send_raw_count_frame`) reject
//! with typed errors instead, because there is nothing to degrade to.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use nostr::normalize_count_filters;
use serde_json::{Value, json};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::config::{PoolConfig, RelayPreferences, default_relays, sanitize_relay_list};
use crate::count::{
    AggregateCount, BestCount, CountOptions, CountOutcome, CountReply, RelayCount, SkipReason,
    generate_request_id,
};
use crate::error::{ClientError, Result};
use crate::health::RelayHealthRegistry;
use crate::relay::{ConnectionState, RelayConnection};
use crate::subscription::Subscription;
use crate::transport::{DefaultWebSocketTransport, WebSocketTransport};

/// Event-channel ceiling for pooled connections. Many subscriptions share
/// one connection, so the pool raises the per-connection default.
const POOL_EVENT_CHANNEL_CAPACITY: usize = 200;

/// Result of one relay's connect probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub url: String,
    pub success: bool,
}

enum ProbeStatus {
    /// The probe subscription produced an event or EOSE in time.
    Connected,
    /// The connection could not be established; already recorded against
    /// the relay's health.
    ConnectError,
    /// The probe subscription produced nothing before the deadline.
    TimedOut,
}

struct RelayDirectory {
    all: Vec<String>,
    read: Vec<String>,
    write: Vec<String>,
}

struct ReconnectState {
    attempt: u32,
    timer: Option<tokio::task::JoinHandle<()>>,
}

struct PoolInner {
    config: PoolConfig,
    transport: Arc<dyn WebSocketTransport>,
    directory: StdMutex<RelayDirectory>,
    connections: Mutex<HashMap<String, Arc<OnceCell<Arc<RelayConnection>>>>>,
    health: RelayHealthRegistry,
    count_unsupported: StdMutex<HashSet<String>>,
    count_request_counter: AtomicU64,
    reconnect: StdMutex<ReconnectState>,
}

/// Multi-relay pool.
///
/// Cheap to clone; clones share the connection table, health registry, and
/// reconnect state.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    /// Create a pool over the default websocket transport.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_transport(config, Arc::new(DefaultWebSocketTransport))
    }

    /// Create a pool over a caller-provided transport backend.
    pub fn with_transport(config: PoolConfig, transport: Arc<dyn WebSocketTransport>) -> Self {
        let relays = sanitize_relay_list(&default_relays(), config.enforce_tls);
        let health = RelayHealthRegistry::new(config.health.clone());
        Self {
            inner: Arc::new(PoolInner {
                transport,
                directory: StdMutex::new(RelayDirectory {
                    all: relays.clone(),
                    read: relays.clone(),
                    write: relays,
                }),
                connections: Mutex::new(HashMap::new()),
                health,
                count_unsupported: StdMutex::new(HashSet::new()),
                count_request_counter: AtomicU64::new(0),
                reconnect: StdMutex::new(ReconnectState {
                    attempt: 0,
                    timer: None,
                }),
                config,
            }),
        }
    }

    fn directory(&self) -> MutexGuard<'_, RelayDirectory> {
        self.inner
            .directory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn unsupported(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner
            .count_unsupported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn reconnect_state(&self) -> MutexGuard<'_, ReconnectState> {
        self.inner
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The connection set.
    pub fn relays(&self) -> Vec<String> {
        self.directory().all.clone()
    }

    /// Relays used for queries.
    pub fn read_relays(&self) -> Vec<String> {
        self.directory().read.clone()
    }

    /// Relays used for publishes.
    pub fn write_relays(&self) -> Vec<String> {
        self.directory().write.clone()
    }

    /// Health bookkeeping for this pool's relays.
    pub fn health(&self) -> &RelayHealthRegistry {
        &self.inner.health
    }

    /// Apply operator-chosen relay lists.
    ///
    /// Each list is sanitized; an empty `all` falls back to the built-in
    /// defaults, empty `read`/`write` fall back to the effective `all`.
    pub fn apply_relay_preferences(&self, preferences: &RelayPreferences) {
        let enforce_tls = self.inner.config.enforce_tls;

        let sanitized_all = sanitize_relay_list(&preferences.all, enforce_tls);
        let effective_all = if sanitized_all.is_empty() {
            sanitize_relay_list(&default_relays(), enforce_tls)
        } else {
            sanitized_all
        };

        let read = {
            let sanitized = sanitize_relay_list(&preferences.read, enforce_tls);
            if sanitized.is_empty() {
                effective_all.clone()
            } else {
                sanitized
            }
        };
        let write = {
            let sanitized = sanitize_relay_list(&preferences.write, enforce_tls);
            if sanitized.is_empty() {
                effective_all.clone()
            } else {
                sanitized
            }
        };

        let mut directory = self.directory();
        directory.all = effective_all;
        directory.read = read;
        directory.write = write;
    }

    /// Get or establish the shared connection for `url`.
    ///
    /// Concurrent callers before the connection exists share one in-flight
    /// connect; a failed connect leaves nothing cached, so the next call
    /// retries. Backend-capability failures surface as `pool-unavailable`;
    /// everything else becomes `relay-connect-failed` and feeds backoff.
    pub async fn ensure_relay(&self, url: &str) -> Result<Arc<RelayConnection>> {
        let normalized = url.trim();
        if normalized.is_empty() {
            return Err(ClientError::InvalidUrl("empty relay URL".to_string()));
        }

        let cell = {
            let mut connections = self.inner.connections.lock().await;
            if !connections.contains_key(normalized)
                && connections.len() >= self.inner.config.max_relays
            {
                return Err(ClientError::InvalidRequest(format!(
                    "maximum relay limit ({}) reached",
                    self.inner.config.max_relays
                )));
            }
            Arc::clone(
                connections
                    .entry(normalized.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        if let Some(existing) = cell.get() {
            if existing.state().await == ConnectionState::Disconnected {
                match existing.connect(self.inner.transport.as_ref()).await {
                    Ok(()) | Err(ClientError::AlreadyConnected) => {}
                    Err(error) => return Err(self.classify_reconnect_error(normalized, error)),
                }
            }
            return Ok(Arc::clone(existing));
        }

        let connected = cell
            .get_or_try_init(|| async {
                let mut relay_config = self.inner.config.relay_config.clone();
                relay_config.event_channel_capacity = relay_config
                    .event_channel_capacity
                    .max(POOL_EVENT_CHANNEL_CAPACITY);
                let connection = Arc::new(RelayConnection::with_config(normalized, relay_config)?);
                connection.connect(self.inner.transport.as_ref()).await?;
                Ok::<_, ClientError>(connection)
            })
            .await;

        match connected {
            Ok(connection) => Ok(Arc::clone(connection)),
            Err(error) => Err(self.classify_connect_error(normalized, error)),
        }
    }

    fn classify_connect_error(&self, url: &str, error: ClientError) -> ClientError {
        if matches!(error, ClientError::PoolUnavailable(_)) {
            return error;
        }
        debug!(relay = %url, error = %error, "relay connection failed");
        self.inner.health.record_failure(url, "connect-failed");
        ClientError::ConnectFailed {
            relay: url.to_string(),
        }
    }

    /// Like [`Self::classify_connect_error`], for a connection that existed
    /// before and cannot be re-established.
    fn classify_reconnect_error(&self, url: &str, error: ClientError) -> ClientError {
        if matches!(error, ClientError::PoolUnavailable(_)) {
            return error;
        }
        debug!(relay = %url, error = %error, "relay reconnection failed");
        self.inner.health.record_failure(url, "relay-unavailable");
        ClientError::RelayUnavailable {
            relay: url.to_string(),
        }
    }

    /// The shared connection for `url`, if one has been established.
    pub async fn relay(&self, url: &str) -> Option<Arc<RelayConnection>> {
        let connections = self.inner.connections.lock().await;
        connections.get(url.trim()).and_then(|cell| cell.get().cloned())
    }

    /// Probe every healthy relay with a minimal subscription.
    ///
    /// Returns the full per-relay result list and never fails as a whole.
    /// Successes clear the relay's failure state; failures feed backoff.
    pub async fn connect_to_relays(&self) -> Vec<ProbeResult> {
        let targets = self.inner.health.filter_healthy(&self.relays());
        if targets.is_empty() {
            return Vec::new();
        }

        let probes = targets.into_iter().map(|url| {
            let pool = self.clone();
            async move {
                let status = pool.probe_relay(&url).await;
                (url, status)
            }
        });

        let mut results = Vec::new();
        for (url, status) in join_all(probes).await {
            let success = matches!(status, ProbeStatus::Connected);
            match status {
                ProbeStatus::Connected => self.inner.health.clear_failure(&url),
                ProbeStatus::TimedOut => {
                    self.inner.health.record_failure(&url, "connect-timeout");
                    debug!(relay = %url, "marked relay as unreachable");
                }
                // ensure_relay already recorded the failure.
                ProbeStatus::ConnectError => {}
            }
            results.push(ProbeResult { url, success });
        }
        results
    }

    async fn probe_relay(&self, url: &str) -> ProbeStatus {
        let relay = match self.ensure_relay(url).await {
            Ok(relay) => relay,
            Err(_) => return ProbeStatus::ConnectError,
        };

        let subscription_id = generate_request_id(&self.inner.count_request_counter, "probe");
        let (subscription, mut events) = Subscription::with_channel(
            subscription_id.clone(),
            vec![json!({"kinds": [0], "limit": 1})],
        );
        let waiter = subscription.clone();
        if relay.subscribe(subscription).await.is_err() {
            return ProbeStatus::ConnectError;
        }

        let connected = tokio::select! {
            event = events.recv() => event.is_some(),
            () = waiter.eose() => true,
            () = tokio::time::sleep(self.inner.config.relay_config.connect_timeout) => false,
        };

        if let Err(error) = relay.unsubscribe(&subscription_id).await {
            debug!(relay = %url, error = %error, "probe unsubscribe failed");
        }

        if connected {
            ProbeStatus::Connected
        } else {
            ProbeStatus::TimedOut
        }
    }

    /// Reconnect delay for the given attempt number.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        self.inner
            .config
            .reconnect_base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.inner.config.reconnect_max_delay)
    }

    /// Reconnect attempts consumed so far.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_state().attempt
    }

    /// Schedule a background reconnect sweep.
    ///
    /// At most one timer is ever pending; the loop stops silently once the
    /// attempt budget is exhausted, and any probe success resets it.
    pub fn schedule_reconnect(&self, reason: &str) {
        let mut state = self.reconnect_state();
        if state.timer.is_some() {
            return;
        }
        if state.attempt >= self.inner.config.reconnect_max_attempts {
            debug!(
                attempts = state.attempt,
                reason, "relay reconnect attempts exhausted"
            );
            return;
        }

        let delay = self.reconnect_delay(state.attempt);
        state.attempt += 1;
        debug!(
            attempt = state.attempt,
            delay_ms = delay.as_millis() as u64,
            reason,
            "scheduling relay reconnect"
        );

        let pool = self.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pool.reconnect_state().timer = None;

            let results = pool.connect_to_relays().await;
            if results.iter().any(|result| result.success) {
                pool.reset_reconnect_state();
                return;
            }
            pool.schedule_reconnect("reconnect-failed");
        }));
    }

    /// Cancel any pending reconnect timer and zero the attempt counter.
    ///
    /// Called whenever the caller observes independent evidence of
    /// connectivity, e.g. a live subscription event arrived.
    pub fn reset_reconnect_state(&self) {
        let mut state = self.reconnect_state();
        state.attempt = 0;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Relays marked COUNT-unsupported so far.
    pub fn count_unsupported_relays(&self) -> Vec<String> {
        self.unsupported().iter().cloned().collect()
    }

    /// Forget which relays were marked COUNT-unsupported.
    ///
    /// A relay's protocol support does not change mid-session, but
    /// long-lived processes with churning relay lists can use this to keep
    /// the registry bounded.
    pub fn reset_count_support(&self) {
        self.unsupported().clear();
    }

    /// Run one COUNT request against one relay.
    ///
    /// Rejects without I/O when the relay is sticky-unsupported or every
    /// filter normalizes away. Connection failures feed backoff; an
    /// unsupported reply marks the relay sticky.
    pub async fn send_raw_count_frame(
        &self,
        relay_url: &str,
        filters: &[Value],
        timeout: Option<Duration>,
    ) -> Result<CountReply> {
        let normalized = relay_url.trim();
        if normalized.is_empty() {
            return Err(ClientError::InvalidUrl(
                "empty relay URL for COUNT request".to_string(),
            ));
        }

        if self.unsupported().contains(normalized) {
            return Err(ClientError::CountUnsupported {
                relay: normalized.to_string(),
            });
        }

        let normalized_filters = normalize_count_filters(filters);
        if normalized_filters.is_empty() {
            return Err(ClientError::EmptyCountFilters);
        }

        let request_id = generate_request_id(&self.inner.count_request_counter, "count");
        let relay = self.ensure_relay(normalized).await?;

        let timeout = timeout
            .filter(|timeout| *timeout > Duration::ZERO)
            .unwrap_or(self.inner.config.relay_config.count_timeout);

        match relay.count(&request_id, &normalized_filters, timeout).await {
            Ok(reply) => Ok(reply),
            Err(error) => {
                if error.is_count_unsupported() {
                    self.unsupported().insert(normalized.to_string());
                }
                Err(error)
            }
        }
    }

    /// Count matching events across many relays and merge the outcomes.
    ///
    /// Best-effort by contract: this never fails. Relays that are
    /// sticky-unsupported or excluded by health state are settled without
    /// I/O; the rest are queried concurrently with no concurrency cap.
    /// Timeouts degrade the result to `partial` without feeding the
    /// circuit breaker; hard errors feed backoff.
    pub async fn count_events_across_relays(
        &self,
        filters: &[Value],
        options: &CountOptions,
    ) -> AggregateCount {
        let normalized_filters = normalize_count_filters(filters);
        if normalized_filters.is_empty() {
            return AggregateCount::default();
        }

        let relay_list: Vec<String> = if options.relays.is_empty() {
            self.relays()
        } else {
            options
                .relays
                .iter()
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty())
                .collect()
        };

        let eligible: HashSet<String> = self
            .inner
            .health
            .filter_healthy(&relay_list)
            .into_iter()
            .collect();

        let mut outcomes: HashMap<String, CountOutcome> = HashMap::new();
        let mut active: Vec<String> = Vec::new();

        for url in &relay_list {
            if self.unsupported().contains(url) {
                outcomes.insert(url.clone(), CountOutcome::Unsupported);
            } else if !eligible.contains(url) {
                let reason = if self.inner.health.is_circuit_open(url) {
                    SkipReason::Circuit
                } else {
                    SkipReason::Backoff
                };
                debug!(relay = %url, reason = reason.as_str(), "relay skipped for COUNT fanout");
                outcomes.insert(url.clone(), CountOutcome::Skipped { reason });
            } else if !active.contains(url) {
                active.push(url.clone());
            }
        }

        let fanout = active.iter().map(|url| {
            let pool = self.clone();
            let filters = normalized_filters.clone();
            let url = url.clone();
            let timeout = options.timeout;
            async move {
                let outcome = match pool.send_raw_count_frame(&url, &filters, timeout).await {
                    Ok(reply) => {
                        pool.inner.health.clear_failure(&url);
                        CountOutcome::Ok {
                            count: reply.count,
                            frame: reply.frame,
                        }
                    }
                    Err(error) => {
                        if error.is_count_unsupported() {
                            CountOutcome::Unsupported
                        } else if error.is_timeout() {
                            // A slow relay may still be fine for ordinary
                            // subscriptions; timeouts never trip the breaker.
                            debug!(relay = %url, "relay COUNT timed out");
                            CountOutcome::TimedOut
                        } else {
                            warn!(
                                relay = %url,
                                code = error.code(),
                                error = %error,
                                "relay COUNT failed"
                            );
                            if !matches!(error, ClientError::ConnectFailed { .. }) {
                                pool.inner.health.record_failure(&url, "count-error");
                            }
                            CountOutcome::Error {
                                code: error.code().to_string(),
                            }
                        }
                    }
                };
                (url, outcome)
            }
        });

        for (url, outcome) in join_all(fanout).await {
            outcomes.insert(url, outcome);
        }

        let mut best: Option<BestCount> = None;
        let mut per_relay = Vec::with_capacity(relay_list.len());
        let mut partial = false;

        for url in &relay_list {
            let outcome = outcomes.get(url).cloned().unwrap_or(CountOutcome::Error {
                code: "internal".to_string(),
            });

            if outcome.is_partial() {
                partial = true;
            }

            if let CountOutcome::Ok { count, frame } = &outcome {
                let replace = match &best {
                    None => true,
                    Some(current) => {
                        *count > current.count
                            || (*count == current.count
                                && current.frame.is_none()
                                && frame.is_some())
                    }
                };
                if replace {
                    best = Some(BestCount {
                        relay: url.clone(),
                        count: *count,
                        frame: frame.clone(),
                    });
                }
            }

            per_relay.push(RelayCount {
                url: url.clone(),
                outcome,
            });
        }

        let total = best.as_ref().map_or(0, |best| best.count);
        AggregateCount {
            total,
            best,
            per_relay,
            partial,
        }
    }

    /// Disconnect every relay and cancel the reconnect loop.
    pub async fn disconnect_all(&self) {
        self.reset_reconnect_state();
        let connections: Vec<Arc<RelayConnection>> = {
            let table = self.inner.connections.lock().await;
            table.values().filter_map(|cell| cell.get().cloned()).collect()
        };
        for connection in connections {
            if let Err(error) = connection.disconnect().await {
                debug!(relay = connection.url(), error = %error, "disconnect failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BoxStream, CountTransport, TransportHandle};
    use futures::channel::mpsc as futures_mpsc;
    use futures_util::{Sink, StreamExt};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio_tungstenite::tungstenite::Message;
    use url::Url;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum MockBehavior {
        /// Answer COUNT frames with this count.
        CountReply(u64),
        /// Expose a native count call instead of frame support.
        NativeCount(u64),
        /// Accept COUNT frames but never answer them.
        IgnoreCount,
        /// Answer COUNT frames after a delay.
        LateReply(u64, Duration),
        /// Answer COUNT frames with CLOSED.
        ClosedReply,
        /// No COUNT capability at all.
        NoCountSupport,
        /// Fail the connection attempt.
        RefuseConnect,
    }

    #[derive(Debug)]
    struct MockTransport {
        behaviors: StdMutex<HashMap<String, MockBehavior>>,
        connect_attempts: AtomicUsize,
        count_frames_seen: Arc<AtomicUsize>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                behaviors: StdMutex::new(HashMap::new()),
                connect_attempts: AtomicUsize::new(0),
                count_frames_seen: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn set(&self, host: &str, behavior: MockBehavior) {
            self.behaviors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(host.to_string(), behavior);
        }

        fn behavior_for(&self, url: &Url) -> MockBehavior {
            self.behaviors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(url.host_str().unwrap_or_default())
                .copied()
                .unwrap_or(MockBehavior::CountReply(0))
        }

        fn connects(&self) -> usize {
            self.connect_attempts.load(Ordering::SeqCst)
        }

        fn count_frames(&self) -> usize {
            self.count_frames_seen.load(Ordering::SeqCst)
        }
    }

    struct MockSink(futures_mpsc::UnboundedSender<Message>);

    impl Sink<Message> for MockSink {
        type Error = ClientError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<()> {
            self.0
                .unbounded_send(item)
                .map_err(|error| ClientError::WebSocket(error.to_string()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct MockNativeCount {
        count: u64,
    }

    #[async_trait::async_trait]
    impl CountTransport for MockNativeCount {
        async fn count(&self, _request_id: &str, _filters: &[Value]) -> Result<CountReply> {
            Ok(CountReply {
                count: self.count,
                frame: None,
            })
        }
    }

    #[async_trait::async_trait]
    impl WebSocketTransport for MockTransport {
        async fn connect(&self, url: &Url, _timeout: Duration) -> Result<TransportHandle> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            let behavior = self.behavior_for(url);

            if behavior == MockBehavior::RefuseConnect {
                return Err(ClientError::Connection("connection refused".to_string()));
            }

            let (out_tx, mut out_rx) = futures_mpsc::unbounded::<Message>();
            let (in_tx, in_rx) = futures_mpsc::unbounded::<Message>();
            let frames_seen = Arc::clone(&self.count_frames_seen);

            tokio::spawn(async move {
                while let Some(message) = out_rx.next().await {
                    let Message::Text(text) = message else { continue };
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let Some(array) = value.as_array() else { continue };
                    let kind = array.first().and_then(Value::as_str).unwrap_or_default();
                    let id = array.get(1).cloned().unwrap_or(Value::Null);

                    match (kind, behavior) {
                        ("COUNT", MockBehavior::CountReply(count)) => {
                            frames_seen.fetch_add(1, Ordering::SeqCst);
                            let reply = json!(["COUNT", id, { "count": count }]).to_string();
                            let _ = in_tx.unbounded_send(Message::Text(reply.into()));
                        }
                        ("COUNT", MockBehavior::LateReply(count, delay)) => {
                            frames_seen.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(delay).await;
                            let reply = json!(["COUNT", id, { "count": count }]).to_string();
                            let _ = in_tx.unbounded_send(Message::Text(reply.into()));
                        }
                        ("COUNT", MockBehavior::ClosedReply) => {
                            frames_seen.fetch_add(1, Ordering::SeqCst);
                            let reply =
                                json!(["CLOSED", id, "unsupported: COUNT not implemented"])
                                    .to_string();
                            let _ = in_tx.unbounded_send(Message::Text(reply.into()));
                        }
                        ("COUNT", MockBehavior::IgnoreCount) => {
                            frames_seen.fetch_add(1, Ordering::SeqCst);
                        }
                        ("REQ", _) => {
                            let reply = json!(["EOSE", id]).to_string();
                            let _ = in_tx.unbounded_send(Message::Text(reply.into()));
                        }
                        _ => {}
                    }
                }
            });

            let native_count: Option<Arc<dyn CountTransport>> = match behavior {
                MockBehavior::NativeCount(count) => Some(Arc::new(MockNativeCount { count })),
                _ => None,
            };
            let supports_count_frames = !matches!(
                behavior,
                MockBehavior::NoCountSupport | MockBehavior::NativeCount(_)
            );

            let stream: BoxStream = Box::new(in_rx.map(Ok::<Message, ClientError>));
            Ok(TransportHandle {
                sink: Box::new(MockSink(out_tx)),
                stream,
                native_count,
                supports_count_frames,
            })
        }
    }

    fn pool_with(transport: Arc<MockTransport>) -> RelayPool {
        RelayPool::with_transport(PoolConfig::default(), transport)
    }

    fn count_filters() -> Vec<Value> {
        vec![json!({"kinds": [1]})]
    }

    fn urls(hosts: &[&str]) -> Vec<String> {
        hosts.iter().map(|host| format!("wss://{host}")).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_picks_best_count_and_prefers_frames_on_ties() {
        let transport = MockTransport::new();
        transport.set("a.example", MockBehavior::NativeCount(5));
        transport.set("b.example", MockBehavior::CountReply(5));
        transport.set("c.example", MockBehavior::IgnoreCount);
        let pool = pool_with(transport);

        let options = CountOptions {
            relays: urls(&["a.example", "b.example", "c.example"]),
            timeout: None,
        };
        let aggregate = pool
            .count_events_across_relays(&count_filters(), &options)
            .await;

        assert_eq!(aggregate.total, 5);
        assert!(aggregate.partial, "timed-out relay must mark the result partial");

        let best = aggregate.best.as_ref();
        assert_eq!(best.map(|best| best.relay.as_str()), Some("wss://b.example"));
        assert!(best.is_some_and(|best| best.frame.is_some()));

        assert_eq!(aggregate.per_relay.len(), 3);
        assert_eq!(aggregate.per_relay[0].url, "wss://a.example");
        assert!(matches!(
            aggregate.per_relay[0].outcome,
            CountOutcome::Ok { count: 5, frame: None }
        ));
        assert!(matches!(
            aggregate.per_relay[2].outcome,
            CountOutcome::TimedOut
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_resolves_even_when_every_relay_times_out() {
        let transport = MockTransport::new();
        for host in ["a.example", "b.example", "c.example"] {
            transport.set(host, MockBehavior::IgnoreCount);
        }
        let pool = pool_with(Arc::clone(&transport));

        let options = CountOptions {
            relays: urls(&["a.example", "b.example", "c.example"]),
            timeout: None,
        };
        let aggregate = pool
            .count_events_across_relays(&count_filters(), &options)
            .await;

        assert_eq!(aggregate.total, 0);
        assert!(aggregate.best.is_none());
        assert!(aggregate.partial);
        assert!(
            aggregate
                .per_relay
                .iter()
                .all(|entry| matches!(entry.outcome, CountOutcome::TimedOut))
        );

        // Timeouts never feed the circuit breaker.
        for url in urls(&["a.example", "b.example", "c.example"]) {
            assert!(pool.health().backoff_entry(&url).is_none());
            assert!(pool.health().circuit_state(&url).is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_filters_short_circuit_without_io() {
        let transport = MockTransport::new();
        let pool = pool_with(Arc::clone(&transport));

        let aggregate = pool
            .count_events_across_relays(&[json!({})], &CountOptions::default())
            .await;

        assert_eq!(aggregate.total, 0);
        assert!(aggregate.best.is_none());
        assert!(aggregate.per_relay.is_empty());
        assert!(!aggregate.partial);
        assert_eq!(transport.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn raw_count_rejects_empty_filters_before_any_network_call() {
        let transport = MockTransport::new();
        let pool = pool_with(Arc::clone(&transport));

        let result = pool
            .send_raw_count_frame("wss://a.example", &[json!({})], None)
            .await;

        assert!(matches!(result, Err(ClientError::EmptyCountFilters)));
        assert_eq!(transport.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_relays_are_sticky_and_clearable() {
        let transport = MockTransport::new();
        transport.set("n.example", MockBehavior::NoCountSupport);
        let pool = pool_with(Arc::clone(&transport));

        let options = CountOptions {
            relays: urls(&["n.example"]),
            timeout: None,
        };

        let first = pool
            .count_events_across_relays(&count_filters(), &options)
            .await;
        assert!(matches!(
            first.per_relay[0].outcome,
            CountOutcome::Unsupported
        ));
        assert_eq!(transport.count_frames(), 0);
        let connects_after_first = transport.connects();

        // The second pass settles before any I/O.
        let second = pool
            .count_events_across_relays(&count_filters(), &options)
            .await;
        assert!(matches!(
            second.per_relay[0].outcome,
            CountOutcome::Unsupported
        ));
        assert_eq!(transport.connects(), connects_after_first);

        let direct = pool
            .send_raw_count_frame("wss://n.example", &count_filters(), None)
            .await;
        assert!(matches!(direct, Err(ClientError::CountUnsupported { .. })));

        assert_eq!(
            pool.count_unsupported_relays(),
            vec!["wss://n.example".to_string()]
        );
        pool.reset_count_support();
        assert!(pool.count_unsupported_relays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_reply_marks_the_relay_unsupported() {
        let transport = MockTransport::new();
        transport.set("closed.example", MockBehavior::ClosedReply);
        let pool = pool_with(Arc::clone(&transport));

        let result = pool
            .send_raw_count_frame("wss://closed.example", &count_filters(), None)
            .await;
        assert!(matches!(result, Err(ClientError::CountUnsupported { .. })));

        assert_eq!(
            pool.count_unsupported_relays(),
            vec!["wss://closed.example".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hard_errors_feed_backoff_but_do_not_mark_partial() {
        let transport = MockTransport::new();
        transport.set("down.example", MockBehavior::RefuseConnect);
        transport.set("up.example", MockBehavior::CountReply(3));
        let pool = pool_with(Arc::clone(&transport));

        let options = CountOptions {
            relays: urls(&["down.example", "up.example"]),
            timeout: None,
        };
        let aggregate = pool
            .count_events_across_relays(&count_filters(), &options)
            .await;

        assert_eq!(aggregate.total, 3);
        assert!(!aggregate.partial);
        assert!(matches!(
            &aggregate.per_relay[0].outcome,
            CountOutcome::Error { code } if code == "relay-connect-failed"
        ));

        let entry = pool.health().backoff_entry("wss://down.example");
        assert!(entry.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn health_state_partitions_skipped_relays_by_reason() {
        let transport = MockTransport::new();
        transport.set("ok.example", MockBehavior::CountReply(1));
        let pool = pool_with(Arc::clone(&transport));

        // One relay under plain backoff, one with an open breaker.
        pool.health().record_failure("wss://backoff.example", "connect-timeout");
        for _ in 0..3 {
            pool.health().record_failure("wss://circuit.example", "count-error");
        }

        let options = CountOptions {
            relays: urls(&["backoff.example", "circuit.example", "ok.example"]),
            timeout: None,
        };
        let aggregate = pool
            .count_events_across_relays(&count_filters(), &options)
            .await;

        assert!(matches!(
            aggregate.per_relay[0].outcome,
            CountOutcome::Skipped {
                reason: SkipReason::Backoff
            }
        ));
        assert!(matches!(
            aggregate.per_relay[1].outcome,
            CountOutcome::Skipped {
                reason: SkipReason::Circuit
            }
        ));
        assert!(matches!(
            aggregate.per_relay[2].outcome,
            CountOutcome::Ok { count: 1, .. }
        ));
        assert!(aggregate.partial);
        // Only the healthy relay was contacted.
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_successful_count_clears_prior_failure_state() {
        let transport = MockTransport::new();
        transport.set("flaky.example", MockBehavior::CountReply(2));
        let pool = pool_with(Arc::clone(&transport));

        pool.health().record_failure("wss://flaky.example", "connect-timeout");
        tokio::time::advance(Duration::from_millis(1100)).await;

        let options = CountOptions {
            relays: urls(&["flaky.example"]),
            timeout: None,
        };
        let aggregate = pool
            .count_events_across_relays(&count_filters(), &options)
            .await;

        assert_eq!(aggregate.total, 2);
        assert!(pool.health().backoff_entry("wss://flaky.example").is_none());
        assert_eq!(
            pool.health().windowed_failure_count("wss://flaky.example"),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_replies_after_a_timeout_are_dropped_silently() -> Result<()> {
        let transport = MockTransport::new();
        transport.set(
            "slow.example",
            MockBehavior::LateReply(9, Duration::from_secs(5)),
        );
        let pool = pool_with(Arc::clone(&transport));

        let result = pool
            .send_raw_count_frame("wss://slow.example", &count_filters(), None)
            .await;
        assert!(matches!(result, Err(ClientError::CountTimeout { .. })));

        let connection = pool
            .relay("wss://slow.example")
            .await
            .ok_or_else(|| ClientError::Internal("connection missing after COUNT".to_string()))?;
        assert_eq!(connection.open_count_requests(), 0);

        // Let the late reply arrive; it must not resolve anything or kill
        // the connection.
        tokio::time::advance(Duration::from_secs(6)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(connection.open_count_requests(), 0);
        assert_eq!(connection.state().await, ConnectionState::Connected);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_relay_shares_one_connection_per_url() -> Result<()> {
        let transport = MockTransport::new();
        transport.set("a.example", MockBehavior::CountReply(0));
        let pool = pool_with(Arc::clone(&transport));

        let first = pool.ensure_relay("wss://a.example").await?;
        let second = pool.ensure_relay("wss://a.example").await?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.connects(), 1);

        pool.disconnect_all().await;
        assert_eq!(first.state().await, ConnectionState::Disconnected);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_relay_enforces_the_relay_limit() -> Result<()> {
        let transport = MockTransport::new();
        let config = PoolConfig {
            max_relays: 1,
            ..PoolConfig::default()
        };
        let pool = RelayPool::with_transport(config, transport);

        pool.ensure_relay("wss://a.example").await?;
        let second = pool.ensure_relay("wss://b.example").await;
        assert!(matches!(second, Err(ClientError::InvalidRequest(_))));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_are_retried_on_the_next_ensure() -> Result<()> {
        let transport = MockTransport::new();
        transport.set("flap.example", MockBehavior::RefuseConnect);
        let pool = pool_with(Arc::clone(&transport));

        let first = pool.ensure_relay("wss://flap.example").await;
        assert!(matches!(first, Err(ClientError::ConnectFailed { .. })));

        transport.set("flap.example", MockBehavior::CountReply(0));
        // Still under backoff from the failed attempt, but a direct ensure
        // is allowed to retry; only fanouts consult the health filter.
        let connection = pool.ensure_relay("wss://flap.example").await?;
        assert_eq!(transport.connects(), 2);

        // An established connection that drops and cannot come back is a
        // different failure than one that never existed.
        connection.disconnect().await?;
        transport.set("flap.example", MockBehavior::RefuseConnect);
        let third = pool.ensure_relay("wss://flap.example").await;
        assert!(matches!(third, Err(ClientError::RelayUnavailable { .. })));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn connect_probe_reports_per_relay_results() {
        let transport = MockTransport::new();
        transport.set("good.example", MockBehavior::CountReply(0));
        transport.set("bad.example", MockBehavior::RefuseConnect);
        let pool = pool_with(Arc::clone(&transport));

        pool.apply_relay_preferences(&RelayPreferences {
            all: urls(&["good.example", "bad.example"]),
            read: Vec::new(),
            write: Vec::new(),
        });

        let results = pool.connect_to_relays().await;
        assert_eq!(results.len(), 2);

        let by_url: HashMap<&str, bool> = results
            .iter()
            .map(|result| (result.url.as_str(), result.success))
            .collect();
        assert_eq!(by_url.get("wss://good.example"), Some(&true));
        assert_eq!(by_url.get("wss://bad.example"), Some(&false));

        assert!(pool.health().backoff_entry("wss://good.example").is_none());
        assert!(pool.health().backoff_entry("wss://bad.example").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_delays_double_up_to_the_cap() {
        let pool = pool_with(MockTransport::new());

        let expected = [2, 4, 8, 16, 32, 60, 60];
        for (attempt, seconds) in expected.into_iter().enumerate() {
            assert_eq!(
                pool.reconnect_delay(attempt as u32),
                Duration::from_secs(seconds)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_schedules_at_most_one_timer() {
        let transport = MockTransport::new();
        transport.set("good.example", MockBehavior::CountReply(0));
        let pool = pool_with(transport);
        pool.apply_relay_preferences(&RelayPreferences {
            all: urls(&["good.example"]),
            read: Vec::new(),
            write: Vec::new(),
        });

        pool.schedule_reconnect("test");
        pool.schedule_reconnect("test");
        assert_eq!(pool.reconnect_attempts(), 1);

        pool.reset_reconnect_state();
        assert_eq!(pool.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resets_after_a_successful_probe() {
        let transport = MockTransport::new();
        transport.set("good.example", MockBehavior::CountReply(0));
        let pool = pool_with(Arc::clone(&transport));
        pool.apply_relay_preferences(&RelayPreferences {
            all: urls(&["good.example"]),
            read: Vec::new(),
            write: Vec::new(),
        });

        pool.schedule_reconnect("subscription-stalled");
        assert_eq!(pool.reconnect_attempts(), 1);

        // Run through the reconnect delay and the probe.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(pool.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_max_attempts() {
        let transport = MockTransport::new();
        transport.set("down.example", MockBehavior::RefuseConnect);
        let pool = pool_with(Arc::clone(&transport));
        pool.apply_relay_preferences(&RelayPreferences {
            all: urls(&["down.example"]),
            read: Vec::new(),
            write: Vec::new(),
        });

        pool.schedule_reconnect("test");
        // Delays total 2+4+8+16+32 seconds; sleep well past them. The relay
        // spends part of that excluded by backoff, which still counts as a
        // failed sweep.
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(pool.reconnect_attempts(), 5);
        pool.schedule_reconnect("test");
        assert_eq!(pool.reconnect_attempts(), 5, "exhausted loop must stop");
    }

    #[tokio::test(start_paused = true)]
    async fn relay_connections_broadcast_inbound_messages() -> Result<()> {
        let transport = MockTransport::new();
        transport.set("a.example", MockBehavior::CountReply(0));
        let pool = pool_with(transport);

        let connection = pool.ensure_relay("wss://a.example").await?;
        let mut events = connection.subscribe_events();

        let subscription = Subscription::new("listener".to_string(), vec![json!({"kinds": [0]})]);
        connection.subscribe(subscription).await?;

        let message = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .map_err(|_| ClientError::Timeout("no broadcast message".to_string()))?
            .map_err(|error| ClientError::Internal(error.to_string()))?;
        assert!(matches!(message, crate::relay::RelayMessage::Eose(id) if id == "listener"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn preferences_fall_back_sensibly() {
        let pool = pool_with(MockTransport::new());

        pool.apply_relay_preferences(&RelayPreferences {
            all: vec![
                "wss://primary.example".to_string(),
                "not-a-relay".to_string(),
            ],
            read: Vec::new(),
            write: vec!["wss://writer.example".to_string()],
        });

        assert_eq!(pool.relays(), vec!["wss://primary.example".to_string()]);
        assert_eq!(pool.read_relays(), vec!["wss://primary.example".to_string()]);
        assert_eq!(pool.write_relays(), vec!["wss://writer.example".to_string()]);

        // An all-invalid `all` list falls back to the defaults.
        pool.apply_relay_preferences(&RelayPreferences {
            all: vec!["ftp://nope.example".to_string()],
            read: Vec::new(),
            write: Vec::new(),
        });
        assert_eq!(pool.relays(), default_relays());
    }
}
