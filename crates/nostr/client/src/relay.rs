//! Single relay connection management.
//!
//! A `RelayConnection` owns one transport: the outbound sink, a background
//! read loop translating inbound frames into typed messages, the live
//! subscription table, and the pending COUNT correlation map. The COUNT
//! capability is selected once at connect time (see
//! [`crate::transport::CountTransport`]). A pending COUNT entry is removed
//! exactly once, by whichever comes first of the reply, the caller's
//! timeout cleanup, or the connection dropping; late replies for an
//! already-removed id are dropped silently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use nostr::Event;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, broadcast, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::config::RelayConfig;
use crate::count::{CountReply, extract_count_value};
use crate::error::{ClientError, Result};
use crate::subscription::Subscription;
use crate::transport::{BoxSink, CountTransport, WebSocketTransport};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Relay message received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event(String, Event),
    Ok(String, bool, String),
    Eose(String),
    Count(String, Value),
    Closed(String, String),
    Notice(String),
    Auth(String),
}

type PendingCountMap = Arc<StdMutex<HashMap<String, oneshot::Sender<Result<Value>>>>>;

fn lock_pending(
    pending: &PendingCountMap,
) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Result<Value>>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Relay connection.
pub struct RelayConnection {
    url: Url,
    config: RelayConfig,
    state: Arc<RwLock<ConnectionState>>,
    writer: Arc<Mutex<Option<BoxSink>>>,
    events_tx: broadcast::Sender<RelayMessage>,
    subscriptions: Arc<Mutex<HashMap<String, Subscription>>>,
    open_count_requests: PendingCountMap,
    count_transport: Arc<RwLock<Option<Arc<dyn CountTransport>>>>,
    recv_task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl RelayConnection {
    /// Create a new relay connection with default config.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Create a new relay connection with custom config.
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        let parsed_url = Url::parse(url)?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed_url.scheme()
            )));
        }

        let (events_tx, _events_rx) = broadcast::channel(config.event_channel_capacity.max(1));

        Ok(Self {
            url: parsed_url,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            writer: Arc::new(Mutex::new(None)),
            events_tx,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            open_count_requests: Arc::new(StdMutex::new(HashMap::new())),
            count_transport: Arc::new(RwLock::new(None)),
            recv_task: Arc::new(Mutex::new(None)),
        })
    }

    /// Relay URL as string.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Listen to every typed message this connection receives.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayMessage> {
        self.events_tx.subscribe()
    }

    /// Connect through `transport` and start the background read loop.
    ///
    /// The COUNT capability is fixed here: the backend's native count call
    /// when it has one, raw-frame correlation when it speaks duplex frames,
    /// neither when it supports none.
    pub async fn connect(&self, transport: &dyn WebSocketTransport) -> Result<()> {
        {
            let mut state_guard = self.state.write().await;
            if *state_guard == ConnectionState::Connected {
                return Err(ClientError::AlreadyConnected);
            }
            *state_guard = ConnectionState::Connecting;
        }

        let handle = match transport
            .connect(&self.url, self.config.connect_timeout)
            .await
        {
            Ok(handle) => handle,
            Err(error) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(error);
            }
        };

        *self.writer.lock().await = Some(handle.sink);

        let selected: Option<Arc<dyn CountTransport>> = if let Some(native) = handle.native_count {
            Some(native)
        } else if handle.supports_count_frames {
            Some(Arc::new(FrameCountTransport {
                writer: Arc::clone(&self.writer),
                pending: Arc::clone(&self.open_count_requests),
            }))
        } else {
            None
        };
        *self.count_transport.write().await = selected;
        *self.state.write().await = ConnectionState::Connected;

        let mut stream = handle.stream;
        let events_tx = self.events_tx.clone();
        let subscriptions = Arc::clone(&self.subscriptions);
        let pending = Arc::clone(&self.open_count_requests);
        let state = Arc::clone(&self.state);
        let relay_url = self.url.to_string();

        let task = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match parse_relay_message(text.as_str()) {
                        Ok(Some(RelayMessage::Event(subscription_id, event))) => {
                            let subscription =
                                { subscriptions.lock().await.get(&subscription_id).cloned() };
                            if let Some(subscription) = subscription
                                && let Err(error) = subscription.handle_event(event.clone())
                            {
                                warn!("subscription callback error on {}: {}", relay_url, error);
                            }
                            let _ = events_tx.send(RelayMessage::Event(subscription_id, event));
                        }
                        Ok(Some(RelayMessage::Eose(subscription_id))) => {
                            if let Some(subscription) =
                                subscriptions.lock().await.get(&subscription_id).cloned()
                            {
                                subscription.mark_eose();
                            }
                            let _ = events_tx.send(RelayMessage::Eose(subscription_id));
                        }
                        Ok(Some(RelayMessage::Count(request_id, payload))) => {
                            let sender = lock_pending(&pending).remove(&request_id);
                            match sender {
                                Some(sender) => {
                                    let _ = sender.send(Ok(payload));
                                }
                                None => debug!(
                                    relay = %relay_url,
                                    request_id = %request_id,
                                    "dropping COUNT reply with no pending request"
                                ),
                            }
                        }
                        Ok(Some(RelayMessage::Closed(subscription_id, message))) => {
                            let sender = lock_pending(&pending).remove(&subscription_id);
                            if let Some(sender) = sender {
                                warn!(
                                    relay = %relay_url,
                                    request_id = %subscription_id,
                                    message = %message,
                                    "relay closed COUNT request"
                                );
                                let _ = sender.send(Err(ClientError::CountUnsupported {
                                    relay: relay_url.clone(),
                                }));
                            } else {
                                subscriptions.lock().await.remove(&subscription_id);
                                let _ =
                                    events_tx.send(RelayMessage::Closed(subscription_id, message));
                            }
                        }
                        Ok(Some(message)) => {
                            let _ = events_tx.send(message);
                        }
                        Ok(None) => {}
                        Err(error) => {
                            warn!("protocol parse error on {}: {}", relay_url, error);
                            let _ = events_tx
                                .send(RelayMessage::Notice(format!("parse error: {}", error)));
                        }
                    },
                    Ok(Message::Ping(payload)) => {
                        debug!("received ping from {} ({} bytes)", relay_url, payload.len());
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Binary(_)) => {}
                    Ok(Message::Frame(_)) => {}
                    Err(error) => {
                        warn!("websocket read error on {}: {}", relay_url, error);
                        break;
                    }
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            drain_pending(&pending, &relay_url);
        });

        *self.recv_task.lock().await = Some(task);
        Ok(())
    }

    /// Disconnect from relay and stop background tasks.
    pub async fn disconnect(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.send(Message::Close(None)).await?;
        }

        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }

        *self.count_transport.write().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
        drain_pending(&self.open_count_requests, self.url.as_str());
        Ok(())
    }

    /// Register and send subscription request.
    ///
    /// The subscription is registered before the REQ frame goes out so a
    /// relay answering instantly cannot race past the table.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        let subscription_id = subscription.id.clone();
        let mut frame = vec![json!("REQ"), json!(subscription.id)];
        frame.extend(subscription.filters.iter().cloned());

        self.subscriptions
            .lock()
            .await
            .insert(subscription_id.clone(), subscription);

        if let Err(error) = self.send_json(&Value::Array(frame)).await {
            self.subscriptions.lock().await.remove(&subscription_id);
            return Err(error);
        }
        Ok(())
    }

    /// Close subscription on relay.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.send_json(&json!(["CLOSE", subscription_id])).await?;
        self.subscriptions.lock().await.remove(subscription_id);
        Ok(())
    }

    /// Run one COUNT request with the connection's selected capability.
    ///
    /// On timeout the pending entry is removed here, so a reply arriving
    /// afterwards finds nothing to resolve and is dropped by the read loop.
    pub async fn count(
        &self,
        request_id: &str,
        filters: &[Value],
        timeout: Duration,
    ) -> Result<CountReply> {
        if self.state().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let transport = { self.count_transport.read().await.clone() };
        let Some(transport) = transport else {
            return Err(ClientError::CountUnsupported {
                relay: self.url.to_string(),
            });
        };

        match tokio::time::timeout(timeout, transport.count(request_id, filters)).await {
            Ok(reply) => reply,
            Err(_) => {
                self.remove_pending_count(request_id);
                Err(ClientError::CountTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn remove_pending_count(&self, request_id: &str) {
        lock_pending(&self.open_count_requests).remove(request_id);
    }

    /// Pending COUNT requests awaiting replies.
    pub fn open_count_requests(&self) -> usize {
        lock_pending(&self.open_count_requests).len()
    }

    async fn send_json(&self, value: &Value) -> Result<()> {
        if self.state().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let text = serde_json::to_string(value)?;
        self.send_text(text).await
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.send(Message::Text(text.into())).await
    }
}

/// Reject every pending COUNT request when the connection goes away.
fn drain_pending(pending: &PendingCountMap, relay_url: &str) {
    let drained: Vec<(String, oneshot::Sender<Result<Value>>)> =
        lock_pending(pending).drain().collect();
    for (request_id, sender) in drained {
        debug!(
            relay = %relay_url,
            request_id = %request_id,
            "rejecting pending COUNT request on disconnect"
        );
        let _ = sender.send(Err(ClientError::Connection(format!(
            "relay {relay_url} connection closed"
        ))));
    }
}

/// COUNT over the duplex frame stream, correlated by request id.
struct FrameCountTransport {
    writer: Arc<Mutex<Option<BoxSink>>>,
    pending: PendingCountMap,
}

#[async_trait]
impl CountTransport for FrameCountTransport {
    async fn count(&self, request_id: &str, filters: &[Value]) -> Result<CountReply> {
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(request_id.to_string(), tx);

        let mut frame = vec![json!("COUNT"), json!(request_id)];
        frame.extend(filters.iter().cloned());
        let text = serde_json::to_string(&Value::Array(frame))?;

        let send_result = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                None => Err(ClientError::NotConnected),
                Some(sink) => sink.send(Message::Text(text.into())).await,
            }
        };
        if let Err(error) = send_result {
            lock_pending(&self.pending).remove(request_id);
            return Err(error);
        }

        match rx.await {
            Ok(Ok(payload)) => {
                let count = extract_count_value(&payload);
                let frame = json!(["COUNT", request_id, payload]);
                Ok(CountReply {
                    count,
                    frame: Some(frame),
                })
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(ClientError::Connection(
                "COUNT reply channel dropped".to_string(),
            )),
        }
    }
}

/// Parse relay protocol JSON text message into typed relay message.
pub fn parse_relay_message(text: &str) -> Result<Option<RelayMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let array = value
        .as_array()
        .ok_or_else(|| ClientError::Protocol("expected JSON array relay message".to_string()))?;
    if array.is_empty() {
        return Ok(None);
    }

    let kind = array[0]
        .as_str()
        .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

    match kind {
        "EVENT" => {
            if array.len() < 3 {
                return Err(ClientError::Protocol("invalid EVENT message".to_string()));
            }
            let subscription_id = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid EVENT subscription id".to_string()))?
                .to_string();
            let event: Event = serde_json::from_value(array[2].clone()).map_err(|error| {
                ClientError::Protocol(format!("invalid EVENT payload: {}", error))
            })?;
            Ok(Some(RelayMessage::Event(subscription_id, event)))
        }
        "OK" => {
            if array.len() < 4 {
                return Err(ClientError::Protocol("invalid OK message".to_string()));
            }
            let event_id = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid OK event id".to_string()))?
                .to_string();
            let accepted = array[2]
                .as_bool()
                .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
            let message = array[3]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid OK message text".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Ok(event_id, accepted, message)))
        }
        "EOSE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid EOSE message".to_string()));
            }
            let subscription_id = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid EOSE subscription id".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Eose(subscription_id)))
        }
        "COUNT" => {
            if array.len() < 3 {
                return Err(ClientError::Protocol("invalid COUNT message".to_string()));
            }
            let request_id = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid COUNT request id".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Count(request_id, array[2].clone())))
        }
        "CLOSED" => {
            if array.len() < 3 {
                return Err(ClientError::Protocol("invalid CLOSED message".to_string()));
            }
            let subscription_id = array[1]
                .as_str()
                .ok_or_else(|| {
                    ClientError::Protocol("invalid CLOSED subscription id".to_string())
                })?
                .to_string();
            let message = array[2]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid CLOSED message text".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Closed(subscription_id, message)))
        }
        "NOTICE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid NOTICE message".to_string()));
            }
            let message = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid NOTICE message text".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Notice(message)))
        }
        "AUTH" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid AUTH message".to_string()));
            }
            let challenge = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid AUTH challenge".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Auth(challenge)))
        }
        _ => Ok(None),
    }
}
