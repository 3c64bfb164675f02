//! WebSocket transport seam for relay connections.
//!
//! Connections are built over a boxed sink/stream pair so the pool can be
//! driven by the real tokio-tungstenite backend in production and by
//! scripted transports in tests. The seam also carries the COUNT
//! capability: a backend either speaks correlated COUNT frames over the
//! duplex stream, offers a native count call, or supports neither.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::{Error as WsError, UrlError};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::count::CountReply;
use crate::error::{ClientError, Result};

/// Outbound half of a relay transport.
pub type BoxSink = Box<dyn Sink<Message, Error = ClientError> + Send + Unpin>;
/// Inbound half of a relay transport.
pub type BoxStream = Box<dyn Stream<Item = Result<Message>> + Send + Unpin>;

/// How one relay connection issues COUNT requests.
///
/// Selected once when the connection is established: raw-frame correlation
/// when the backend speaks duplex frames, the backend's own count call when
/// it offers one. A connection with neither capability marks the relay
/// COUNT-unsupported.
#[async_trait]
pub trait CountTransport: Send + Sync {
    /// Issue one COUNT request and wait for its reply.
    ///
    /// Implementations do not enforce a deadline; the caller owns the
    /// timeout and the pending-request cleanup it triggers.
    async fn count(&self, request_id: &str, filters: &[Value]) -> Result<CountReply>;
}

/// A freshly established transport, ready to be owned by a connection.
pub struct TransportHandle {
    pub sink: BoxSink,
    pub stream: BoxStream,
    /// Direct count-call capability, when the backend provides one.
    pub native_count: Option<Arc<dyn CountTransport>>,
    /// Whether COUNT frames can be correlated over the duplex stream.
    pub supports_count_frames: bool,
}

/// Transport backend used by the pool to open relay connections.
#[async_trait]
pub trait WebSocketTransport: fmt::Debug + Send + Sync {
    async fn connect(&self, url: &Url, connect_timeout: Duration) -> Result<TransportHandle>;
}

/// Default websocket transport over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultWebSocketTransport;

#[async_trait]
impl WebSocketTransport for DefaultWebSocketTransport {
    async fn connect(&self, url: &Url, connect_timeout: Duration) -> Result<TransportHandle> {
        let (stream, _response) = timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!("connection timeout after {connect_timeout:?}"))
            })?
            .map_err(map_connect_error)?;

        let (sink, stream) = stream.split();
        let stream = stream.map(|item| {
            item.map_err(|error| ClientError::WebSocket(error.to_string()))
        });

        Ok(TransportHandle {
            sink: Box::new(WsSink(sink)),
            stream: Box::new(stream),
            native_count: None,
            supports_count_frames: true,
        })
    }
}

/// Backend errors that mean the websocket stack itself cannot serve this
/// URL class are surfaced as the fatal `pool-unavailable` code; everything
/// else stays a per-relay connection failure.
fn map_connect_error(error: WsError) -> ClientError {
    match error {
        WsError::Url(url_error) => match url_error {
            UrlError::TlsFeatureNotEnabled | UrlError::UnsupportedUrlScheme => {
                ClientError::PoolUnavailable(url_error.to_string())
            }
            other => ClientError::WebSocket(other.to_string()),
        },
        other => ClientError::WebSocket(other.to_string()),
    }
}

type WsStreamInner = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsSink(SplitSink<WsStreamInner, Message>);

impl Sink<Message> for WsSink {
    type Error = ClientError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.0)
            .poll_ready_unpin(cx)
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<()> {
        Pin::new(&mut self.0)
            .start_send_unpin(item)
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.0)
            .poll_flush_unpin(cx)
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.0)
            .poll_close_unpin(cx)
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }
}
