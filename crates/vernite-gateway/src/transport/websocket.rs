//! WebSocket listener using tokio-tungstenite.
//!
//! The upgrade callback enforces the endpoint path and origin list and
//! captures the request headers; authentication runs after the upgrade,
//! before the connection is handed to the server. Inbound messages of
//! either kind are capped by tungstenite while they are read.

use crate::handshake::HandshakeRequest;
use crate::session::{Frame, FrameSink};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use vernite_proto::{VerniteError, VerniteResult};

pub type WsStream = WebSocketStream<TcpStream>;

/// Default upper bound for one inbound message (1 MiB).
pub const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// How long a close frame may wait on a peer that is not reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which upgrade requests are accepted.
#[derive(Debug, Clone)]
pub struct UpgradePolicy {
    pub path: String,
    /// Exact `Origin` values allowed. Empty allows any origin; requests
    /// without an `Origin` header are not browsers and always pass.
    pub allowed_origins: Vec<String>,
    /// Largest inbound message or frame, text or binary.
    pub max_message_size: usize,
}

impl UpgradePolicy {
    pub fn check(&self, path: &str, origin: Option<&str>) -> Result<(), StatusCode> {
        if path != self.path {
            return Err(StatusCode::NOT_FOUND);
        }
        match origin {
            Some(origin)
                if !self.allowed_origins.is_empty()
                    && !self.allowed_origins.iter().any(|o| o == origin) =>
            {
                Err(StatusCode::FORBIDDEN)
            }
            _ => Ok(()),
        }
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

/// An upgraded connection plus what was captured from its request.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    pub request: HandshakeRequest,
}

impl WebSocketConnection {
    /// Split into the shared write half and the read half.
    pub fn split(self) -> (Arc<WebSocketSink>, SplitStream<WsStream>, HandshakeRequest) {
        let (sink, stream) = self.ws_stream.split();
        (Arc::new(WebSocketSink::new(sink)), stream, self.request)
    }
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields upgraded
/// connections. The accept loop stops once the receiver is dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
    policy: UpgradePolicy,
) -> VerniteResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| VerniteError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, path = %policy.path, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);
    let policy = Arc::new(policy);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("connection receiver dropped, stopping listener");
                    break;
                }
                accepted = tcp_listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let tx = tx.clone();
                        let policy = policy.clone();
                        tokio::spawn(async move {
                            match upgrade(stream, peer_addr, &policy).await {
                                Ok(conn) => {
                                    if tx.send(conn).await.is_err() {
                                        warn!("WebSocket connection channel closed");
                                    }
                                }
                                Err(e) => {
                                    debug!(remote = %peer_addr, error = %e, "WebSocket upgrade refused");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "TCP accept failed");
                    }
                },
            }
        }
    });

    Ok((local_addr, rx))
}

async fn upgrade(
    stream: TcpStream,
    peer_addr: SocketAddr,
    policy: &UpgradePolicy,
) -> VerniteResult<WebSocketConnection> {
    let (req_tx, req_rx) = oneshot::channel();

    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        let origin = request.headers().get(ORIGIN).and_then(|v| v.to_str().ok());
        if let Err(status) = policy.check(path, origin) {
            warn!(remote = %peer_addr, path, origin, status = status.as_u16(), "upgrade rejected");
            let mut rejection = ErrorResponse::new(status.canonical_reason().map(str::to_string));
            *rejection.status_mut() = status;
            return Err(rejection);
        }
        let _ = req_tx.send(HandshakeRequest::new(request.headers().clone(), peer_addr, path));
        Ok(response)
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(policy.ws_config()))
        .await
        .map_err(|e| VerniteError::Transport(format!("WS handshake failed: {e}")))?;
    let request = req_rx
        .await
        .map_err(|_| VerniteError::Transport("upgrade request not captured".into()))?;

    debug!(remote = %peer_addr, "WebSocket connection accepted");
    Ok(WebSocketConnection { ws_stream, request })
}

/// Write half of a WebSocket, shared between the read loop and fan-out.
pub struct WebSocketSink {
    inner: Mutex<SplitSink<WsStream, Message>>,
}

impl WebSocketSink {
    pub fn new(sink: SplitSink<WsStream, Message>) -> Self {
        Self {
            inner: Mutex::new(sink),
        }
    }

    /// Close with 1011 (internal error) and a short reason.
    pub async fn close_with_error(&self, reason: &str) -> VerniteResult<()> {
        self.close_with(CloseCode::Error, reason).await
    }

    /// Send a close frame. Gives up after [`CLOSE_TIMEOUT`] if the peer is
    /// not reading.
    pub async fn close_with(&self, code: CloseCode, reason: &str) -> VerniteResult<()> {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let send = async {
            let mut sink = self.inner.lock().await;
            sink.send(Message::Close(Some(frame))).await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, send).await {
            Ok(result) => result.map_err(|e| VerniteError::Transport(format!("WS close failed: {e}"))),
            Err(_) => Err(VerniteError::Transport("WS close timed out".into())),
        }
    }
}

impl FrameSink for WebSocketSink {
    fn send_frame(&self, frame: Frame) -> BoxFuture<'_, VerniteResult<()>> {
        Box::pin(async move {
            let message = match frame {
                Frame::Binary(data) => Message::Binary(data.into()),
                Frame::Text(text) => Message::Text(text.into()),
            };
            let mut sink = self.inner.lock().await;
            sink.send(message)
                .await
                .map_err(|e| VerniteError::Transport(format!("WS send failed: {e}")))
        })
    }

    fn close(&self) -> BoxFuture<'_, VerniteResult<()>> {
        Box::pin(async move {
            let mut sink = self.inner.lock().await;
            sink.close()
                .await
                .map_err(|e| VerniteError::Transport(format!("WS close failed: {e}")))
        })
    }
}
