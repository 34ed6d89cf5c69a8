//! Core server: accepts connections, authenticates them and runs one read
//! loop per connection.
//!
//! Owns the connection registry, dispatcher and heartbeat task, and
//! coordinates shutdown of all live connections.

use crate::config::GatewayConfig;
use crate::dispatch::{Dispatcher, HandlerRegistry};
use crate::handlers::TextRelayHandler;
use crate::handshake::HandshakeAuthenticator;
use crate::heartbeat::{record_pong, run_heartbeat};
use crate::registry::ConnectionRegistry;
use crate::session::ConnectionSession;
use crate::store::SessionStore;
use crate::transport::websocket::{self, UpgradePolicy, WebSocketConnection, WebSocketSink, WsStream};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use vernite_proto::packets::KeepAlive;
use vernite_proto::{codec, VerniteError, VerniteResult};

/// The gateway server instance.
pub struct GatewayServer {
    config: GatewayConfig,
    connections: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
    authenticator: HandshakeAuthenticator,
    relay: TextRelayHandler,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
    /// Set by the accept loop before live connections are closed.
    stopping: AtomicBool,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, store: Arc<dyn SessionStore>, handlers: HandlerRegistry) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::new(handlers), connections.clone());
        let authenticator =
            HandshakeAuthenticator::new(store, config.cookie_name.clone(), config.forwarded_header.clone());
        Self {
            config,
            connections,
            dispatcher,
            authenticator,
            relay: TextRelayHandler,
            shutdown_tx: broadcast::channel(1).0,
            stopping: AtomicBool::new(false),
        }
    }

    /// The live connection set; other components use it to push packets.
    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        self.connections.clone()
    }

    /// Sending on the returned channel stops the server.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind, start the heartbeat and accept loop, and return the bound
    /// address. The returned task finishes after shutdown once every live
    /// connection has been closed.
    pub async fn start(self) -> VerniteResult<(SocketAddr, JoinHandle<()>)> {
        let policy = UpgradePolicy {
            path: self.config.path.clone(),
            allowed_origins: self.config.allowed_origins.clone(),
            max_message_size: self.config.max_frame_size,
        };
        let (local_addr, mut ws_rx) = websocket::start_listener(self.config.bind_addr(), policy).await?;

        let server = Arc::new(self);
        let mut shutdown_rx = server.shutdown_tx.subscribe();

        tokio::spawn(run_heartbeat(
            server.connections.clone(),
            server.config.heartbeat_interval,
            server.shutdown_tx.subscribe(),
        ));

        info!(
            addr = %local_addr,
            path = %server.config.path,
            heartbeat_ms = server.config.heartbeat_interval.as_millis() as u64,
            "vernite-gateway ready"
        );

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("shutdown requested, no longer accepting connections");
                        break;
                    }
                    conn = ws_rx.recv() => match conn {
                        Some(conn) => {
                            let srv = server.clone();
                            tokio::spawn(async move {
                                if let Err(e) = srv.handle_connection(conn).await {
                                    warn!(error = %e, "WebSocket connection error");
                                }
                            });
                        }
                        None => {
                            info!("listener closed, shutting down");
                            break;
                        }
                    },
                }
            }
            drop(ws_rx);
            server.stopping.store(true, Ordering::SeqCst);

            let live = server.connections.len().await;
            info!(live, "closing live connections");
            server.connections.close_all().await;
        });

        Ok((local_addr, handle))
    }

    async fn handle_connection(&self, conn: WebSocketConnection) -> VerniteResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (sink, mut stream, request) = conn.split();

        let user = match self.authenticator.authenticate(&request).await {
            Ok(user) => user,
            Err(e) => {
                let _ = sink.close_with_error("authentication unavailable").await;
                return Err(e);
            }
        };

        let remote = request.remote_address(self.authenticator.forwarded_header());
        let session = Arc::new(ConnectionSession::new(remote, user, sink.clone()));
        if self.stopping.load(Ordering::SeqCst) {
            debug!(session = %session, "shutting down, connection not admitted");
            session.disconnect().await;
            return Ok(());
        }
        self.connections.admit(session.clone()).await;
        // Shutdown may have taken its snapshot of the live set between the
        // check above and admission.
        if self.stopping.load(Ordering::SeqCst) {
            self.connections.evict(&session).await;
            session.disconnect().await;
            return Ok(());
        }
        info!(session = %session, "connection opened");

        let result = self.read_loop(&session, &sink, &mut stream, &mut shutdown_rx).await;

        self.connections.evict(&session).await;
        info!(session = %session, "connection closed");
        result
    }

    async fn read_loop(
        &self,
        session: &ConnectionSession,
        sink: &WebSocketSink,
        stream: &mut SplitStream<WsStream>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> VerniteResult<()> {
        loop {
            let message = tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(session = %session, "read loop stopped by shutdown");
                    return Ok(());
                }
                _ = session.closed() => {
                    debug!(session = %session, "session closed, read loop stopped");
                    return Ok(());
                }
                message = stream.next() => message,
            };

            match message {
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = self.on_binary(session, &data).await {
                        let _ = sink.close_with_error("unexpected error").await;
                        return Err(e);
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    self.relay.handle(&self.connections, session, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(session = %session, "peer closed");
                    return Ok(());
                }
                // Pings are answered by tungstenite.
                Some(Ok(_)) => continue,
                Some(Err(WsError::Capacity(e))) => {
                    let _ = sink.close_with(CloseCode::Size, "frame too large").await;
                    return Err(VerniteError::InvalidMessage(format!(
                        "{e} (max {} bytes)",
                        self.config.max_frame_size
                    )));
                }
                Some(Err(e)) => {
                    debug!(session = %session, error = %e, "WebSocket read failed");
                    return Ok(());
                }
            }
        }
    }

    /// A `KeepAlive` is a heartbeat echo; everything else goes to the
    /// dispatcher.
    async fn on_binary(&self, session: &ConnectionSession, frame: &[u8]) -> VerniteResult<()> {
        let envelope = codec::decode(frame)?;
        if envelope.is::<KeepAlive>() {
            record_pong(session, &envelope);
            return Ok(());
        }
        self.dispatcher.dispatch(session, &envelope).await
    }
}
