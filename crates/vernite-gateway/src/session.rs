//! Per-connection runtime state and the guarded send path.

use crate::store::User;
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use vernite_proto::{codec, Packet, VerniteResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames a session may have queued before it is considered stalled.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Upper bound on closing a transport whose peer stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// One outbound WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

/// Write half of a connection's transport.
pub trait FrameSink: Send + Sync {
    /// Write one frame.
    fn send_frame(&self, frame: Frame) -> BoxFuture<'_, VerniteResult<()>>;

    /// Close the underlying transport.
    fn close(&self) -> BoxFuture<'_, VerniteResult<()>>;
}

/// A live connection as seen by the registry and by handlers.
///
/// Sends never wait on the peer: frames go into a bounded queue drained by
/// the session's own writer task. A full queue or a failed write closes the
/// session, which wakes everything waiting in [`ConnectionSession::closed`].
pub struct ConnectionSession {
    id: u64,
    remote_address: String,
    user: Option<User>,
    closed: Arc<watch::Sender<bool>>,
    outbound: mpsc::Sender<Frame>,
    sink: Arc<dyn FrameSink>,
}

impl ConnectionSession {
    /// Create a session with the next process-wide id and spawn its writer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(remote_address: String, user: Option<User>, sink: Arc<dyn FrameSink>) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let closed = Arc::new(watch::channel(false).0);
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        tokio::spawn(write_frames(id, sink.clone(), closed.clone(), queue));
        Self {
            id,
            remote_address,
            user,
            closed,
            outbound,
            sink,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Forwarded-for address if the proxy supplied one, else the peer address.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Identity resolved at handshake; `None` for anonymous connections.
    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Stop all further sends. Idempotent; leaves the transport alone.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Resolves once the session is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Encode and queue a packet. Returns whether it was accepted.
    pub fn send<P: Packet>(&self, packet: &P) -> bool {
        if self.is_closed() {
            return false;
        }
        match codec::encode(packet) {
            Ok(frame) => self.send_frame(Frame::Binary(frame)),
            Err(e) => {
                warn!(session = %self, type_name = P::TYPE_NAME, error = %e, "failed to encode packet");
                false
            }
        }
    }

    /// Queue a plain text frame.
    pub fn send_text(&self, text: &str) -> bool {
        self.send_frame(Frame::Text(text.to_string()))
    }

    /// Queue an already-encoded frame. A full queue means the peer stopped
    /// reading; the session is closed and the frame dropped.
    pub fn send_frame(&self, frame: Frame) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session = %self, "outbound queue full, closing session");
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                false
            }
        }
    }

    /// Close the session and the transport (server shutdown).
    pub async fn disconnect(&self) {
        self.close();
        close_transport(self.id, self.sink.as_ref()).await;
    }
}

/// Writer task: drains the outbound queue into the transport until the
/// session closes. A write in flight is abandoned when the session closes.
async fn write_frames(
    id: u64,
    sink: Arc<dyn FrameSink>,
    closed: Arc<watch::Sender<bool>>,
    mut queue: mpsc::Receiver<Frame>,
) {
    let mut closed_rx = closed.subscribe();
    loop {
        let frame = tokio::select! {
            biased;
            _ = wait_closed(&mut closed_rx) => return,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };
        let written = tokio::select! {
            biased;
            _ = wait_closed(&mut closed_rx) => return,
            written = sink.send_frame(frame) => written,
        };
        if let Err(e) = written {
            warn!(session = id, error = %e, "send failed, closing session");
            closed.send_replace(true);
            close_transport(id, sink.as_ref()).await;
            return;
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn close_transport(id: u64, sink: &dyn FrameSink) {
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(session = id, error = %e, "transport close failed"),
        Err(_) => debug!(session = id, "transport close timed out"),
    }
}

impl fmt::Display for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "[id={}, ip={}, user={user}]", self.id, self.remote_address),
            None => write!(f, "[id={}, ip={}, anonymous]", self.id, self.remote_address),
        }
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("remote_address", &self.remote_address)
            .field("user", &self.user)
            .field("closed", &self.is_closed())
            .finish()
    }
}
