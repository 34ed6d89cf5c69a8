//! Live connection registry: admission, eviction and fan-out.
//!
//! Fan-out never sends while the registry lock is held: it copies the
//! matching sessions out first, so admit/evict proceed while a broadcast or
//! heartbeat sweep is in flight. Sends only enqueue, so a peer that stops
//! reading never holds up a sweep or the other recipients.
//!
//! A session that closes on its own (failed write, full queue) is removed
//! by the reaper task spawned at admission, so every registered session is
//! open.

use crate::heartbeat::now_millis;
use crate::session::{ConnectionSession, Frame};
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use vernite_proto::packets::KeepAlive;
use vernite_proto::{codec, Packet};

#[derive(Default)]
struct Members {
    sessions: HashMap<u64, Arc<ConnectionSession>>,
    /// User id → ids of that user's sessions.
    by_user: HashMap<u64, HashSet<u64>>,
}

/// Set of currently open connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    members: Arc<RwLock<Members>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the live set. It leaves again on [`Self::evict`] or
    /// as soon as it closes.
    pub async fn admit(&self, session: Arc<ConnectionSession>) {
        {
            let mut members = self.members.write().await;
            if let Some(user) = session.user() {
                members.by_user.entry(user.id).or_default().insert(session.id());
            }
            members.sessions.insert(session.id(), session.clone());
            debug!(count = members.sessions.len(), "session admitted");
        }

        let members = self.members.clone();
        tokio::spawn(async move {
            session.closed().await;
            if remove(&members, &session).await {
                debug!(session = %session, "closed session reaped");
            }
        });
    }

    /// Remove a session and stop its sends. Returns whether it was present.
    pub async fn evict(&self, session: &ConnectionSession) -> bool {
        let removed = remove(&self.members, session).await;
        session.close();
        removed
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, session_id: u64) -> bool {
        self.members.read().await.sessions.contains_key(&session_id)
    }

    pub async fn get(&self, session_id: u64) -> Option<Arc<ConnectionSession>> {
        self.members.read().await.sessions.get(&session_id).cloned()
    }

    /// Copy of the current live set.
    pub async fn snapshot(&self) -> Vec<Arc<ConnectionSession>> {
        self.members.read().await.sessions.values().cloned().collect()
    }

    /// Sessions belonging to a user.
    pub async fn user_sessions(&self, user_id: u64) -> Vec<Arc<ConnectionSession>> {
        let members = self.members.read().await;
        members
            .by_user
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| members.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Send a packet to every live session. Returns the number of sessions
    /// that accepted it; a failing recipient never affects the others.
    pub async fn broadcast<P: Packet>(&self, packet: &P) -> usize {
        let targets = self.snapshot().await;
        deliver(targets, packet)
    }

    /// Send a packet to the live sessions matching `filter`.
    pub async fn broadcast_where<P, F>(&self, filter: F, packet: &P) -> usize
    where
        P: Packet,
        F: Fn(&ConnectionSession) -> bool,
    {
        let targets = self
            .snapshot()
            .await
            .into_iter()
            .filter(|s| filter(s))
            .collect();
        deliver(targets, packet)
    }

    /// Send a packet to every live session of one user.
    pub async fn send_to_user<P: Packet>(&self, user_id: u64, packet: &P) -> usize {
        let targets = self.user_sessions(user_id).await;
        deliver(targets, packet)
    }

    /// Send a text frame to every live session except `sender_id`.
    pub async fn broadcast_text_except(&self, sender_id: u64, text: &str) -> usize {
        self.snapshot()
            .await
            .iter()
            .filter(|s| s.id() != sender_id)
            .filter(|s| s.send_frame(Frame::Text(text.to_string())))
            .count()
    }

    /// Ping every live session with the current time.
    pub async fn heartbeat(&self) -> usize {
        self.broadcast(&KeepAlive { id: now_millis() }).await
    }

    /// Close every session and its transport.
    pub async fn close_all(&self) {
        let sessions = self.snapshot().await;
        join_all(sessions.iter().map(|s| s.disconnect())).await;
    }
}

async fn remove(members: &RwLock<Members>, session: &ConnectionSession) -> bool {
    let mut members = members.write().await;
    let removed = members.sessions.remove(&session.id()).is_some();
    if let Some(user) = session.user() {
        if let Some(ids) = members.by_user.get_mut(&user.id) {
            ids.remove(&session.id());
            if ids.is_empty() {
                members.by_user.remove(&user.id);
            }
        }
    }
    if removed {
        debug!(count = members.sessions.len(), "session evicted");
    }
    removed
}

fn deliver<P: Packet>(targets: Vec<Arc<ConnectionSession>>, packet: &P) -> usize {
    if targets.is_empty() {
        return 0;
    }
    let frame = match codec::encode(packet) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(type_name = P::TYPE_NAME, error = %e, "failed to encode broadcast packet");
            return 0;
        }
    };
    let delivered = targets
        .iter()
        .filter(|s| s.send_frame(Frame::Binary(frame.clone())))
        .count();
    debug!(
        type_name = P::TYPE_NAME,
        recipients = targets.len(),
        delivered,
        "broadcast packet"
    );
    delivered
}
