//! Heartbeat: periodic `KeepAlive` pings and round-trip latency logging.
//!
//! Liveness is diagnostic only. A peer that stops answering is not
//! disconnected; dead peers are dropped when a write to them fails or their
//! outbound queue fills up. A sweep only enqueues, so it never waits on a
//! peer.

use crate::registry::ConnectionRegistry;
use crate::session::ConnectionSession;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};
use vernite_proto::packets::KeepAlive;
use vernite_proto::Envelope;

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Ping every live session each `interval` until shutdown is signalled.
pub async fn run_heartbeat(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let delivered = registry.heartbeat().await;
                trace!(delivered, "heartbeat sent");
            }
            _ = shutdown.recv() => {
                debug!("heartbeat stopped");
                return;
            }
        }
    }
}

/// Handle a `KeepAlive` echoed back by a client: log the round trip.
///
/// Returns the measured latency in milliseconds, or `None` if the payload
/// could not be decoded.
pub fn record_pong(session: &ConnectionSession, envelope: &Envelope) -> Option<i64> {
    match envelope.unpack::<KeepAlive>() {
        Ok(pong) => {
            let latency_ms = now_millis() - pong.id;
            debug!(session = %session, latency_ms, "heartbeat acknowledged");
            Some(latency_ms)
        }
        Err(e) => {
            warn!(session = %session, error = %e, "malformed KeepAlive");
            None
        }
    }
}
