//! Plain-text relay: every text frame is forwarded to all other connections.
//!
//! Text frames bypass the envelope entirely; this path exists next to the
//! typed dispatcher rather than inside it.

use crate::registry::ConnectionRegistry;
use crate::session::ConnectionSession;
use tracing::trace;

#[derive(Debug, Default, Clone, Copy)]
pub struct TextRelayHandler;

impl TextRelayHandler {
    /// Forward `text` from `sender` to every other live session. Returns the
    /// number of sessions reached.
    pub async fn handle(
        &self,
        connections: &ConnectionRegistry,
        sender: &ConnectionSession,
        text: &str,
    ) -> usize {
        let delivered = connections.broadcast_text_except(sender.id(), text).await;
        trace!(session = %sender, bytes = text.len(), delivered, "relayed text frame");
        delivered
    }
}
