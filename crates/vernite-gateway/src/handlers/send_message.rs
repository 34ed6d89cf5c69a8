//! `SendMessage`: post a chat message through the user's integration.

use crate::dispatch::Handler;
use crate::registry::ConnectionRegistry;
use crate::session::ConnectionSession;
use crate::store::User;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};
use vernite_proto::packets::SendMessage;
use vernite_proto::VerniteResult;

/// The only provider the gateway forwards to.
pub const SLACK_PROVIDER: &str = "slack";

/// Chat-integration backend.
///
/// Implementations resolve `request.integration_id`, check it belongs to
/// `user` and post `request.content` to `request.channel`.
pub trait Communicator: Send + Sync {
    fn post_message<'a>(
        &'a self,
        user: &'a User,
        request: &'a SendMessage,
    ) -> BoxFuture<'a, VerniteResult<()>>;
}

pub struct SendMessageHandler {
    communicator: Arc<dyn Communicator>,
}

impl SendMessageHandler {
    pub fn new(communicator: Arc<dyn Communicator>) -> Self {
        Self { communicator }
    }
}

impl Handler for SendMessageHandler {
    type Packet = SendMessage;

    fn handle<'a>(
        &'a self,
        _connections: &'a ConnectionRegistry,
        session: &'a ConnectionSession,
        packet: SendMessage,
    ) -> BoxFuture<'a, VerniteResult<()>> {
        Box::pin(async move {
            let Some(user) = session.user() else {
                warn!(session = %session, "SendMessage from anonymous connection");
                return Ok(());
            };
            if packet.provider != SLACK_PROVIDER {
                warn!(session = %session, provider = %packet.provider, "unsupported provider");
                return Ok(());
            }
            match self.communicator.post_message(user, &packet).await {
                Ok(()) => debug!(
                    session = %session,
                    integration_id = packet.integration_id,
                    channel = %packet.channel,
                    "message posted"
                ),
                Err(e) => warn!(
                    session = %session,
                    integration_id = packet.integration_id,
                    error = %e,
                    "failed to post message"
                ),
            }
            Ok(())
        })
    }
}
